//! main.rs — NexStar Evolution simulator entry point
//!
//! Runs the cooperative task tree:
//!   1. Tick loop: integrates mount physics every 100 ms of wall clock
//!   2. AUX gateway: transparent bridge to the simulated bus on port 2000
//!   3. Stellarium server + 10 Hz status broadcaster on port 10001
//!   4. UDP discovery beacon every 5 s
//!
//! All mount state lives behind one async mutex; handlers and the tick
//! loop take it for the duration of their work, which is the entire
//! concurrency story.

mod bus;
mod coords;
mod discovery;
mod gateway;
mod motor;
mod mount;
mod power;
mod stellarium;
mod wifi;

use std::fs::File;
use std::io::{self, Write as _};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use mount::{Mount, Observer, SharedMount, SharedObserver};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "nexstar-sim", about = "Celestron NexStar Evolution mount simulator")]
struct Args {
    /// Headless text mode (the TUI ships as a separate console)
    #[arg(short = 't', long)]
    text: bool,
    /// Custom configuration file path
    #[arg(short = 'c', long)]
    config: Option<String>,
    /// AUX port override
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// Stellarium port override
    #[arg(short = 's', long)]
    stellarium: Option<u16>,
    /// Web console port override (consumed by the external 3D console)
    #[arg(long)]
    web_port: Option<u16>,
    /// Disable all mechanical imperfections
    #[arg(long)]
    perfect: bool,
    /// Enable debug logging to stderr
    #[arg(short = 'd', long)]
    debug: bool,
    /// Enable detailed debug logging to a file
    #[arg(long)]
    debug_log: bool,
    /// Debug log file path
    #[arg(long, default_value = "nexstar_sim_debug.log")]
    debug_log_file: String,
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FullConfig {
    pub observer: ObserverConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            latitude: 50.1822,
            longitude: 19.7925,
            elevation: 400.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub aux_port: u16,
    pub stellarium_port: u16,
    pub web_port: u16,
    pub alt_min_deg: f64,
    pub alt_max_deg: f64,
    pub mc_version: [u8; 4],
    pub imperfections: ImperfectionConfig,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            aux_port: 2000,
            stellarium_port: 10001,
            web_port: 8080,
            alt_min_deg: -22.5,
            alt_max_deg: 90.0,
            mc_version: [7, 11, 19, 236],
            imperfections: ImperfectionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImperfectionConfig {
    pub cone_error_arcmin: f64,
    pub non_perpendicularity_arcmin: f64,
    pub periodic_error_arcsec: f64,
    pub periodic_error_period_sec: f64,
    pub backlash_steps: u8,
    pub encoder_jitter_steps: u32,
    pub refraction_enabled: bool,
    pub clock_drift: f64,
}

impl Default for ImperfectionConfig {
    fn default() -> Self {
        Self {
            cone_error_arcmin: 0.0,
            non_perpendicularity_arcmin: 0.0,
            periodic_error_arcsec: 0.0,
            periodic_error_period_sec: 480.0,
            backlash_steps: 50,
            encoder_jitter_steps: 0,
            refraction_enabled: false,
            clock_drift: 0.0,
        }
    }
}

impl ImperfectionConfig {
    /// `--perfect`: an ideal mount with no mechanical or optical flaws.
    pub fn perfect() -> Self {
        Self {
            backlash_steps: 0,
            ..Self::default()
        }
    }
}

fn load_config(path: Option<&str>) -> Result<FullConfig> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("reading config {p}"))?,
        // A config.toml next to the binary wins; otherwise the built-in
        // defaults apply. Partial files merge over the serde defaults.
        None => std::fs::read_to_string("config.toml")
            .unwrap_or_else(|_| include_str!("../config.toml").to_string()),
    };
    toml::from_str(&text).context("parsing configuration")
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// Writes every log line to stderr and, when `--debug-log` is given, to the
/// debug log file as well.
#[derive(Clone)]
struct LogTee {
    file: Option<Arc<Mutex<File>>>,
}

struct LogTeeWriter {
    file: Option<Arc<Mutex<File>>>,
}

impl io::Write for LogTeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap().write_all(buf);
        }
        io::stderr().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap().flush();
        }
        io::stderr().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogTee {
    type Writer = LogTeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogTeeWriter {
            file: self.file.clone(),
        }
    }
}

fn init_logging(args: &Args) {
    let filter = if args.debug || args.debug_log {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("nexstar_sim=info,aux_types=info"))
    };

    let file = if args.debug_log {
        match File::create(&args.debug_log_file) {
            Ok(f) => Some(Arc::new(Mutex::new(f))),
            Err(e) => {
                eprintln!("could not open debug log {}: {e}", args.debug_log_file);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(file.is_none())
        .with_writer(LogTee { file })
        .init();
}

// ── Tick loop ─────────────────────────────────────────────────────────────────

/// Advance the physical model with the measured wall-clock delta. Clock
/// drift scaling happens inside the mount.
async fn tick_loop(mount: SharedMount, shutdown: CancellationToken) {
    let mut ticker = interval(Duration::from_millis(100));
    let mut last = Instant::now();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let dt = now.duration_since(last).as_secs_f64();
                last = now;
                mount.lock().await.tick(dt);
            }
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let mut cfg = match load_config(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        cfg.simulator.aux_port = port;
    }
    if let Some(port) = args.stellarium {
        cfg.simulator.stellarium_port = port;
    }
    if let Some(port) = args.web_port {
        cfg.simulator.web_port = port;
    }
    if args.perfect {
        cfg.simulator.imperfections = ImperfectionConfig::perfect();
    }

    info!(
        "🔭 NexStar Evolution simulator v{} starting — AUX port {}, Stellarium port {}",
        env!("CARGO_PKG_VERSION"),
        cfg.simulator.aux_port,
        cfg.simulator.stellarium_port
    );
    if !args.text {
        info!("terminal UI ships as a separate console; running headless");
    }
    debug!("external web console expected on port {}", cfg.simulator.web_port);

    let observer: SharedObserver = Arc::new(Mutex::new(Observer {
        latitude: cfg.observer.latitude,
        longitude: cfg.observer.longitude,
        elevation: cfg.observer.elevation,
    }));
    let mount: SharedMount = Arc::new(tokio::sync::Mutex::new(Mount::new(
        &cfg.simulator,
        observer,
    )));

    let aux_listener = match TcpListener::bind(("0.0.0.0", cfg.simulator.aux_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not bind AUX port {}: {e}", cfg.simulator.aux_port);
            std::process::exit(1);
        }
    };
    let stellarium_listener =
        match TcpListener::bind(("0.0.0.0", cfg.simulator.stellarium_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "could not bind Stellarium port {}: {e}",
                    cfg.simulator.stellarium_port
                );
                std::process::exit(1);
            }
        };

    let shutdown = CancellationToken::new();
    let (status_tx, _) = broadcast::channel::<Vec<u8>>(16);

    let tasks = vec![
        tokio::spawn(discovery::broadcast(cfg.simulator.aux_port, shutdown.clone())),
        tokio::spawn(tick_loop(mount.clone(), shutdown.clone())),
        tokio::spawn(stellarium::broadcast_status(
            mount.clone(),
            status_tx.clone(),
            shutdown.clone(),
        )),
        tokio::spawn(gateway::serve(aux_listener, mount.clone(), shutdown.clone())),
        tokio::spawn(stellarium::serve(
            stellarium_listener,
            mount.clone(),
            status_tx,
            shutdown.clone(),
        )),
    ];

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => warn!("signal handler failed: {e}; shutting down"),
    }
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
}
