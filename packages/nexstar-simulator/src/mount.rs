//! mount.rs — the simulated mount
//!
//! Aggregates the AUX bus and every device hanging off it, advances the
//! simulation clock, and turns mechanical axis positions into the pointing
//! the sky actually sees (cone error, axis non-perpendicularity, periodic
//! error). Everything the TUI / web console may show is exposed through a
//! read-only snapshot; neither UI lives in this crate.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

use crate::bus::{AuxBus, GenericDevice};
use crate::motor::{MotorController, MotorParams};
use crate::power::PowerModule;
use crate::wifi::WiFiModule;
use crate::SimulatorConfig;
use aux_types::addr;

const MESSAGE_LOG_CAPACITY: usize = 10;

/// Observer site, rewritable at runtime through the WiFi SET_LOCATION
/// command and read by the sky-chart coordinate transform.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Observer {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Meters above sea level.
    pub elevation: f64,
}

pub type SharedObserver = Arc<Mutex<Observer>>;
pub type SharedMount = Arc<tokio::sync::Mutex<Mount>>;

/// Read-only state snapshot for UI consumers.
#[derive(Debug, Clone, Serialize)]
pub struct MountView {
    pub azm_pos: f64,
    pub alt_pos: f64,
    pub azm_slewing: bool,
    pub alt_slewing: bool,
    pub sky_az: f64,
    pub sky_alt: f64,
    pub sim_time: f64,
    pub dropped_frames: u64,
    pub messages: Vec<String>,
    pub traffic: Vec<String>,
}

pub struct Mount {
    bus: AuxBus,
    azm: Arc<Mutex<MotorController>>,
    alt: Arc<Mutex<MotorController>>,
    observer: SharedObserver,

    sim_time: f64,
    cone_error: f64,
    non_perp: f64,
    pe_amplitude: f64,
    pe_period: f64,
    refraction_enabled: bool,
    clock_drift: f64,

    messages: Mutex<VecDeque<String>>,
}

impl Mount {
    pub fn new(cfg: &SimulatorConfig, observer: SharedObserver) -> Mount {
        let imp = &cfg.imperfections;
        let params = MotorParams {
            version: cfg.mc_version,
            backlash_steps: imp.backlash_steps,
            encoder_jitter_steps: imp.encoder_jitter_steps,
            alt_min: cfg.alt_min_deg / 360.0,
            alt_max: cfg.alt_max_deg / 360.0,
        };

        let azm = Arc::new(Mutex::new(MotorController::new(addr::AZM, &params)));
        let alt = Arc::new(Mutex::new(MotorController::new(addr::ALT, &params)));

        // The address map is fixed hardware wiring; a collision here is a
        // bug in this constructor, not a runtime condition.
        let mut bus = AuxBus::new();
        bus.register(azm.clone()).expect("AUX address map");
        bus.register(alt.clone()).expect("AUX address map");
        bus.register(Arc::new(Mutex::new(PowerModule::battery(addr::BAT))))
            .expect("AUX address map");
        bus.register(Arc::new(Mutex::new(PowerModule::charger(addr::CHG))))
            .expect("AUX address map");
        bus.register(Arc::new(Mutex::new(WiFiModule::new(
            addr::WIFI,
            observer.clone(),
        ))))
        .expect("AUX address map");
        bus.register(Arc::new(Mutex::new(GenericDevice::new(addr::MB, [2, 0, 0, 0]))))
            .expect("AUX address map");
        bus.register(Arc::new(Mutex::new(GenericDevice::new(
            addr::LIGHTS,
            [7, 11, 0, 0],
        ))))
        .expect("AUX address map");
        // Hand controller, focuser and StarSense are deliberately absent:
        // those addresses must stay silent when clients scan the bus.

        Mount {
            bus,
            azm,
            alt,
            observer,
            sim_time: 0.0,
            cone_error: imp.cone_error_arcmin / (360.0 * 60.0),
            non_perp: imp.non_perpendicularity_arcmin / (360.0 * 60.0),
            pe_amplitude: imp.periodic_error_arcsec / (360.0 * 3600.0),
            pe_period: imp.periodic_error_period_sec,
            refraction_enabled: imp.refraction_enabled,
            clock_drift: imp.clock_drift,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Advance the simulation clock and every device by `dt` wall-clock
    /// seconds, stretched by the configured clock drift.
    pub fn tick(&mut self, dt: f64) {
        let actual = dt * (1.0 + self.clock_drift);
        self.sim_time += actual;
        self.bus.tick(actual);
    }

    /// Feed raw AUX bytes through the bus; returns the echo + replies.
    pub fn handle_stream(&mut self, data: &[u8]) -> Vec<u8> {
        self.bus.handle_stream(data)
    }

    /// Actual pointing (fractions of a turn) derived from the mechanical
    /// axis positions and the configured imperfections.
    pub fn get_sky_altaz(&self) -> (f64, f64) {
        let alt_pos = self.alt.lock().unwrap().position();
        let azm_pos = self.azm.lock().unwrap().position();

        let sky_alt = alt_pos + self.cone_error;

        // The azimuth offset grows with tan(alt); clamp so it stays finite
        // near the zenith.
        let alt_deg = (sky_alt * 360.0).clamp(-80.0, 80.0);
        let mut sky_az = azm_pos + self.non_perp * alt_deg.to_radians().tan() / 360.0;

        if self.pe_period > 0.0 {
            sky_az += self.pe_amplitude * (TAU * self.sim_time / self.pe_period).sin();
        }

        (sky_az.rem_euclid(1.0), sky_alt)
    }

    /// Altitude as the sky chart should see it: Bennett's refraction is
    /// applied on the way out to chart clients, not to the mechanical model.
    pub fn refracted_alt(&self, sky_alt: f64) -> f64 {
        if !self.refraction_enabled {
            return sky_alt;
        }
        let h = sky_alt * 360.0;
        if h < -1.0 {
            return sky_alt;
        }
        let refraction_arcmin = 1.0 / (h + 7.31 / (h + 4.4)).to_radians().tan();
        sky_alt + refraction_arcmin / (60.0 * 360.0)
    }

    /// Log a system message for the UI, dropping consecutive duplicates.
    pub fn push_msg(&self, msg: &str) {
        let mut messages = self.messages.lock().unwrap();
        if messages.back().map(String::as_str) != Some(msg) {
            if messages.len() == MESSAGE_LOG_CAPACITY {
                messages.pop_front();
            }
            messages.push_back(msg.to_string());
        }
        info!("{msg}");
    }

    pub fn observer(&self) -> SharedObserver {
        self.observer.clone()
    }

    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    #[cfg(test)]
    pub(crate) fn set_sim_time(&mut self, t: f64) {
        self.sim_time = t;
    }

    #[cfg(test)]
    pub(crate) fn axes(&self) -> (Arc<Mutex<MotorController>>, Arc<Mutex<MotorController>>) {
        (self.azm.clone(), self.alt.clone())
    }

    pub fn view(&self) -> MountView {
        let (sky_az, sky_alt) = self.get_sky_altaz();
        let (azm_pos, azm_slewing) = {
            let azm = self.azm.lock().unwrap();
            (azm.position(), azm.is_slewing())
        };
        let (alt_pos, alt_slewing) = {
            let alt = self.alt.lock().unwrap();
            (alt.position(), alt.is_slewing())
        };
        MountView {
            azm_pos,
            alt_pos,
            azm_slewing,
            alt_slewing,
            sky_az,
            sky_alt,
            sim_time: self.sim_time(),
            dropped_frames: self.bus.dropped_frames(),
            messages: self.messages.lock().unwrap().iter().cloned().collect(),
            traffic: self.bus.traffic().snapshot(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::AuxDevice;
    use crate::ImperfectionConfig;
    use aux_types::{cmd, encode, pack_u24};
    use hex_literal::hex;

    fn mount_with(imperfections: ImperfectionConfig) -> Mount {
        let cfg = SimulatorConfig {
            imperfections,
            ..SimulatorConfig::default()
        };
        let observer = Arc::new(Mutex::new(Observer {
            latitude: 50.1822,
            longitude: 19.7925,
            elevation: 400.0,
        }));
        Mount::new(&cfg, observer)
    }

    fn perfect_mount() -> Mount {
        mount_with(ImperfectionConfig {
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        })
    }

    fn set_axis(axis: &Arc<Mutex<MotorController>>, pos: f64) {
        axis.lock()
            .unwrap()
            .dispatch(0x20, cmd::MC_SET_POSITION, &pack_u24(pos));
    }

    // ── Protocol exchanges ────────────────────────────────────────────────────

    #[test]
    fn test_wifi_handshake_sequence() {
        let mut mount = perfect_mount();

        // GET_VER → WiFly 2.40
        let request = encode(0x20, 0xB5, 0xFE, &[]);
        let mut expected = request.clone();
        expected.extend_from_slice(&encode(0xB5, 0x20, 0xFE, &[2, 40, 0, 0]));
        assert_eq!(mount.handle_stream(&request), expected);

        // PING
        let response = mount.handle_stream(&hex!("3B 03 20 B5 49 DF"));
        assert_eq!(
            &response[6..],
            hex!("3B 04 B5 20 49 00 DE"),
            "PING must answer 0x00"
        );

        // CONFIG blob
        let request = encode(0x20, 0xB5, 0x32, &hex!("31 06 73 9D"));
        let response = mount.handle_stream(&request);
        assert_eq!(&response[request.len()..], hex!("3B 04 B5 20 32 01 F4"));

        // SET_LOCATION as captured in client session logs
        let request = encode(0x20, 0xB5, 0x31, &hex!("42 48 B7 2D 41 9E 46 AA"));
        let response = mount.handle_stream(&request);
        assert_eq!(&response[request.len()..], hex!("3B 04 B5 20 31 01 F5"));
    }

    #[test]
    fn test_set_location_reaches_observer() {
        let mut mount = perfect_mount();
        let mut payload = Vec::new();
        payload.extend_from_slice(&50.179_f32.to_le_bytes());
        payload.extend_from_slice(&19.784_f32.to_le_bytes());
        mount.handle_stream(&encode(0x20, 0xB5, 0x31, &payload));

        let observer = mount.observer();
        let observer = observer.lock().unwrap();
        assert!((observer.latitude - 50.179).abs() < 1e-3);
        assert!((observer.longitude - 19.784).abs() < 1e-3);
    }

    #[test]
    fn test_motor_identification() {
        let mut mount = perfect_mount();

        let response = mount.handle_stream(&hex!("3B 03 20 10 FE CF"));
        assert_eq!(&response[..6], hex!("3B 03 20 10 FE CF"));
        assert_eq!(&response[6..11], hex!("3B 07 10 20 FE"));
        assert_eq!(&response[11..15], hex!("07 0B 13 EC"), "version 7.11.19.236");

        let response = mount.handle_stream(&hex!("3B 03 20 10 05 C8"));
        assert_eq!(&response[11..13], hex!("16 87"), "Evolution model id");
    }

    #[test]
    fn test_silent_accessories() {
        let mut mount = perfect_mount();
        // Focuser, hand controller, StarSense: echo only, nothing appended.
        for request in [
            hex!("3B 03 20 12 FE CD").to_vec(),
            encode(0x20, 0x04, 0xFE, &[]),
            encode(0x20, 0xB4, 0xFE, &[]),
            encode(0x20, 0xB9, 0xFE, &[]),
        ] {
            assert_eq!(mount.handle_stream(&request), request);
        }
    }

    #[test]
    fn test_echo_always_prefixes_response() {
        let mut mount = perfect_mount();
        for request in [
            encode(0x20, 0x10, 0x01, &[]),
            encode(0x20, 0x11, 0x13, &[]),
            encode(0x20, 0xB6, 0x10, &[]),
            encode(0x20, 0xBF, 0xFE, &[]),
        ] {
            let response = mount.handle_stream(&request);
            assert!(response.starts_with(&request));
        }
    }

    #[test]
    fn test_goto_through_the_bus() {
        let mut mount = perfect_mount();
        mount.handle_stream(&encode(0x20, 0x10, cmd::MC_SET_POSITION, &pack_u24(0.0)));
        mount.handle_stream(&encode(0x20, 0x10, cmd::MC_GOTO_FAST, &pack_u24(0.25)));
        for _ in 0..600 {
            mount.tick(0.1);
        }
        let response = mount.handle_stream(&encode(0x20, 0x10, cmd::MC_GET_POSITION, &[]));
        // Echo (6) + reply header (5) + 3 position bytes + checksum.
        let position = aux_types::unpack_u24(&response[11..14]).unwrap();
        assert!((position - 0.25).abs() < 1.0 / aux_types::ENCODER_STEPS);

        let response = mount.handle_stream(&encode(0x20, 0x10, cmd::MC_SLEW_DONE, &[]));
        assert_eq!(response[11], 0xFF);
    }

    // ── Sky model ─────────────────────────────────────────────────────────────

    #[test]
    fn test_cone_error_offsets_altitude() {
        let mount = mount_with(ImperfectionConfig {
            cone_error_arcmin: 10.0,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        let (sky_az, sky_alt) = mount.get_sky_altaz();
        assert!((sky_alt - 10.0 / (60.0 * 360.0)).abs() < 1e-12);
        assert_eq!(sky_az, 0.0);
    }

    #[test]
    fn test_non_perpendicularity_at_45_degrees() {
        let mount = mount_with(ImperfectionConfig {
            non_perpendicularity_arcmin: 10.0,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        let (_, alt_axis) = mount.axes();
        set_axis(&alt_axis, 45.0 / 360.0);
        let (sky_az, _) = mount.get_sky_altaz();
        // tan(45°) = 1: the full 10 arcmin shows up in azimuth.
        let expected = (10.0 / 60.0) / 360.0;
        assert!((sky_az - expected).abs() < expected * 1e-6);
    }

    #[test]
    fn test_non_perpendicularity_clamped_near_zenith() {
        let mount = mount_with(ImperfectionConfig {
            non_perpendicularity_arcmin: 10.0,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        let (_, alt_axis) = mount.axes();
        set_axis(&alt_axis, 89.9 / 360.0);
        let (sky_az, _) = mount.get_sky_altaz();
        let expected = (10.0 / 60.0) * 80.0_f64.to_radians().tan() / 360.0;
        assert!((sky_az - expected).abs() < expected * 1e-6);
    }

    #[test]
    fn test_periodic_error_quarter_period() {
        let mut mount = mount_with(ImperfectionConfig {
            periodic_error_arcsec: 3600.0,
            periodic_error_period_sec: 100.0,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        mount.set_sim_time(25.0); // sin(2π·25/100) = 1
        let (sky_az, _) = mount.get_sky_altaz();
        assert!((sky_az - 1.0 / 360.0).abs() < 1e-9);
    }

    #[test]
    fn test_refraction_applied_only_when_enabled() {
        let dry = perfect_mount();
        assert_eq!(dry.refracted_alt(45.0 / 360.0), 45.0 / 360.0);

        let humid = mount_with(ImperfectionConfig {
            refraction_enabled: true,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        let h: f64 = 45.0;
        let expected_arcmin = 1.0 / (h + 7.31 / (h + 4.4)).to_radians().tan();
        let refracted = humid.refracted_alt(h / 360.0);
        assert!((refracted - (h / 360.0 + expected_arcmin / (60.0 * 360.0))).abs() < 1e-12);
    }

    #[test]
    fn test_clock_drift_stretches_sim_time() {
        let mut mount = mount_with(ImperfectionConfig {
            clock_drift: 0.5,
            backlash_steps: 0,
            ..ImperfectionConfig::default()
        });
        mount.tick(10.0);
        assert!((mount.sim_time() - 15.0).abs() < 1e-12);
    }

    // ── View and logs ─────────────────────────────────────────────────────────

    #[test]
    fn test_message_log_dedupes_and_bounds() {
        let mount = perfect_mount();
        mount.push_msg("Connection closed.");
        mount.push_msg("Connection closed.");
        assert_eq!(mount.view().messages.len(), 1);
        for n in 0..20 {
            mount.push_msg(&format!("msg {n}"));
        }
        let view = mount.view();
        assert_eq!(view.messages.len(), 10);
        assert_eq!(view.messages.last().unwrap(), "msg 19");
    }

    #[test]
    fn test_view_reflects_axis_state() {
        let mut mount = perfect_mount();
        mount.handle_stream(&encode(0x20, 0x11, cmd::MC_GOTO_FAST, &pack_u24(0.1)));
        let view = mount.view();
        assert!(view.alt_slewing);
        assert!(!view.azm_slewing);
        assert!(!view.traffic.is_empty());
    }
}
