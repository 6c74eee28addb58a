//! bus.rs — AUX bus dispatch
//!
//! Owns every simulated device by bus address and turns a raw byte stream
//! into echoes plus device replies:
//!   1. Split the stream into frames; drop anything that fails verification
//!   2. Echo the original frame (the hardware WiFi bridge always echoes)
//!   3. Route to the addressed device, if one is registered
//!   4. Wrap a handled command's payload into a reply with src/dst swapped
//!
//! Unknown addresses and unhandled commands stay silent: clients scan the
//! bus and take a missing reply as "nobody home", so a stray NAK would show
//! up as a phantom device.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use tracing::debug;

use aux_types::{self as aux, cmd, command_name, target_name, Framer};

/// How many dispatch records the traffic log keeps for the UI.
const TRAFFIC_LOG_CAPACITY: usize = 30;

// ── Device contract ───────────────────────────────────────────────────────────

/// One simulated device on the AUX bus.
///
/// `dispatch` returns `Some(payload)` when the device handles the command
/// (an empty payload is a plain acknowledgement) and `None` when it does
/// not, in which case the bus sends nothing at all. `GET_VER` is answered
/// uniformly by the bus from `firmware_version`.
pub trait AuxDevice: Send {
    fn device_id(&self) -> u8;
    fn firmware_version(&self) -> [u8; 4];
    fn dispatch(&mut self, sender: u8, command: u8, data: &[u8]) -> Option<Vec<u8>>;
    fn tick(&mut self, _dt: f64) {}
}

/// Devices are shared between the bus and the mount aggregate (the sky
/// model reads motor positions directly), so they live behind a mutex.
pub type SharedDevice = Arc<Mutex<dyn AuxDevice>>;

/// Minimal responder for boards that only answer `GET_VER`: the main board
/// and the light controller.
pub struct GenericDevice {
    id: u8,
    version: [u8; 4],
}

impl GenericDevice {
    pub fn new(id: u8, version: [u8; 4]) -> Self {
        Self { id, version }
    }
}

impl AuxDevice for GenericDevice {
    fn device_id(&self) -> u8 {
        self.id
    }

    fn firmware_version(&self) -> [u8; 4] {
        self.version
    }

    fn dispatch(&mut self, _sender: u8, _command: u8, _data: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

// ── Traffic log ───────────────────────────────────────────────────────────────

/// Bounded append-only record of dispatched commands, consumed by the UI.
/// Cloning hands out another handle to the same ring.
#[derive(Clone, Default)]
pub struct TrafficLog {
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl TrafficLog {
    fn record(&self, _src: u8, dst: u8, command: u8) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == TRAFFIC_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(format!("{}: {}", target_name(dst), command_name(command)));
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

pub struct AuxBus {
    devices: HashMap<u8, SharedDevice>,
    framer: Framer,
    traffic: TrafficLog,
    dropped_frames: u64,
}

impl AuxBus {
    pub fn new() -> Self {
        Self {
            devices: HashMap::new(),
            framer: Framer::new(),
            traffic: TrafficLog::default(),
            dropped_frames: 0,
        }
    }

    /// Register a device under its bus address. Each address has exactly
    /// one owner; a second registration is a wiring bug.
    pub fn register(&mut self, device: SharedDevice) -> Result<()> {
        let id = device.lock().unwrap().device_id();
        if self.devices.contains_key(&id) {
            bail!("duplicate AUX device registration at 0x{id:02x}");
        }
        self.devices.insert(id, device);
        Ok(())
    }

    /// Process incoming bytes, returning everything that goes back on the
    /// wire: for each valid frame the echo, then the reply if the addressed
    /// device produced one.
    pub fn handle_stream(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.framer.extend(bytes);
        let mut out = Vec::new();
        while let Some(frame) = self.framer.next_frame() {
            if !aux::verify(&frame) {
                self.dropped_frames += 1;
                debug!(
                    "dropped unverifiable frame ({} so far): {:02x?}",
                    self.dropped_frames, frame
                );
                continue;
            }
            let Some(pkt) = aux::decode(&frame) else {
                continue;
            };

            out.push(aux::PREAMBLE);
            out.extend_from_slice(&frame);

            let Some(device) = self.devices.get(&pkt.dst) else {
                debug!("no device at 0x{:02x}, staying silent", pkt.dst);
                continue;
            };
            self.traffic.record(pkt.src, pkt.dst, pkt.cmd);

            let reply = {
                let mut device = device.lock().unwrap();
                if pkt.cmd == cmd::GET_VER {
                    Some(device.firmware_version().to_vec())
                } else {
                    device.dispatch(pkt.src, pkt.cmd, pkt.data)
                }
            };
            if let Some(payload) = reply {
                out.extend_from_slice(&aux::encode(pkt.dst, pkt.src, pkt.cmd, &payload));
            }
        }
        out
    }

    /// Advance every device's physical model. Devices are independent; the
    /// iteration order does not matter.
    pub fn tick(&mut self, dt: f64) {
        for device in self.devices.values() {
            device.lock().unwrap().tick(dt);
        }
    }

    pub fn traffic(&self) -> TrafficLog {
        self.traffic.clone()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}

impl Default for AuxBus {
    fn default() -> Self {
        Self::new()
    }
}
