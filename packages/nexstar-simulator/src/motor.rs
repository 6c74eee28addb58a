//! motor.rs — simulated motor controllers
//!
//! One instance per axis: azimuth at 0x10 (wraps modulo a full turn) and
//! altitude at 0x11 (clamped to the configured travel limits). Positions are
//! fractions of a turn, matching the 24-bit encoder on the wire.
//!
//! Motion is integrated in `tick`:
//!   - a GOTO decelerates so the axis lands exactly on target in one step
//!   - the guide rate accumulates even when no slew is commanded
//!   - direction reversals eat the configured backlash before the load moves

use rand_distr::{Distribution, Normal};
use tracing::warn;

use crate::bus::AuxDevice;
use aux_types::{addr, cmd, pack_u24, unpack_u24, unpack_u24_raw, ENCODER_STEPS};

/// Slew rates for MOVE_POS/MOVE_NEG rate indices 0–9, fraction of a turn
/// per second. Index 0 stops the axis.
pub const RATES: [f64; 10] = [
    0.0,
    0.008 / 360.0,
    0.017 / 360.0,
    0.033 / 360.0,
    0.067 / 360.0,
    0.133 / 360.0,
    0.5 / 360.0,
    1.0 / 360.0,
    2.0 / 360.0,
    4.0 / 360.0,
];

// MC rate units are 0.001 deg/s.
const MAX_RATE: f64 = 10_000.0 / 360_000.0;
const GOTO_SLOW_RATE: f64 = 1_000.0 / 360_000.0;

// Reported to GET_MODEL: NexStar Evolution.
const MODEL_ID: [u8; 2] = [0x16, 0x87];

// Fixed autoguide rate readback (240/256 of sidereal).
const AUTOGUIDE_RATE: u8 = 240;

/// Axis parameters shared by both motors, flattened out of the simulator
/// configuration at mount construction.
#[derive(Debug, Clone)]
pub struct MotorParams {
    pub version: [u8; 4],
    pub backlash_steps: u8,
    pub encoder_jitter_steps: u32,
    /// Altitude travel limits as fractions of a turn; ignored by the
    /// azimuth axis.
    pub alt_min: f64,
    pub alt_max: f64,
}

pub struct MotorController {
    id: u8,
    version: [u8; 4],

    pos: f64,
    trg_pos: f64,
    rate: f64,
    guide_rate: f64,
    slewing: bool,
    goto_active: bool,

    approach: u8,
    backlash_steps: u8,
    last_dir: i8,
    backlash_rem: f64,

    jitter_sigma: f64,
    alt_min: f64,
    alt_max: f64,
}

impl MotorController {
    pub fn new(id: u8, params: &MotorParams) -> Self {
        Self {
            id,
            version: params.version,
            pos: 0.0,
            trg_pos: 0.0,
            rate: 0.0,
            guide_rate: 0.0,
            slewing: false,
            goto_active: false,
            approach: 0,
            backlash_steps: params.backlash_steps,
            last_dir: 0,
            backlash_rem: 0.0,
            jitter_sigma: params.encoder_jitter_steps as f64 / ENCODER_STEPS,
            alt_min: params.alt_min,
            alt_max: params.alt_max,
        }
    }

    pub fn position(&self) -> f64 {
        self.pos
    }

    pub fn is_slewing(&self) -> bool {
        self.slewing
    }

    /// The azimuth axis wraps; altitude runs against hard limits instead.
    fn wraps(&self) -> bool {
        self.id == addr::AZM
    }

    /// Encoder readout, with the configured Gaussian jitter applied.
    fn read_position(&self) -> f64 {
        if self.jitter_sigma > 0.0 {
            let noise = Normal::new(0.0, self.jitter_sigma)
                .unwrap()
                .sample(&mut rand::thread_rng());
            self.pos + noise
        } else {
            self.pos
        }
    }

    fn start_goto(&mut self, data: &[u8], rate_cap: f64) -> Vec<u8> {
        let Some(target) = unpack_u24(data) else {
            warn!("axis 0x{:02x}: short GOTO payload ({} bytes)", self.id, data.len());
            return Vec::new();
        };
        self.trg_pos = target;
        self.slewing = true;
        self.goto_active = true;
        let mut diff = self.trg_pos - self.pos;
        if self.wraps() {
            diff = shortest_arc(diff);
        }
        self.rate = if diff > 0.0 { rate_cap } else { -rate_cap };
        Vec::new()
    }

    fn set_position(&mut self, data: &[u8]) -> Vec<u8> {
        let Some(position) = unpack_u24(data) else {
            warn!("axis 0x{:02x}: short SET_POSITION payload", self.id);
            return Vec::new();
        };
        self.pos = position;
        self.trg_pos = position;
        self.rate = 0.0;
        self.slewing = false;
        self.goto_active = false;
        Vec::new()
    }

    fn start_move(&mut self, data: &[u8], sign: f64) -> Vec<u8> {
        // An out-of-range rate index stops the axis.
        let index = data.first().copied().unwrap_or(0) as usize;
        let rate = RATES.get(index).copied().unwrap_or(0.0);
        self.rate = sign * rate;
        self.slewing = self.rate.abs() > 0.0;
        self.goto_active = false;
        Vec::new()
    }

    fn set_guide_rate(&mut self, data: &[u8], sign: f64) -> Vec<u8> {
        let Some(raw) = unpack_u24_raw(data) else {
            warn!("axis 0x{:02x}: short guide rate payload", self.id);
            return Vec::new();
        };
        self.guide_rate = sign * raw as f64 / (360.0 * 3600.0 * 1024.0);
        Vec::new()
    }

    fn set_backlash(&mut self, data: &[u8]) -> Vec<u8> {
        match data.first() {
            Some(&steps) => self.backlash_steps = steps,
            None => warn!("axis 0x{:02x}: empty SET_POS_BACKLASH payload", self.id),
        }
        Vec::new()
    }

    fn set_approach(&mut self, data: &[u8]) -> Vec<u8> {
        match data.first() {
            Some(&approach) => self.approach = approach,
            None => warn!("axis 0x{:02x}: empty SET_APPROACH payload", self.id),
        }
        Vec::new()
    }

    fn stop_at_limit(&mut self) {
        self.rate = 0.0;
        self.slewing = false;
        self.goto_active = false;
    }
}

impl AuxDevice for MotorController {
    fn device_id(&self) -> u8 {
        self.id
    }

    fn firmware_version(&self) -> [u8; 4] {
        self.version
    }

    fn dispatch(&mut self, _sender: u8, command: u8, data: &[u8]) -> Option<Vec<u8>> {
        match command {
            cmd::MC_GET_POSITION => Some(pack_u24(self.read_position()).to_vec()),
            cmd::MC_GOTO_FAST => Some(self.start_goto(data, MAX_RATE)),
            cmd::MC_GOTO_SLOW => Some(self.start_goto(data, GOTO_SLOW_RATE)),
            cmd::MC_SET_POSITION => Some(self.set_position(data)),
            cmd::MC_GET_MODEL => Some(MODEL_ID.to_vec()),
            cmd::MC_SET_POS_GUIDERATE => Some(self.set_guide_rate(data, 1.0)),
            cmd::MC_SET_NEG_GUIDERATE => Some(self.set_guide_rate(data, -1.0)),
            cmd::MC_SET_POS_BACKLASH => Some(self.set_backlash(data)),
            cmd::MC_SLEW_DONE => Some(vec![if self.slewing { 0x00 } else { 0xFF }]),
            cmd::MC_MOVE_POS => Some(self.start_move(data, 1.0)),
            cmd::MC_MOVE_NEG => Some(self.start_move(data, -1.0)),
            cmd::MC_GET_POS_BACKLASH | cmd::MC_GET_NEG_BACKLASH => {
                Some(vec![self.backlash_steps])
            }
            cmd::MC_GET_AUTOGUIDE_RATE => Some(vec![AUTOGUIDE_RATE]),
            cmd::MC_GET_APPROACH => Some(vec![self.approach]),
            cmd::MC_SET_APPROACH => Some(self.set_approach(data)),
            _ => None,
        }
    }

    fn tick(&mut self, dt: f64) {
        if !self.slewing && self.guide_rate.abs() < 1e-15 {
            return;
        }

        // GOTO deceleration: shrink the rate so the final step lands
        // exactly on the target.
        if self.goto_active {
            let mut diff = self.trg_pos - self.pos;
            if self.wraps() {
                diff = shortest_arc(diff);
            }
            let sign = if diff > 0.0 { 1.0 } else { -1.0 };
            let mut magnitude = self.rate.abs();
            if magnitude * dt >= diff.abs() {
                magnitude = diff.abs() / dt;
            }
            self.rate = sign * magnitude;
        }

        let mut movement = (self.rate + self.guide_rate) * dt;

        // Backlash hysteresis: a direction reversal re-arms the dead band,
        // which then absorbs commanded motion without moving the load.
        if movement.abs() > 1e-15 {
            let dir: i8 = if movement > 0.0 { 1 } else { -1 };
            if dir != self.last_dir {
                self.backlash_rem = self.backlash_steps as f64 / ENCODER_STEPS;
                self.last_dir = dir;
            }
            if self.backlash_rem > 0.0 {
                let consumed = movement.abs().min(self.backlash_rem);
                self.backlash_rem -= consumed;
                movement = if movement.abs() <= consumed {
                    0.0
                } else {
                    (movement.abs() - consumed) * dir as f64
                };
            }
        }

        self.pos += movement;
        if self.wraps() {
            self.pos = self.pos.rem_euclid(1.0);
        } else if self.pos < self.alt_min {
            self.pos = self.alt_min;
            self.stop_at_limit();
        } else if self.pos > self.alt_max {
            self.pos = self.alt_max;
            self.stop_at_limit();
        }

        if self.goto_active {
            let mut diff = self.trg_pos - self.pos;
            if self.wraps() {
                diff = shortest_arc(diff);
            }
            if diff.abs() < 1e-7 {
                self.pos = self.trg_pos;
                self.rate = 0.0;
                self.slewing = false;
                self.goto_active = false;
            }
        }
    }
}

/// Fold an azimuth difference onto the shorter way around the circle.
fn shortest_arc(diff: f64) -> f64 {
    if diff > 0.5 {
        diff - 1.0
    } else if diff < -0.5 {
        diff + 1.0
    } else {
        diff
    }
}
