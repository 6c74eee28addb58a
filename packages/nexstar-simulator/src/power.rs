//! power.rs — battery and charger modules
//!
//! The Evolution carries two power boards on the bus: the battery at 0xB6
//! and the charger at 0xB7. Both answer the same two read commands; every
//! other command gets an empty acknowledgement so that clients probing with
//! motor-style ids do not fall into retry loops.

use rand_distr::{Distribution, Normal};

use crate::bus::AuxDevice;
use aux_types::cmd;

pub const STATUS_CHARGING: u8 = 0x01;
pub const STATUS_HIGH: u8 = 0x02;
pub const STATUS_MEDIUM: u8 = 0x03;
pub const STATUS_LOW: u8 = 0x04;
pub const STATUS_CRITICAL: u8 = 0x05;

const FIRMWARE: [u8; 4] = [2, 15, 0, 0];

// Readout noise, in microvolts / milliamps.
const VOLTAGE_JITTER_UV: f64 = 20_000.0;
const CURRENT_JITTER_MA: f64 = 5.0;

pub struct PowerModule {
    id: u8,
    voltage_uv: u32,
    current_ma: u16,
    charging: bool,
    jitter: bool,
}

impl PowerModule {
    /// Internal battery: a healthy lithium pack under load.
    pub fn battery(id: u8) -> Self {
        Self {
            id,
            voltage_uv: 11_700_000,
            current_ma: 350,
            charging: false,
            jitter: true,
        }
    }

    /// External charger input.
    pub fn charger(id: u8) -> Self {
        Self {
            id,
            voltage_uv: 13_800_000,
            current_ma: 1_500,
            charging: true,
            jitter: true,
        }
    }

    fn level_status(&self) -> u8 {
        if self.charging {
            return STATUS_CHARGING;
        }
        match self.voltage_uv {
            v if v >= 11_500_000 => STATUS_HIGH,
            v if v >= 10_800_000 => STATUS_MEDIUM,
            v if v >= 10_200_000 => STATUS_LOW,
            _ => STATUS_CRITICAL,
        }
    }

    fn read_voltage_mv(&self) -> u16 {
        let mut volts = self.voltage_uv as f64;
        if self.jitter {
            volts += Normal::new(0.0, VOLTAGE_JITTER_UV)
                .unwrap()
                .sample(&mut rand::thread_rng());
        }
        (volts / 1000.0).round().clamp(0.0, u16::MAX as f64) as u16
    }

    fn read_current_ma(&self) -> u16 {
        let mut current = self.current_ma as f64;
        if self.jitter {
            current += Normal::new(0.0, CURRENT_JITTER_MA)
                .unwrap()
                .sample(&mut rand::thread_rng());
        }
        current.round().clamp(0.0, u16::MAX as f64) as u16
    }

    fn voltage_status_payload(&self) -> Vec<u8> {
        let mv = self.read_voltage_mv();
        vec![
            self.charging as u8,
            self.level_status(),
            (mv >> 8) as u8,
            mv as u8,
            0x00,
            0x00,
        ]
    }
}

impl AuxDevice for PowerModule {
    fn device_id(&self) -> u8 {
        self.id
    }

    fn firmware_version(&self) -> [u8; 4] {
        FIRMWARE
    }

    fn dispatch(&mut self, _sender: u8, command: u8, _data: &[u8]) -> Option<Vec<u8>> {
        match command {
            cmd::POWER_GET_VOLTAGE_STATUS => Some(self.voltage_status_payload()),
            cmd::POWER_GET_CURRENT => {
                let ma = self.read_current_ma();
                Some(vec![(ma >> 8) as u8, ma as u8])
            }
            // Anything else acknowledges without data.
            _ => Some(Vec::new()),
        }
    }
}
