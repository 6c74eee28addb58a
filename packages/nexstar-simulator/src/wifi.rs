//! wifi.rs — Evolution WiFi bridge module (0xB5)
//!
//! Handles the handshake a sky client runs right after connecting: time
//! sync, observer location, an opaque config blob and a ping. The location
//! write lands in the shared observer that the sky-chart coordinate
//! transform reads.

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{info, warn};

use crate::bus::AuxDevice;
use crate::mount::SharedObserver;
use aux_types::cmd;

const FIRMWARE: [u8; 4] = [2, 40, 0, 0];

pub struct WiFiModule {
    id: u8,
    observer: SharedObserver,
}

impl WiFiModule {
    pub fn new(id: u8, observer: SharedObserver) -> Self {
        Self { id, observer }
    }

    fn set_time(&mut self, data: &[u8]) -> Vec<u8> {
        match clock_offset_secs(data, Utc::now()) {
            Some(offset) => {
                info!("System clock offset: {offset:.0} s");
                vec![0x01]
            }
            None => {
                warn!("WiFi 0x{:02x}: malformed SET_TIME payload ({} bytes)", self.id, data.len());
                Vec::new()
            }
        }
    }

    fn set_location(&mut self, data: &[u8]) -> Vec<u8> {
        if data.len() < 8 {
            warn!("WiFi 0x{:02x}: malformed SET_LOCATION payload ({} bytes)", self.id, data.len());
            return Vec::new();
        }
        let latitude = f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as f64;
        let longitude = f32::from_le_bytes([data[4], data[5], data[6], data[7]]) as f64;
        info!("observer location set: lat={latitude:.4} lon={longitude:.4}");
        let mut observer = self.observer.lock().unwrap();
        observer.latitude = latitude;
        observer.longitude = longitude;
        vec![0x01]
    }
}

impl AuxDevice for WiFiModule {
    fn device_id(&self) -> u8 {
        self.id
    }

    fn firmware_version(&self) -> [u8; 4] {
        FIRMWARE
    }

    fn dispatch(&mut self, _sender: u8, command: u8, data: &[u8]) -> Option<Vec<u8>> {
        match command {
            cmd::WIFI_SET_TIME => Some(self.set_time(data)),
            cmd::WIFI_SET_LOCATION => Some(self.set_location(data)),
            cmd::WIFI_CONFIG => Some(vec![0x01]),
            cmd::WIFI_PING => Some(vec![0x00]),
            _ => None,
        }
    }
}

/// Seconds between the clock a SET_TIME payload describes and `now`.
///
/// The payload is `[ss, mm, hh, dd, month, year-2000, utc_offset, dst]`
/// with the offset and DST flag in hours; subtracting them converts the
/// transmitted local time to UTC. `None` for short payloads or impossible
/// dates.
fn clock_offset_secs(data: &[u8], now: DateTime<Utc>) -> Option<f64> {
    if data.len() < 8 {
        return None;
    }
    let (ss, mm, hh, dd, month, yy) = (data[0], data[1], data[2], data[3], data[4], data[5]);
    let utc_offset = data[6] as i8 as i64;
    let dst = data[7] as i64;
    let local = Utc
        .with_ymd_and_hms(
            2000 + yy as i32,
            month as u32,
            dd as u32,
            hh as u32,
            mm as u32,
            ss as u32,
        )
        .single()?;
    let target = local - Duration::hours(utc_offset + dst);
    Some((target - now).num_milliseconds() as f64 / 1000.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mount::Observer;
    use std::sync::{Arc, Mutex};

    fn wifi() -> (WiFiModule, SharedObserver) {
        let observer = Arc::new(Mutex::new(Observer {
            latitude: 50.1822,
            longitude: 19.7925,
            elevation: 400.0,
        }));
        (WiFiModule::new(aux_types::addr::WIFI, observer.clone()), observer)
    }

    #[test]
    fn test_handshake_payloads() {
        let (mut module, _) = wifi();
        assert_eq!(module.dispatch(0x20, cmd::WIFI_PING, &[]).unwrap(), vec![0x00]);
        assert_eq!(
            module
                .dispatch(0x20, cmd::WIFI_CONFIG, &[0x31, 0x06, 0x73, 0x9D])
                .unwrap(),
            vec![0x01]
        );
        assert_eq!(module.firmware_version(), [2, 40, 0, 0]);
    }

    #[test]
    fn test_set_location_rewrites_observer() {
        let (mut module, observer) = wifi();
        // 50.179°N 19.654°E as two LE f32.
        let mut payload = Vec::new();
        payload.extend_from_slice(&50.179_f32.to_le_bytes());
        payload.extend_from_slice(&19.654_f32.to_le_bytes());
        let ack = module.dispatch(0x20, cmd::WIFI_SET_LOCATION, &payload).unwrap();
        assert_eq!(ack, vec![0x01]);

        let observer = observer.lock().unwrap();
        assert!((observer.latitude - 50.179).abs() < 1e-4);
        assert!((observer.longitude - 19.654).abs() < 1e-4);
        assert_eq!(observer.elevation, 400.0, "elevation is not touched");
    }

    #[test]
    fn test_set_location_short_payload_acks_empty() {
        let (mut module, observer) = wifi();
        let ack = module
            .dispatch(0x20, cmd::WIFI_SET_LOCATION, &[0x42, 0x48])
            .unwrap();
        assert!(ack.is_empty());
        assert!((observer.lock().unwrap().latitude - 50.1822).abs() < 1e-9);
    }

    #[test]
    fn test_clock_offset_one_hour_ahead() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let payload = [30, 0, 13, 1, 8, 26, 0, 0]; // 13:00:30 the same day, UTC
        let offset = clock_offset_secs(&payload, now).unwrap();
        assert!((offset - 3630.0).abs() < 1.0);
    }

    #[test]
    fn test_clock_offset_applies_zone_and_dst() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        // 15:00 local at UTC+2 with DST: 12:00 UTC, no offset.
        let payload = [0, 0, 15, 1, 8, 26, 2, 1];
        let offset = clock_offset_secs(&payload, now).unwrap();
        assert!(offset.abs() < 1.0);
    }

    #[test]
    fn test_clock_offset_negative_zone() {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        // 07:00 local at UTC-5 (0xFB as signed) is 12:00 UTC.
        let payload = [0, 0, 7, 1, 8, 26, 0xFB, 0];
        let offset = clock_offset_secs(&payload, now).unwrap();
        assert!(offset.abs() < 1.0);
    }

    #[test]
    fn test_clock_offset_rejects_bad_payload() {
        let now = Utc::now();
        assert!(clock_offset_secs(&[1, 2, 3], now).is_none());
        // Month 13 does not exist.
        assert!(clock_offset_secs(&[0, 0, 12, 1, 13, 26, 0, 0], now).is_none());
    }

    #[test]
    fn test_unknown_command_silent() {
        let (mut module, _) = wifi();
        assert!(module.dispatch(0x20, 0x77, &[]).is_none());
    }
}
