//! Stellarium telescope-control wire format.
//!
//! Sky-chart clients speak a little protocol of concatenated little-endian
//! packets: the client sends GOTO requests (type 0, 20 bytes), the server
//! broadcasts position status (type 0, 24 bytes) a few times per second.
//! Angles travel as 32-bit fixed point: a full circle is 2³².

use serde::{Deserialize, Serialize};

/// Size of an outgoing status packet.
pub const STATUS_LEN: usize = 24;

/// Fixed-point scale: one full circle.
const FULL_CIRCLE: f64 = 4_294_967_296.0;

const TAU: f64 = std::f64::consts::TAU;

/// One decoded GOTO request from a sky-chart client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartGoto {
    /// Right ascension in hours, [0, 24).
    pub ra_hours: f64,
    /// Declination in degrees, signed.
    pub dec_deg: f64,
}

/// Walk a buffer of concatenated client packets and decode every GOTO.
///
/// Packets are delimited by their own leading size field; unknown packet
/// types are skipped, a truncated trailing packet ends the walk.
pub fn parse_goto_stream(data: &[u8]) -> Vec<ChartGoto> {
    let mut out = Vec::new();
    let mut p = 0usize;
    while p + 4 <= data.len() {
        let size = u16::from_le_bytes([data[p], data[p + 1]]) as usize;
        if size < 4 || p + size > data.len() {
            break;
        }
        let ptype = u16::from_le_bytes([data[p + 2], data[p + 3]]);
        if ptype == 0 && size >= 20 {
            let ra_raw = u32::from_le_bytes([
                data[p + 12],
                data[p + 13],
                data[p + 14],
                data[p + 15],
            ]);
            let dec_raw = u32::from_le_bytes([
                data[p + 16],
                data[p + 17],
                data[p + 18],
                data[p + 19],
            ]);
            out.push(ChartGoto {
                ra_hours: ra_raw as f64 * 24.0 / FULL_CIRCLE,
                // Southern declinations arrive as two's complement.
                dec_deg: (dec_raw as i32) as f64 * 360.0 / FULL_CIRCLE,
            });
        }
        p += size;
    }
    out
}

/// Build a 24-byte status packet for the given pointing.
///
/// `ra_rad` and `dec_rad` are JNow apparent coordinates in radians; negative
/// declinations wrap into the two's-complement fixed-point form the clients
/// expect.
pub fn encode_status(utc_micros: u64, ra_rad: f64, dec_rad: f64) -> [u8; STATUS_LEN] {
    let mut msg = [0u8; STATUS_LEN];
    msg[0..2].copy_from_slice(&(STATUS_LEN as u16).to_le_bytes());
    // bytes 2..4: packet type 0
    msg[4..12].copy_from_slice(&utc_micros.to_le_bytes());
    msg[12..16].copy_from_slice(&angle_to_raw(ra_rad).to_le_bytes());
    msg[16..20].copy_from_slice(&angle_to_raw(dec_rad).to_le_bytes());
    // bytes 20..24: status field, 0 = OK
    msg
}

fn angle_to_raw(angle_rad: f64) -> u32 {
    ((angle_rad / TAU * FULL_CIRCLE).floor() as i64) as u32
}
