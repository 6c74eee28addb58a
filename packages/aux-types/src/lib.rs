//! # aux-types
//!
//! Shared wire structures for the Celestron AUX bus.
//!
//! These types are used by:
//! - `nexstar-simulator`: decoding client requests and encoding device replies
//! - test harnesses and protocol tooling that need to speak raw AUX frames
//!
//! ## Wire format
//!
//! ```text
//! PREAMBLE(1) LEN(1) SRC(1) DST(1) CMD(1) DATA(LEN-3) CHK(1)
//! ```
//!
//! - `PREAMBLE` is always `0x3B` (ASCII `;`)
//! - `LEN` counts SRC + DST + CMD + DATA
//! - `CHK` is the two's-complement of the byte sum over LEN..DATA
//!
//! Throughout this crate a *frame* is the LEN..CHK slice, without the
//! preamble byte: that is what the splitter hands out and what `decode` /
//! `verify` consume. The bus is half-duplex and best-effort; a frame that
//! fails `verify` is dropped without a NAK.

use bytes::{Buf, BytesMut};

pub mod stellarium;

/// Frame delimiter, ASCII `;`.
pub const PREAMBLE: u8 = 0x3B;

/// Largest LEN byte accepted by the splitter. Anything above this is line
/// noise, not a frame.
pub const MAX_LEN: usize = 32;

/// Largest DATA payload that still fits `MAX_LEN`.
pub const MAX_DATA: usize = MAX_LEN - 3;

/// One turn of the 24-bit position encoder.
pub const ENCODER_STEPS: f64 = 16_777_216.0;

// ── Bus addresses ─────────────────────────────────────────────────────────────

pub mod addr {
    //! Known AUX bus addresses. Only a subset is backed by a simulated
    //! device; the rest must stay silent on the bus.

    pub const MB: u8 = 0x01;
    pub const HC: u8 = 0x04;
    pub const AZM: u8 = 0x10;
    pub const ALT: u8 = 0x11;
    pub const FOCUSER: u8 = 0x12;
    pub const APP: u8 = 0x20;
    pub const STARSENSE: u8 = 0xB4;
    pub const WIFI: u8 = 0xB5;
    pub const BAT: u8 = 0xB6;
    pub const CHG: u8 = 0xB7;
    pub const LIGHTS: u8 = 0xBF;
}

// ── Command ids ───────────────────────────────────────────────────────────────

pub mod cmd {
    //! Command ids seen on the Evolution bus. Motor-controller commands are
    //! prefixed `MC_`, power and WiFi commands by their module. Ids are only
    //! unique per device class (`0x10` is both `MC_SET_POS_BACKLASH` and
    //! `POWER_GET_VOLTAGE_STATUS`).

    pub const MC_GET_POSITION: u8 = 0x01;
    pub const MC_GOTO_FAST: u8 = 0x02;
    pub const MC_SET_POSITION: u8 = 0x04;
    pub const MC_GET_MODEL: u8 = 0x05;
    pub const MC_SET_POS_GUIDERATE: u8 = 0x06;
    pub const MC_SET_NEG_GUIDERATE: u8 = 0x07;
    pub const MC_SET_POS_BACKLASH: u8 = 0x10;
    pub const MC_SLEW_DONE: u8 = 0x13;
    pub const MC_GOTO_SLOW: u8 = 0x17;
    pub const MC_MOVE_POS: u8 = 0x24;
    pub const MC_MOVE_NEG: u8 = 0x25;
    pub const MC_GET_POS_BACKLASH: u8 = 0x40;
    pub const MC_GET_NEG_BACKLASH: u8 = 0x41;
    pub const MC_GET_AUTOGUIDE_RATE: u8 = 0x47;
    pub const MC_GET_APPROACH: u8 = 0xFC;
    pub const MC_SET_APPROACH: u8 = 0xFD;

    pub const POWER_GET_VOLTAGE_STATUS: u8 = 0x10;
    pub const POWER_GET_CURRENT: u8 = 0x18;

    pub const WIFI_SET_TIME: u8 = 0x30;
    pub const WIFI_SET_LOCATION: u8 = 0x31;
    pub const WIFI_CONFIG: u8 = 0x32;
    pub const WIFI_PING: u8 = 0x49;

    /// Handled by every device on the bus.
    pub const GET_VER: u8 = 0xFE;
}

// ── Checksum / encode / decode ────────────────────────────────────────────────

/// Two's-complement checksum over the LEN..DATA bytes of a frame.
pub fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// Build a complete packet (preamble included) ready to put on the wire.
pub fn encode(src: u8, dst: u8, command: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= MAX_DATA, "AUX payload too large");
    let mut pkt = Vec::with_capacity(data.len() + 6);
    pkt.push(PREAMBLE);
    pkt.push((data.len() + 3) as u8);
    pkt.push(src);
    pkt.push(dst);
    pkt.push(command);
    pkt.extend_from_slice(data);
    let chk = checksum(&pkt[1..]);
    pkt.push(chk);
    pkt
}

/// A decoded view into one frame. Field values are reported as declared on
/// the wire; nothing here implies the checksum was correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub len: u8,
    pub src: u8,
    pub dst: u8,
    pub cmd: u8,
    pub data: &'a [u8],
    pub chk: u8,
}

/// Split a frame into its fields without validating the checksum.
/// Returns `None` only when the buffer is too short to contain a header.
pub fn decode(frame: &[u8]) -> Option<Packet<'_>> {
    if frame.len() < 5 {
        return None;
    }
    Some(Packet {
        len: frame[0],
        src: frame[1],
        dst: frame[2],
        cmd: frame[3],
        data: &frame[4..frame.len() - 1],
        chk: frame[frame.len() - 1],
    })
}

/// True when the declared length matches the frame and the checksum holds.
pub fn verify(frame: &[u8]) -> bool {
    if frame.len() < 5 {
        return false;
    }
    let len = frame[0] as usize;
    if frame.len() != len + 2 {
        return false;
    }
    checksum(&frame[..frame.len() - 1]) == frame[frame.len() - 1]
}

// ── Stream splitter ───────────────────────────────────────────────────────────

/// Restartable frame splitter over an accumulated byte stream.
///
/// Bytes between frames are discarded; a half frame stays pending in the
/// rolling buffer until more bytes arrive. A preamble followed by an
/// implausible LEN causes a resync at the next preamble byte.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Append freshly received bytes to the rolling buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame (LEN..CHK, preamble stripped), if any.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == PREAMBLE) {
                Some(at) => self.buf.advance(at),
                None => {
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < 2 {
                return None;
            }
            let len = self.buf[1] as usize;
            if !(3..=MAX_LEN).contains(&len) {
                // Stray preamble inside garbage; resync one byte later.
                self.buf.advance(1);
                continue;
            }
            let total = len + 3; // preamble + LEN byte + body + CHK
            if self.buf.len() < total {
                return None;
            }
            let frame = self.buf[1..total].to_vec();
            self.buf.advance(total);
            return Some(frame);
        }
    }

    /// Bytes currently waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

// ── 24-bit encoder fractions ──────────────────────────────────────────────────

/// Pack a fraction of a turn into the 3-byte big-endian encoder format.
/// Values outside [0, 1) wrap modulo one turn, which doubles as the two's
/// complement representation for negative ALT positions.
pub fn pack_u24(fraction: f64) -> [u8; 3] {
    let raw = ((fraction * ENCODER_STEPS).round() as i64).rem_euclid(1 << 24) as u32;
    [(raw >> 16) as u8, (raw >> 8) as u8, raw as u8]
}

/// Raw 24-bit big-endian value, `None` when fewer than 3 bytes arrived.
pub fn unpack_u24_raw(data: &[u8]) -> Option<u32> {
    if data.len() < 3 {
        return None;
    }
    Some(((data[0] as u32) << 16) | ((data[1] as u32) << 8) | data[2] as u32)
}

/// 24-bit big-endian value as a fraction of a turn in [0, 1).
pub fn unpack_u24(data: &[u8]) -> Option<f64> {
    unpack_u24_raw(data).map(|raw| raw as f64 / ENCODER_STEPS)
}

/// 16-bit big-endian value, `None` when fewer than 2 bytes arrived.
pub fn unpack_u16(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(((data[0] as u16) << 8) | data[1] as u16)
}

// ── Display names ─────────────────────────────────────────────────────────────

/// Human-readable name of a bus address, for the traffic log.
pub fn target_name(address: u8) -> String {
    match address {
        addr::MB => "MB".into(),
        addr::HC => "HC".into(),
        addr::AZM => "AZM".into(),
        addr::ALT => "ALT".into(),
        addr::FOCUSER => "FOCUSER".into(),
        addr::APP => "APP".into(),
        addr::STARSENSE => "SS".into(),
        addr::WIFI => "WIFI".into(),
        addr::BAT => "BAT".into(),
        addr::CHG => "CHG".into(),
        addr::LIGHTS => "LIGHTS".into(),
        other => format!("0x{other:02x}"),
    }
}

/// Human-readable name of a command id, for the traffic log. Ids shared
/// between device classes resolve to the motor-controller name.
pub fn command_name(command: u8) -> String {
    match command {
        cmd::MC_GET_POSITION => "MC_GET_POSITION".into(),
        cmd::MC_GOTO_FAST => "MC_GOTO_FAST".into(),
        cmd::MC_SET_POSITION => "MC_SET_POSITION".into(),
        cmd::MC_GET_MODEL => "MC_GET_MODEL".into(),
        cmd::MC_SET_POS_GUIDERATE => "MC_SET_POS_GUIDERATE".into(),
        cmd::MC_SET_NEG_GUIDERATE => "MC_SET_NEG_GUIDERATE".into(),
        cmd::MC_SET_POS_BACKLASH => "MC_SET_POS_BACKLASH".into(),
        cmd::MC_SLEW_DONE => "MC_SLEW_DONE".into(),
        cmd::MC_GOTO_SLOW => "MC_GOTO_SLOW".into(),
        cmd::POWER_GET_CURRENT => "POWER_GET_CURRENT".into(),
        cmd::MC_MOVE_POS => "MC_MOVE_POS".into(),
        cmd::MC_MOVE_NEG => "MC_MOVE_NEG".into(),
        cmd::WIFI_SET_TIME => "WIFI_SET_TIME".into(),
        cmd::WIFI_SET_LOCATION => "WIFI_SET_LOCATION".into(),
        cmd::WIFI_CONFIG => "WIFI_CONFIG".into(),
        cmd::MC_GET_POS_BACKLASH => "MC_GET_POS_BACKLASH".into(),
        cmd::MC_GET_NEG_BACKLASH => "MC_GET_NEG_BACKLASH".into(),
        cmd::MC_GET_AUTOGUIDE_RATE => "MC_GET_AUTOGUIDE_RATE".into(),
        cmd::WIFI_PING => "WIFI_PING".into(),
        cmd::MC_GET_APPROACH => "MC_GET_APPROACH".into(),
        cmd::MC_SET_APPROACH => "MC_SET_APPROACH".into(),
        cmd::GET_VER => "GET_VER".into(),
        other => format!("0x{other:02x}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
