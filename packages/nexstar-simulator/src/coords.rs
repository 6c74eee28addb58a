//! coords.rs — horizontal to equatorial conversion
//!
//! The Stellarium broadcaster needs apparent (JNow) RA/Dec for the current
//! mechanical pointing. This is the inverse of the USNO alt/az relations:
//! Greenwich sidereal time from the Julian day, local sidereal time from
//! the observer's longitude, then hour angle and declination from the
//! horizontal triangle.

use std::f64::consts::{PI, TAU};

use chrono::{DateTime, TimeZone, Utc};

use crate::mount::Observer;

/// Decimal Julian day. Only dates after J2000 matter here, so the epoch
/// difference form is accurate enough.
fn julian_day(when: DateTime<Utc>) -> f64 {
    let j2000 = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
    let diff = when.signed_duration_since(j2000);
    2451545.0 + diff.num_milliseconds() as f64 / (24.0 * 60.0 * 60.0 * 1000.0)
}

/// Greenwich mean sidereal time in hours (USNO approximation).
fn gmst(when: DateTime<Utc>) -> f64 {
    let jd = julian_day(when);
    let jd0 = jd.floor() + 0.5;
    let h = (jd - jd0) * 24.0;
    let dtt = jd - 2451545.0;
    let dut = jd0 - 2451545.0;
    let t = dtt / 36525.0;
    (6.697375 + 0.065709824279 * dut + 1.0027379 * h + 0.0000258 * t * t).rem_euclid(24.0)
}

/// Apparent RA/Dec (radians) for a horizontal direction at the observer's
/// site. Azimuth is measured from north through east; both inputs are
/// radians.
pub fn radec_of(az: f64, alt: f64, when: DateTime<Utc>, observer: &Observer) -> (f64, f64) {
    let lat = observer.latitude.to_radians();
    let lon = observer.longitude.to_radians();

    let dec = (alt.sin() * lat.sin() + alt.cos() * lat.cos() * az.cos()).asin();
    let hour_angle = (-az.sin() * alt.cos())
        .atan2(alt.sin() * lat.cos() - alt.cos() * lat.sin() * az.cos());

    let lst = gmst(when) * (15.0 * PI / 180.0) + lon;
    let ra = (lst - hour_angle).rem_euclid(TAU);
    (ra, dec)
}
