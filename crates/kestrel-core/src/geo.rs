//! Local NED tangent-plane conversions.
//!
//! Spherical earth with cosine-latitude longitude scaling, adequate for the
//! tens-of-kilometres operating radius of the vehicles this filter serves.
//! Latitude/longitude are radians in f64 (single precision loses metres at
//! earth scale); NED offsets and heights are f32.

use crate::EARTH_RATE;
use libm::{cos, cosf, sinf};
use nalgebra::Vector3;

/// Spherical earth radius (m).
pub const EARTH_RADIUS: f64 = 6_378_145.0;

/// NED velocity from a GNSS course/ground-speed/vertical-rate triple.
pub fn calc_vel_ned(course_rad: f32, gnd_spd: f32, vel_d: f32) -> Vector3<f32> {
    Vector3::new(
        gnd_spd * cosf(course_rad),
        gnd_spd * sinf(course_rad),
        vel_d,
    )
}

/// Geodetic position → NED offset from the reference point.
pub fn calc_pos_ned(
    lat: f64,
    lon: f64,
    hgt: f32,
    lat_ref: f64,
    lon_ref: f64,
    hgt_ref: f32,
) -> Vector3<f32> {
    Vector3::new(
        ((lat - lat_ref) * EARTH_RADIUS) as f32,
        ((lon - lon_ref) * EARTH_RADIUS * cos(lat_ref)) as f32,
        -(hgt - hgt_ref),
    )
}

/// NED offset → geodetic position about the reference point.
pub fn calc_llh(pos_ned: &Vector3<f32>, lat_ref: f64, lon_ref: f64, hgt_ref: f32) -> (f64, f64, f32) {
    let lat = lat_ref + pos_ned.x as f64 / EARTH_RADIUS;
    let lon = lon_ref + pos_ned.y as f64 / (EARTH_RADIUS * cos(lat_ref));
    let hgt = hgt_ref - pos_ned.z;
    (lat, lon, hgt)
}

/// Earth rotation rate resolved into NED at the given latitude.
pub fn earth_rate_ned(lat_rad: f32) -> Vector3<f32> {
    Vector3::new(
        EARTH_RATE * cosf(lat_rad),
        0.0,
        -EARTH_RATE * sinf(lat_rad),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pos_ned_llh_round_trip() {
        let lat_ref = 0.82_f64; // ~47 deg
        let lon_ref = 0.15_f64;
        let hgt_ref = 430.0_f32;
        let offsets = [
            Vector3::new(120.0, -80.0, -15.0),
            Vector3::new(9500.0, 4200.0, 320.0),
            Vector3::new(-4000.0, 9900.0, -500.0),
        ];
        for ned in offsets {
            let (lat, lon, hgt) = calc_llh(&ned, lat_ref, lon_ref, hgt_ref);
            let back = calc_pos_ned(lat, lon, hgt, lat_ref, lon_ref, hgt_ref);
            assert_relative_eq!(back.x, ned.x, epsilon = 1e-2);
            assert_relative_eq!(back.y, ned.y, epsilon = 1e-2);
            assert_relative_eq!(back.z, ned.z, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_vel_from_course() {
        let v = calc_vel_ned(core::f32::consts::FRAC_PI_2, 10.0, -1.5);
        assert_relative_eq!(v.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(v.y, 10.0, epsilon = 1e-5);
        assert_relative_eq!(v.z, -1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_earth_rate_equator_pole() {
        let eq = earth_rate_ned(0.0);
        assert_relative_eq!(eq.x, EARTH_RATE, epsilon = 1e-9);
        assert_relative_eq!(eq.z, 0.0, epsilon = 1e-9);
        let pole = earth_rate_ned(core::f32::consts::FRAC_PI_2);
        assert_relative_eq!(pole.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(pole.z, -EARTH_RATE, epsilon = 1e-9);
    }
}
