//! Filter tunables.
//!
//! One flat record of every process noise, measurement sigma, gate and
//! timeout the filter consumes. Defaults are the flight-tested values; hosts
//! override fields before constructing the filter.

/// EKF tuning and configuration parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EkfParams {
    /// Maximum time allowed between covariance predictions (s).
    pub cov_time_step_max: f32,
    /// Maximum accumulated delta angle between covariance predictions (rad).
    pub cov_del_ang_max: f32,
    /// Pitch mounting angle of the range finder (rad). Zero is aligned with
    /// the body Z axis, positive is a right-hand rotation about body Y.
    pub rng_finder_pitch: f32,
    /// Optical-flow sensor misalignment angles about body X/Y/Z (rad).
    pub flow_align: [f32; 3],

    /// Ratio of true to equivalent airspeed.
    pub eas2tas: f32,
    /// Extra yaw process noise scale applied on ground.
    pub yaw_var_scale: f32,

    // Process noise sigmas (per second of integration)
    pub wind_vel_sigma: f32,
    pub d_ang_bias_sigma: f32,
    pub d_vel_bias_sigma: f32,
    pub mag_earth_sigma: f32,
    pub mag_body_sigma: f32,
    /// Terrain gradient 1-sigma, scaled by ground speed in the predictor.
    pub gnd_hgt_sigma: f32,
    pub opt_scale_sigma: f32,
    pub gyro_process_noise: f32,
    pub accel_process_noise: f32,

    // Measurement sigmas
    pub vne_sigma: f32,
    pub vd_sigma: f32,
    pub pos_ne_sigma: f32,
    pub pos_d_sigma: f32,
    pub mag_measurement_sigma: f32,
    pub airspeed_measurement_sigma: f32,
    pub flow_measurement_sigma: f32,

    // Innovation gates (multiples of innovation sigma)
    pub vel_gate: f32,
    pub pos_gate: f32,
    pub hgt_gate: f32,
    pub mag_gate: f32,
    pub tas_gate: f32,
    pub rng_gate: f32,
    pub flow_gate: f32,

    // Per-channel innovation-rejection timeouts (ms)
    pub vel_timeout_ms: u64,
    pub pos_timeout_ms: u64,
    pub hgt_timeout_ms: u64,
    pub mag_timeout_ms: u64,
}

impl Default for EkfParams {
    fn default() -> Self {
        Self {
            cov_time_step_max: 0.07,
            cov_del_ang_max: 0.02,
            rng_finder_pitch: 0.0,
            flow_align: [0.0; 3],

            eas2tas: 1.0,
            yaw_var_scale: 1.0,

            wind_vel_sigma: 0.1,
            d_ang_bias_sigma: 5.0e-7,
            d_vel_bias_sigma: 1e-4,
            mag_earth_sigma: 3.0e-4,
            mag_body_sigma: 3.0e-4,
            gnd_hgt_sigma: 0.02,
            opt_scale_sigma: 1e-4,
            gyro_process_noise: 1.4544411e-2,
            accel_process_noise: 0.5,

            vne_sigma: 0.2,
            vd_sigma: 0.3,
            pos_ne_sigma: 2.0,
            pos_d_sigma: 2.0,
            mag_measurement_sigma: 0.05,
            airspeed_measurement_sigma: 1.4,
            flow_measurement_sigma: 0.1,

            vel_gate: 5.0,
            pos_gate: 5.0,
            hgt_gate: 5.0,
            mag_gate: 3.0,
            tas_gate: 5.0,
            rng_gate: 3.0,
            flow_gate: 3.0,

            vel_timeout_ms: 10_000,
            pos_timeout_ms: 10_000,
            hgt_timeout_ms: 5_000,
            mag_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let p = EkfParams::default();
        assert!(p.cov_time_step_max > 0.0);
        assert!(p.cov_del_ang_max > 0.0);
        assert!(p.vel_gate >= 1.0 && p.mag_gate >= 1.0);
        assert!(p.hgt_timeout_ms < p.vel_timeout_ms);
    }
}
