//! Measurement fusion.
//!
//! Every module follows one pattern: recall the state history entry aligned
//! with the measurement timestamp, build the innovation and its variance,
//! gate, then fuse the accepted scalars sequentially so each uses the
//! covariance left by the previous one, and finally enforce symmetry and
//! record channel health.
//!
//! Observations arrive as explicit argument structs and every call returns a
//! tagged [`FusionStatus`]; a gated-out sample leaves states and covariance
//! bit-identical.

use libm::{cosf, sqrtf};
use nalgebra::{Vector2, Vector3, Vector4};

use crate::ekf::{idx, sq, NavEkf, StateVector, N_STATES};
use crate::rotation;

/// What the GNSS receiver reports alongside position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsFusionMode {
    /// Full 3D velocity is available.
    #[default]
    Vel3D,
    /// Horizontal velocity only.
    Vel2D,
    /// No velocity output.
    NoVel,
}

/// Tagged outcome of one fusion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FusionStatus {
    /// All requested scalars were accepted and fused.
    Fused,
    /// Innovation gate failed; payload is the normalized innovation magnitude
    /// in sigma units. States and covariance are untouched.
    Rejected(f32),
    /// The channel had timed out; the matching reset was applied using this
    /// observation.
    TimedOutReset,
    /// Filter not initialised; no-op.
    NotInitialised,
    /// Sensor switched off or currently unusable (tilt gate, low speed, …).
    Disabled,
}

/// GNSS velocity/position plus barometric height, each optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct VelPosObs {
    pub vel_ned: Option<Vector3<f32>>,
    pub gps_mode: GpsFusionMode,
    pub pos_ne: Option<Vector2<f32>>,
    /// Effective GNSS measurement time (ms).
    pub gps_time_ms: u64,
    /// Barometric height above the filter's height datum (m).
    pub hgt: Option<f32>,
    pub hgt_time_ms: u64,
}

/// Body-frame magnetometer sample (Gauss).
#[derive(Debug, Clone, Copy)]
pub struct MagObs {
    pub mag: Vector3<f32>,
    pub time_ms: u64,
}

/// True-airspeed sample (m/s).
#[derive(Debug, Clone, Copy)]
pub struct AirspeedObs {
    pub vtas: f32,
    pub time_ms: u64,
}

/// Range-finder sample along the (pitched) body Z axis (m).
#[derive(Debug, Clone, Copy)]
pub struct RangeObs {
    pub rng: f32,
    pub time_ms: u64,
}

/// Optical-flow LOS rates about sensor X and Y (rad/s), integrated over `dt`.
#[derive(Debug, Clone, Copy)]
pub struct FlowObs {
    pub los: [f32; 2],
    pub dt: f32,
    pub time_ms: u64,
}

// Attitude tilt gates for the downward-looking sensors
const RNG_COS_TILT_MIN: f32 = 0.87; // ~30 deg
const FLOW_COS_TILT_MIN: f32 = 0.71; // ~45 deg
const FLOW_MIN_HEIGHT: f32 = 0.1;
const TAS_MIN_SPEED: f32 = 1.0;

impl NavEkf {
    // =====================================================================
    // GNSS VELOCITY / POSITION / HEIGHT
    // =====================================================================

    /// Fuse GNSS velocity, GNSS horizontal position and baro height, in that
    /// order, as up to six sequential scalar observations. Observation noise
    /// is inflated with the navigation acceleration magnitude to down-weight
    /// GNSS during harsh maneuvering. A timed-out channel is reset to the
    /// observation instead of fused.
    pub fn fuse_vel_pos(&mut self, obs: &VelPosObs) -> FusionStatus {
        if !self.initialised() {
            return FusionStatus::NotInitialised;
        }
        let prm = self.params;
        let mut fused_any = false;
        let mut reset_any = false;
        let mut rejected_any = false;
        let mut worst_ratio = 0.0f32;

        // ---- GNSS velocity ----
        let n_vel = match obs.gps_mode {
            GpsFusionMode::Vel3D => 3,
            GpsFusionMode::Vel2D => 2,
            GpsFusionMode::NoVel => 0,
        };
        if let Some(vel) = obs.vel_ned {
            if n_vel > 0 {
                self.last_gps_vel = vel;
                let vel_err = 0.2 * self.acc_nav_mag;
                let r_obs = [
                    sq(prm.vne_sigma) + sq(vel_err),
                    sq(prm.vne_sigma) + sq(vel_err),
                    sq(prm.vd_sigma) + sq(vel_err),
                ];
                if self.vel_health.timed_out {
                    self.reset_velocity();
                    self.vel_health.pass(obs.gps_time_ms);
                    reset_any = true;
                } else {
                    let mut stored = self.primed_stored();
                    self.recall_states(&mut stored, obs.gps_time_ms);
                    let mut innov = [0.0f32; 3];
                    let mut sum_y2 = 0.0;
                    let mut sum_var = 0.0;
                    for i in 0..n_vel {
                        let si = idx::VN + i;
                        innov[i] = vel[i] - stored[si];
                        sum_y2 += sq(innov[i]);
                        sum_var += self.p[(si, si)] + r_obs[i];
                    }
                    if sum_y2 < sq(prm.vel_gate) * sum_var {
                        for i in 0..n_vel {
                            self.fuse_scalar_state(idx::VN + i, innov[i], r_obs[i]);
                        }
                        self.vel_health.pass(obs.gps_time_ms);
                        fused_any = true;
                    } else {
                        self.vel_health.fail(obs.gps_time_ms);
                        rejected_any = true;
                        worst_ratio = worst_ratio.max(sqrtf(sum_y2 / sum_var.max(1e-12)));
                    }
                }
            }
        }

        // ---- GNSS horizontal position ----
        if let Some(pos) = obs.pos_ne {
            self.last_gps_pos = pos;
            let pos_err = 0.2 * self.acc_nav_mag;
            let r_pos = sq(prm.pos_ne_sigma) + sq(pos_err);
            if self.pos_health.timed_out {
                self.reset_position();
                self.pos_health.pass(obs.gps_time_ms);
                reset_any = true;
            } else {
                let mut stored = self.primed_stored();
                self.recall_states(&mut stored, obs.gps_time_ms);
                let innov = [pos.x - stored[idx::PN], pos.y - stored[idx::PE]];
                let sum_y2 = sq(innov[0]) + sq(innov[1]);
                let sum_var =
                    self.p[(idx::PN, idx::PN)] + self.p[(idx::PE, idx::PE)] + 2.0 * r_pos;
                if sum_y2 < sq(prm.pos_gate) * sum_var {
                    self.fuse_scalar_state(idx::PN, innov[0], r_pos);
                    self.fuse_scalar_state(idx::PE, innov[1], r_pos);
                    self.pos_health.pass(obs.gps_time_ms);
                    fused_any = true;
                } else {
                    self.pos_health.fail(obs.gps_time_ms);
                    rejected_any = true;
                    worst_ratio = worst_ratio.max(sqrtf(sum_y2 / sum_var.max(1e-12)));
                }
            }
        }

        // ---- Baro height, fused as a down-position observation ----
        if let Some(hgt) = obs.hgt {
            self.last_hgt = hgt;
            let pos_err = 0.2 * self.acc_nav_mag;
            let r_hgt = sq(prm.pos_d_sigma) + sq(pos_err);
            if self.hgt_health.timed_out {
                self.reset_height();
                self.hgt_health.pass(obs.hgt_time_ms);
                reset_any = true;
            } else {
                let mut stored = self.primed_stored();
                self.recall_states(&mut stored, obs.hgt_time_ms);
                let obs_pd = self.height_ref() - hgt;
                let innov = obs_pd - stored[idx::PD];
                let var = self.p[(idx::PD, idx::PD)] + r_hgt;
                if sq(innov) < sq(prm.hgt_gate) * var {
                    self.fuse_scalar_state(idx::PD, innov, r_hgt);
                    self.hgt_health.pass(obs.hgt_time_ms);
                    fused_any = true;
                } else {
                    self.hgt_health.fail(obs.hgt_time_ms);
                    rejected_any = true;
                    worst_ratio = worst_ratio.max(sqrtf(sq(innov) / var.max(1e-12)));
                }
            }
        }

        if fused_any || reset_any {
            self.force_symmetry();
        }
        if reset_any {
            FusionStatus::TimedOutReset
        } else if fused_any {
            FusionStatus::Fused
        } else if rejected_any {
            FusionStatus::Rejected(worst_ratio)
        } else {
            FusionStatus::Disabled
        }
    }

    // =====================================================================
    // MAGNETOMETER
    // =====================================================================

    /// Fuse a 3-axis body-frame magnetometer sample against the earth-field
    /// and body-bias states, sequential X→Y→Z. Persistent rejection re-anchors
    /// the earth-field states to the current attitude and measurement.
    pub fn fuse_magnetometer(&mut self, obs: &MagObs) -> FusionStatus {
        if !self.initialised() {
            return FusionStatus::NotInitialised;
        }
        if !self.switches.use_compass {
            return FusionStatus::Disabled;
        }
        let prm = self.params;
        self.last_mag = obs.mag;

        if self.mag_health.timed_out {
            let bias = Vector3::new(
                self.states[idx::MBX],
                self.states[idx::MBY],
                self.states[idx::MBZ],
            );
            let field = self.tbn * (obs.mag - bias);
            self.states[idx::MN] = field.x;
            self.states[idx::ME] = field.y;
            self.states[idx::MD] = field.z;
            self.zero_rows_cols(idx::MN, idx::MBZ);
            for i in idx::MN..=idx::MBZ {
                self.p[(i, i)] = self.initial_variance(i);
            }
            self.mag_health.pass(obs.time_ms);
            return FusionStatus::TimedOutReset;
        }

        let mut stored = self.primed_stored();
        self.recall_states(&mut stored, obs.time_ms);
        let q_hist = rotation::quat_normalize(&Vector4::new(
            stored[idx::Q0],
            stored[idx::Q1],
            stored[idx::Q2],
            stored[idx::Q3],
        ));
        let mag_ned = Vector3::new(stored[idx::MN], stored[idx::ME], stored[idx::MD]);
        let bias = Vector3::new(stored[idx::MBX], stored[idx::MBY], stored[idx::MBZ]);
        let tnb_hist = rotation::quat_to_tbn(&q_hist).transpose();
        let m_pred = tnb_hist * mag_ned + bias;
        let dm_dq = rotation::dtnb_times_dq(&q_hist, &mag_ned);
        let r = sq(prm.mag_measurement_sigma);

        let mut h_rows = [StateVector::zeros(); 3];
        let mut innov = [0.0f32; 3];
        for axis in 0..3 {
            let mut h = StateVector::zeros();
            for k in 0..4 {
                h[k] = dm_dq[(axis, k)];
            }
            for j in 0..3 {
                h[idx::MN + j] = tnb_hist[(axis, j)];
            }
            h[idx::MBX + axis] = 1.0;
            h_rows[axis] = h;
            innov[axis] = obs.mag[axis] - m_pred[axis];
        }

        // Gate the whole sample on the pre-fusion covariance
        let mut sum_y2 = 0.0;
        let mut sum_var = 0.0;
        for axis in 0..3 {
            let hp: StateVector = self.p * h_rows[axis];
            sum_y2 += sq(innov[axis]);
            sum_var += h_rows[axis].dot(&hp) + r;
        }
        if sum_y2 < sq(prm.mag_gate) * sum_var {
            for axis in 0..3 {
                self.fuse_scalar(&h_rows[axis], innov[axis], r);
            }
            self.force_symmetry();
            self.mag_health.pass(obs.time_ms);
            FusionStatus::Fused
        } else {
            self.mag_health.fail(obs.time_ms);
            FusionStatus::Rejected(sqrtf(sum_y2 / sum_var.max(1e-12)))
        }
    }

    // =====================================================================
    // TRUE AIRSPEED
    // =====================================================================

    /// Fuse a true-airspeed scalar against velocity and wind. Airborne only;
    /// skipped below stall-ish speeds where the observation direction is
    /// undefined.
    pub fn fuse_airspeed(&mut self, obs: &AirspeedObs) -> FusionStatus {
        if !self.initialised() {
            return FusionStatus::NotInitialised;
        }
        if !self.switches.use_airspeed || self.on_ground() {
            return FusionStatus::Disabled;
        }
        let prm = self.params;

        let mut stored = self.primed_stored();
        self.recall_states(&mut stored, obs.time_ms);
        let rel = Vector3::new(
            stored[idx::VN] - stored[idx::WN],
            stored[idx::VE] - stored[idx::WE],
            stored[idx::VD],
        );
        let speed = rel.norm();
        if speed < TAS_MIN_SPEED {
            return FusionStatus::Disabled;
        }
        let vtas_pred = prm.eas2tas * speed;
        let innov = obs.vtas - vtas_pred;

        let g = prm.eas2tas / speed;
        let mut h = StateVector::zeros();
        h[idx::VN] = g * rel.x;
        h[idx::VE] = g * rel.y;
        h[idx::VD] = g * rel.z;
        h[idx::WN] = -g * rel.x;
        h[idx::WE] = -g * rel.y;
        let r = sq(prm.airspeed_measurement_sigma);

        let hp: StateVector = self.p * h;
        let var = h.dot(&hp) + r;
        if sq(innov) < sq(prm.tas_gate) * var {
            self.fuse_scalar(&h, innov, r);
            self.force_symmetry();
            self.tas_health.pass(obs.time_ms);
            FusionStatus::Fused
        } else {
            self.tas_health.fail(obs.time_ms);
            FusionStatus::Rejected(sqrtf(sq(innov) / var.max(1e-12)))
        }
    }

    // =====================================================================
    // RANGE FINDER
    // =====================================================================

    /// Fuse a range-finder sample against the terrain and down-position
    /// states. Gated off beyond ~30° of tilt; the first usable sample seeds
    /// the terrain state instead of being fused.
    pub fn fuse_range_finder(&mut self, obs: &RangeObs) -> FusionStatus {
        if !self.initialised() {
            return FusionStatus::NotInitialised;
        }
        if !self.switches.use_range_finder || obs.rng <= 0.0 {
            return FusionStatus::Disabled;
        }
        let prm = self.params;

        let mut stored = self.primed_stored();
        self.recall_states(&mut stored, obs.time_ms);
        let q_hist = rotation::quat_normalize(&Vector4::new(
            stored[idx::Q0],
            stored[idx::Q1],
            stored[idx::Q2],
            stored[idx::Q3],
        ));
        let eul = rotation::quat_to_eul(&q_hist);
        let cos_tilt = cosf(eul.y + prm.rng_finder_pitch) * cosf(eul.x);
        if cos_tilt < RNG_COS_TILT_MIN {
            return FusionStatus::Disabled;
        }
        self.last_range = obs.rng;

        if !self.terrain_initialised {
            self.reset_terrain();
            return FusionStatus::Fused;
        }

        let rng_pred = (stored[idx::TD] - stored[idx::PD]) / cos_tilt;
        let innov = obs.rng - rng_pred;
        let mut h = StateVector::zeros();
        h[idx::TD] = 1.0 / cos_tilt;
        h[idx::PD] = -1.0 / cos_tilt;
        let r = sq(prm.gnd_hgt_sigma * obs.rng).max(0.01);

        let hp: StateVector = self.p * h;
        let var = h.dot(&hp) + r;
        if sq(innov) < sq(prm.rng_gate) * var {
            self.fuse_scalar(&h, innov, r);
            self.force_symmetry();
            FusionStatus::Fused
        } else {
            FusionStatus::Rejected(sqrtf(sq(innov) / var.max(1e-12)))
        }
    }

    // =====================================================================
    // OPTICAL FLOW
    // =====================================================================

    /// Fuse two LOS-rate scalars, X then Y. The prediction combines the
    /// body angular rate recalled from the history ring with the NED velocity
    /// projected through the (misalignment-corrected) attitude, scaled by
    /// height above terrain and the flow scale-factor state.
    pub fn fuse_optical_flow(&mut self, obs: &FlowObs) -> FusionStatus {
        if !self.initialised() {
            return FusionStatus::NotInitialised;
        }
        if !self.switches.use_optical_flow || obs.dt <= 0.0 {
            return FusionStatus::Disabled;
        }
        let prm = self.params;

        let mut stored = self.primed_stored();
        self.recall_states(&mut stored, obs.time_ms);
        let q_hist = rotation::quat_normalize(&Vector4::new(
            stored[idx::Q0],
            stored[idx::Q1],
            stored[idx::Q2],
            stored[idx::Q3],
        ));
        let vel_hist = Vector3::new(stored[idx::VN], stored[idx::VE], stored[idx::VD]);
        let pd = stored[idx::PD];
        let terrain = stored[idx::TD];
        let sf = stored[idx::SF];

        let align = rotation::small_angle_dcm(&prm.flow_align);
        let tnb_flow = align * rotation::quat_to_tbn(&q_hist).transpose();
        let t22 = tnb_flow[(2, 2)];
        if t22 < FLOW_COS_TILT_MIN {
            return FusionStatus::Disabled;
        }
        let h_agl = terrain - pd;
        if h_agl < FLOW_MIN_HEIGHT {
            return FusionStatus::Disabled;
        }
        let range = h_agl / t22;
        let rel = tnb_flow * vel_hist;
        let omega = match self.recall_del_ang(obs.time_ms) {
            Some(d) => d / obs.dt,
            None => Vector3::zeros(),
        };

        let los_pred = [
            omega.x - sf * rel.y / range,
            omega.y + sf * rel.x / range,
        ];
        let innov = [obs.los[0] - los_pred[0], obs.los[1] - los_pred[1]];

        // Partials shared by both axes
        let dv_dq = align * rotation::dtnb_times_dq(&q_hist, &vel_hist);
        let dcol2_dq = rotation::dtnb_times_dq(&q_hist, &Vector3::new(0.0, 0.0, 1.0));
        let dt22_dq = align.row(2).into_owned() * dcol2_dq;
        let drange_dq = (-h_agl / sq(t22)) * dt22_dq;

        let g = sf / range;
        let range2 = sq(range);
        let mut h_rows = [StateVector::zeros(); 2];

        // X axis senses motion along sensor Y
        let b0 = sf * rel.y / range2;
        let mut h0 = StateVector::zeros();
        for k in 0..4 {
            h0[k] = -g * dv_dq[(1, k)] + b0 * drange_dq[(0, k)];
        }
        h0[idx::VN] = -g * tnb_flow[(1, 0)];
        h0[idx::VE] = -g * tnb_flow[(1, 1)];
        h0[idx::VD] = -g * tnb_flow[(1, 2)];
        h0[idx::PD] = -b0 / t22;
        h0[idx::TD] = b0 / t22;
        h0[idx::SF] = -rel.y / range;
        h_rows[0] = h0;

        // Y axis senses motion along sensor X
        let b1 = sf * rel.x / range2;
        let mut h1 = StateVector::zeros();
        for k in 0..4 {
            h1[k] = g * dv_dq[(0, k)] - b1 * drange_dq[(0, k)];
        }
        h1[idx::VN] = g * tnb_flow[(0, 0)];
        h1[idx::VE] = g * tnb_flow[(0, 1)];
        h1[idx::VD] = g * tnb_flow[(0, 2)];
        h1[idx::PD] = b1 / t22;
        h1[idx::TD] = -b1 / t22;
        h1[idx::SF] = rel.x / range;
        h_rows[1] = h1;

        let r = sq(prm.flow_measurement_sigma);
        let mut sum_y2 = 0.0;
        let mut sum_var = 0.0;
        for axis in 0..2 {
            let hp: StateVector = self.p * h_rows[axis];
            sum_y2 += sq(innov[axis]);
            sum_var += h_rows[axis].dot(&hp) + r;
        }
        if sum_y2 < sq(prm.flow_gate) * sum_var {
            for axis in 0..2 {
                self.fuse_scalar(&h_rows[axis], innov[axis], r);
            }
            self.force_symmetry();
            FusionStatus::Fused
        } else {
            FusionStatus::Rejected(sqrtf(sum_y2 / sum_var.max(1e-12)))
        }
    }

    // =====================================================================
    // SCALAR UPDATE CORE
    // =====================================================================

    /// One scalar Kalman update with a dense observation row:
    /// `K = P·Hᵀ/σ²`, `x ← x + K·y`, `P ← P − K·(H·P)`. Returns false (and
    /// flags the gain fault) without touching anything if the innovation
    /// variance is degenerate or a gain goes non-finite.
    fn fuse_scalar(&mut self, h: &StateVector, innov: f32, r: f32) -> bool {
        let hp: StateVector = self.p * *h;
        let s = h.dot(&hp) + r;
        if !s.is_finite() || s <= 1e-12 {
            self.kalman_gains_nan = true;
            return false;
        }
        let k = hp / s;
        for i in 0..N_STATES {
            if !k[i].is_finite() {
                self.kalman_gains_nan = true;
                return false;
            }
        }
        self.states += k * innov;
        self.p -= k * hp.transpose();
        self.normalize_quat_states();
        true
    }

    /// Scalar update for an observation of a single state: the observation
    /// row is a unit vector, so `P·Hᵀ` is just a covariance column.
    fn fuse_scalar_state(&mut self, si: usize, innov: f32, r: f32) -> bool {
        let hp: StateVector = self.p.column(si).into_owned();
        let s = hp[si] + r;
        if !s.is_finite() || s <= 1e-12 {
            self.kalman_gains_nan = true;
            return false;
        }
        let k = hp / s;
        for i in 0..N_STATES {
            if !k[i].is_finite() {
                self.kalman_gains_nan = true;
                return false;
            }
        }
        self.states += k * innov;
        self.p -= k * hp.transpose();
        self.normalize_quat_states();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::EkfParams;
    use crate::GRAVITY;
    use approx::assert_relative_eq;

    const LEVEL_ACCEL: Vector3<f32> = Vector3::new(0.0, 0.0, -GRAVITY);
    const MAG_NED: Vector3<f32> = Vector3::new(0.2, 0.0, 0.45);

    fn level_filter() -> NavEkf {
        let mut ekf = NavEkf::new(EkfParams::default());
        ekf.initialise_filter(&LEVEL_ACCEL, &MAG_NED, &Vector3::zeros(), 100.0, 0);
        ekf
    }

    #[test]
    fn test_uninitialised_fusion_is_noop() {
        let mut ekf = NavEkf::new(EkfParams::default());
        let obs = VelPosObs {
            pos_ne: Some(Vector2::new(10.0, 0.0)),
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::NotInitialised);
    }

    #[test]
    fn test_gps_position_step_pulls_state() {
        let mut ekf = level_filter();
        let var_before = ekf.covariance()[(idx::PN, idx::PN)];
        let obs = VelPosObs {
            pos_ne: Some(Vector2::new(10.0, 0.0)),
            gps_time_ms: 0,
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::Fused);
        let pn = ekf.states()[idx::PN];
        assert!(pn > 9.0 && pn < 11.0, "pn = {}", pn);
        assert!(ekf.covariance()[(idx::PN, idx::PN)] < var_before);
        assert!(ekf.report().pos.healthy);
    }

    #[test]
    fn test_gated_outlier_leaves_filter_untouched() {
        let mut ekf = level_filter();
        let states_before = *ekf.states();
        let p_before = *ekf.covariance();
        let obs = VelPosObs {
            pos_ne: Some(Vector2::new(5000.0, 0.0)),
            gps_time_ms: 0,
            ..Default::default()
        };
        let status = ekf.fuse_vel_pos(&obs);
        assert!(matches!(status, FusionStatus::Rejected(_)));
        assert_eq!(*ekf.states(), states_before);
        assert_eq!(*ekf.covariance(), p_before);
        assert!(!ekf.report().pos.healthy);
    }

    #[test]
    fn test_gps_velocity_fusion_tightens_velocity() {
        let mut ekf = level_filter();
        let var_before = ekf.covariance()[(idx::VN, idx::VN)];
        let obs = VelPosObs {
            vel_ned: Some(Vector3::new(1.0, 0.0, 0.0)),
            gps_time_ms: 0,
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::Fused);
        assert!(ekf.states()[idx::VN] > 0.0);
        assert!(ekf.covariance()[(idx::VN, idx::VN)] < var_before);
    }

    #[test]
    fn test_vel2d_mode_skips_vertical() {
        let mut ekf = level_filter();
        let vd_var = ekf.covariance()[(idx::VD, idx::VD)];
        let obs = VelPosObs {
            vel_ned: Some(Vector3::new(1.0, 1.0, 5.0)),
            gps_mode: GpsFusionMode::Vel2D,
            gps_time_ms: 0,
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::Fused);
        // Vertical channel untouched by a 2D fix
        assert_relative_eq!(ekf.states()[idx::VD], 0.0, epsilon = 1e-6);
        assert_relative_eq!(ekf.covariance()[(idx::VD, idx::VD)], vd_var, epsilon = 1e-6);
    }

    #[test]
    fn test_height_step_moves_down_position() {
        let mut ekf = level_filter();
        // Baro reads 10 m above the datum set at init (100 m)
        let obs = VelPosObs {
            hgt: Some(110.0),
            hgt_time_ms: 0,
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::Fused);
        assert!(ekf.states()[idx::PD] < -5.0, "pd = {}", ekf.states()[idx::PD]);
    }

    #[test]
    fn test_pos_timeout_resets_to_measurement() {
        let mut ekf = level_filter();
        ekf.pos_health.timed_out = true;
        let obs = VelPosObs {
            pos_ne: Some(Vector2::new(20.0, -3.0)),
            gps_time_ms: 12_000,
            ..Default::default()
        };
        assert_eq!(ekf.fuse_vel_pos(&obs), FusionStatus::TimedOutReset);
        assert_relative_eq!(ekf.states()[idx::PN], 20.0);
        assert_relative_eq!(ekf.states()[idx::PE], -3.0);
        assert!(!ekf.report().pos.timed_out);
        assert_relative_eq!(
            ekf.covariance()[(idx::PN, idx::PN)],
            ekf.params.pos_ne_sigma * ekf.params.pos_ne_sigma,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_mag_fusion_accepts_consistent_sample() {
        let mut ekf = level_filter();
        let att_var_before = ekf.covariance()[(idx::Q3, idx::Q3)];
        // Level attitude, so the body sample equals the NED field
        let status = ekf.fuse_magnetometer(&MagObs {
            mag: MAG_NED,
            time_ms: 0,
        });
        assert_eq!(status, FusionStatus::Fused);
        assert!(ekf.covariance()[(idx::Q3, idx::Q3)] <= att_var_before);
        assert_relative_eq!(ekf.quaternion().norm(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_mag_fusion_rejects_spike() {
        let mut ekf = level_filter();
        let states_before = *ekf.states();
        let status = ekf.fuse_magnetometer(&MagObs {
            mag: Vector3::new(3.0, -3.0, 3.0),
            time_ms: 0,
        });
        assert!(matches!(status, FusionStatus::Rejected(_)));
        assert_eq!(*ekf.states(), states_before);
    }

    #[test]
    fn test_mag_timeout_reinitialises_field() {
        let mut ekf = level_filter();
        ekf.mag_health.timed_out = true;
        let sample = Vector3::new(0.3, 0.1, 0.4);
        let status = ekf.fuse_magnetometer(&MagObs {
            mag: sample,
            time_ms: 11_000,
        });
        assert_eq!(status, FusionStatus::TimedOutReset);
        // Level attitude: the re-anchored earth field equals the body sample
        assert_relative_eq!(ekf.states()[idx::MN], 0.3, epsilon = 1e-5);
        assert_relative_eq!(ekf.states()[idx::MD], 0.4, epsilon = 1e-5);
        assert!(ekf.report().mag.healthy);
    }

    #[test]
    fn test_airspeed_disabled_on_ground() {
        let mut ekf = level_filter();
        ekf.switches.use_airspeed = true;
        let status = ekf.fuse_airspeed(&AirspeedObs {
            vtas: 15.0,
            time_ms: 0,
        });
        assert_eq!(status, FusionStatus::Disabled);
    }

    #[test]
    fn test_airspeed_fusion_observes_wind() {
        let mut ekf = level_filter();
        ekf.switches.use_airspeed = true;
        ekf.set_on_ground(false);
        ekf.states[idx::VN] = 20.0;
        ekf.store_states(1000);
        // Measured TAS above ground speed implies wind from the north
        let status = ekf.fuse_airspeed(&AirspeedObs {
            vtas: 22.0,
            time_ms: 1000,
        });
        assert_eq!(status, FusionStatus::Fused);
        assert!(ekf.wind().x < 0.0, "wind_n = {}", ekf.wind().x);
    }

    #[test]
    fn test_range_seeds_then_fuses_terrain() {
        let mut ekf = level_filter();
        ekf.switches.use_range_finder = true;
        ekf.states[idx::PD] = -50.0;
        ekf.store_states(1000);
        // First sample seeds the terrain state
        assert_eq!(
            ekf.fuse_range_finder(&RangeObs {
                rng: 48.0,
                time_ms: 1000
            }),
            FusionStatus::Fused
        );
        assert_relative_eq!(ekf.states()[idx::TD], -2.0, epsilon = 1e-4);
        // Second sample fuses against it
        ekf.store_states(1100);
        let td_before = ekf.states()[idx::TD];
        assert_eq!(
            ekf.fuse_range_finder(&RangeObs {
                rng: 47.0,
                time_ms: 1100
            }),
            FusionStatus::Fused
        );
        assert!(ekf.states()[idx::TD] < td_before);
    }

    #[test]
    fn test_range_tilt_gate() {
        let mut ekf = level_filter();
        ekf.switches.use_range_finder = true;
        // Roll the vehicle 60 degrees and re-store
        let q = rotation::eul_to_quat(&Vector3::new(1.05, 0.0, 0.0));
        ekf.states[idx::Q0] = q[0];
        ekf.states[idx::Q1] = q[1];
        ekf.states[idx::Q2] = q[2];
        ekf.states[idx::Q3] = q[3];
        ekf.store_states(1000);
        let status = ekf.fuse_range_finder(&RangeObs {
            rng: 30.0,
            time_ms: 1000,
        });
        assert_eq!(status, FusionStatus::Disabled);
    }

    #[test]
    fn test_flow_fusion_consistent_sample() {
        let mut ekf = level_filter();
        ekf.switches.use_optical_flow = true;
        ekf.set_on_ground(false);
        ekf.states[idx::VN] = 10.0;
        ekf.states[idx::PD] = -50.0;
        ekf.states[idx::TD] = 0.0;
        ekf.store_states(1000);
        // Level, 10 m/s north at 50 m AGL: LOS-Y rate = v/h = 0.2 rad/s
        let status = ekf.fuse_optical_flow(&FlowObs {
            los: [0.0, 0.21],
            dt: 0.02,
            time_ms: 1000,
        });
        assert_eq!(status, FusionStatus::Fused);
        for i in 0..N_STATES {
            assert!(ekf.states()[i].is_finite());
        }
    }

    #[test]
    fn test_flow_needs_height_above_terrain() {
        let mut ekf = level_filter();
        ekf.switches.use_optical_flow = true;
        // Terrain equals vehicle height: nothing to scale flow against
        let status = ekf.fuse_optical_flow(&FlowObs {
            los: [0.0, 0.0],
            dt: 0.02,
            time_ms: 0,
        });
        assert_eq!(status, FusionStatus::Disabled);
    }

    #[test]
    fn test_recall_alignment_uses_measurement_time() {
        let mut ekf = level_filter();
        // Position advances 1 m per stored tick
        for k in 1..=20u64 {
            ekf.states[idx::PN] = k as f32;
            ekf.store_states(k * 100);
        }
        // A delayed GNSS sample from t=1000 must fuse against pn = 10, not 20
        let mut stored = ekf.primed_stored();
        assert_eq!(ekf.recall_states(&mut stored, 1000), 0);
        assert_relative_eq!(stored[idx::PN], 10.0);
    }
}
