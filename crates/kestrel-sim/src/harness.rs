//! Drives the filter over a generated sensor stream in the canonical per-tick
//! order: strapdown → store → covariance-if-due → fusion (GNSS/baro, mag,
//! airspeed, range, flow) → health check.

use crate::sensor::SensorData;
use kestrel_core::{
    AirspeedObs, EkfParams, EkfReport, FlowObs, FusionStatus, ImuSample, MagObs, NavEkf, RangeObs,
    SensorSwitches, VelPosObs,
};
use nalgebra::Vector3;

pub struct HarnessConfig {
    pub params: EkfParams,
    pub switches: SensorSwitches,
    /// Seconds after which the vehicle is declared airborne; `None` keeps it
    /// on the ground for the whole run.
    pub airborne_after: Option<f32>,
    /// Leading IMU samples averaged for the static attitude solve.
    pub align_samples: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            params: EkfParams::default(),
            switches: SensorSwitches::default(),
            airborne_after: None,
            align_samples: 25,
        }
    }
}

/// Accept/reject/reset counters for one fusion channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionTally {
    pub fused: u32,
    pub rejected: u32,
    pub resets: u32,
}

impl FusionTally {
    fn add(&mut self, status: FusionStatus) {
        match status {
            FusionStatus::Fused => self.fused += 1,
            FusionStatus::Rejected(_) => self.rejected += 1,
            FusionStatus::TimedOutReset => self.resets += 1,
            FusionStatus::NotInitialised | FusionStatus::Disabled => {}
        }
    }
}

/// Per-tick estimates plus bookkeeping for the whole run.
pub struct FilterResult {
    pub time: Vec<f32>,
    pub pos: Vec<Vector3<f32>>,
    pub vel: Vec<Vector3<f32>>,
    pub euler: Vec<Vector3<f32>>,
    pub velpos: FusionTally,
    pub mag: FusionTally,
    pub tas: FusionTally,
    pub rng: FusionTally,
    pub flow: FusionTally,
    /// Total invalid entries reported by the per-tick health checks.
    pub health_errors: usize,
    pub final_report: EkfReport,
}

/// Run the filter over the sensor stream and collect estimates.
pub fn run_filter(data: &SensorData, cfg: &HarnessConfig) -> FilterResult {
    let (result, _) = run_filter_returning_ekf(data, cfg);
    result
}

/// As [`run_filter`], also handing back the filter for post-run inspection.
pub fn run_filter_returning_ekf(data: &SensorData, cfg: &HarnessConfig) -> (FilterResult, NavEkf) {
    let mut ekf = NavEkf::new(cfg.params);
    ekf.switches = cfg.switches;

    // Static alignment from the leading samples
    let n_align = cfg.align_samples.clamp(1, data.imu.len().max(1));
    let mut accel_sum = Vector3::zeros();
    for rec in data.imu.iter().take(n_align) {
        accel_sum += rec.d_vel / rec.dt;
    }
    let accel_avg = accel_sum / n_align as f32;
    // Average the leading magnetometer samples too: a single sample's noise
    // lands straight in the initial yaw
    let mag0 = if data.mag.is_empty() {
        Vector3::new(0.2, 0.0, 0.45)
    } else {
        let k = data.mag.len().min(10);
        data.mag
            .iter()
            .take(k)
            .fold(Vector3::zeros(), |acc, m| acc + m.mag)
            / k as f32
    };
    let baro0 = data.baro.first().map(|b| b.value).unwrap_or(0.0);
    let t0 = data.imu.first().map(|r| r.time_ms).unwrap_or(0);
    ekf.initialise_filter(&accel_avg, &mag0, &Vector3::zeros(), baro0, t0);

    let n = data.imu.len();
    let mut result = FilterResult {
        time: Vec::with_capacity(n),
        pos: Vec::with_capacity(n),
        vel: Vec::with_capacity(n),
        euler: Vec::with_capacity(n),
        velpos: FusionTally::default(),
        mag: FusionTally::default(),
        tas: FusionTally::default(),
        rng: FusionTally::default(),
        flow: FusionTally::default(),
        health_errors: 0,
        final_report: ekf.report(),
    };

    let (mut gi, mut bi, mut mi, mut ti, mut ri, mut fi) = (0usize, 0usize, 0usize, 0usize, 0usize, 0usize);

    for rec in &data.imu {
        ekf.update_strapdown(&ImuSample {
            d_ang: rec.d_ang,
            d_vel: rec.d_vel,
            dt: rec.dt,
        });
        ekf.store_states(rec.time_ms);
        ekf.predict_covariance_if_due();

        if let Some(after) = cfg.airborne_after {
            if ekf.on_ground() && rec.time_ms as f32 / 1000.0 >= after {
                ekf.set_on_ground(false);
            }
        }

        // Fusion order: GNSS/baro → mag → airspeed → range → flow
        let gps = next_due(&data.gps, &mut gi, rec.time_ms, |g| g.time_ms);
        let baro = next_due(&data.baro, &mut bi, rec.time_ms, |b| b.time_ms);
        if gps.is_some() || baro.is_some() {
            let obs = VelPosObs {
                vel_ned: gps.map(|g| g.vel_ned),
                gps_mode: Default::default(),
                pos_ne: gps.map(|g| g.pos_ne),
                gps_time_ms: gps.map(|g| g.time_ms).unwrap_or(rec.time_ms),
                hgt: baro.map(|b| b.value),
                hgt_time_ms: baro.map(|b| b.time_ms).unwrap_or(rec.time_ms),
            };
            result.velpos.add(ekf.fuse_vel_pos(&obs));
        }
        if let Some(m) = next_due(&data.mag, &mut mi, rec.time_ms, |m| m.time_ms) {
            result.mag.add(ekf.fuse_magnetometer(&MagObs {
                mag: m.mag,
                time_ms: m.time_ms,
            }));
        }
        if let Some(t) = next_due(&data.tas, &mut ti, rec.time_ms, |t| t.time_ms) {
            result.tas.add(ekf.fuse_airspeed(&AirspeedObs {
                vtas: t.value,
                time_ms: t.time_ms,
            }));
        }
        if let Some(r) = next_due(&data.rng, &mut ri, rec.time_ms, |r| r.time_ms) {
            result.rng.add(ekf.fuse_range_finder(&RangeObs {
                rng: r.value,
                time_ms: r.time_ms,
            }));
        }
        if let Some(f) = next_due(&data.flow, &mut fi, rec.time_ms, |f| f.time_ms) {
            result.flow.add(ekf.fuse_optical_flow(&FlowObs {
                los: f.los,
                dt: f.dt,
                time_ms: f.time_ms,
            }));
        }

        result.health_errors += ekf.check_and_bound(rec.time_ms);

        result.time.push(rec.time_ms as f32 / 1000.0);
        result.pos.push(ekf.position());
        result.vel.push(ekf.velocity());
        result.euler.push(ekf.euler());
    }

    result.final_report = ekf.report();
    (result, ekf)
}

/// Filter tuning snapshot for run logs.
pub fn params_json(p: &EkfParams) -> serde_json::Value {
    serde_json::json!({
        "cov_time_step_max": p.cov_time_step_max,
        "cov_del_ang_max": p.cov_del_ang_max,
        "gyro_process_noise": p.gyro_process_noise,
        "accel_process_noise": p.accel_process_noise,
        "vne_sigma": p.vne_sigma,
        "vd_sigma": p.vd_sigma,
        "pos_ne_sigma": p.pos_ne_sigma,
        "pos_d_sigma": p.pos_d_sigma,
        "mag_measurement_sigma": p.mag_measurement_sigma,
        "airspeed_measurement_sigma": p.airspeed_measurement_sigma,
        "vel_gate": p.vel_gate,
        "pos_gate": p.pos_gate,
        "hgt_gate": p.hgt_gate,
        "mag_gate": p.mag_gate,
    })
}

fn next_due<'a, T>(
    list: &'a [T],
    i: &mut usize,
    now_ms: u64,
    time: impl Fn(&T) -> u64,
) -> Option<&'a T> {
    if *i < list.len() && time(&list[*i]) <= now_ms {
        let rec = &list[*i];
        *i += 1;
        Some(rec)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{generate, Scenario};
    use crate::sensor::{generate_sensor_data, SensorConfig};

    #[test]
    fn test_static_run_stays_near_origin() {
        let truth = generate(Scenario::StaticPad, 2.0, 0.01);
        let data = generate_sensor_data(&truth, &SensorConfig::default());
        let result = run_filter(&data, &HarnessConfig::default());
        assert_eq!(result.health_errors, 0);
        assert!(result.velpos.fused > 0);
        assert!(result.mag.fused > 0);
        let final_pos = result.pos.last().unwrap();
        assert!(final_pos.norm() < 2.0, "pos = {}", final_pos);
        let final_vel = result.vel.last().unwrap();
        assert!(final_vel.norm() < 0.3, "vel = {}", final_vel);
    }

    #[test]
    fn test_params_json_round_trips() {
        let v = params_json(&EkfParams::default());
        assert!((v["pos_ne_sigma"].as_f64().unwrap() - 2.0).abs() < 1e-9);
    }
}
