//! Sensor models: turn a truth trajectory into timestamped, noisy samples at
//! per-sensor rates, with optional dropout windows for outage scenarios.

use crate::scenario::Truth;
use nalgebra::{Vector2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

pub struct SensorConfig {
    /// Global multiplier on every noise sigma; zero gives ideal sensors.
    pub noise_scale: f32,
    pub accel_noise_std: f32, // m/s^2
    pub gyro_noise_std: f32,  // rad/s
    pub mag_noise_std: f32,   // Gauss
    pub baro_noise_std: f32,  // m
    pub gps_pos_noise_std: f32, // m
    pub gps_vel_noise_std: f32, // m/s
    pub tas_noise_std: f32,   // m/s
    pub rng_noise_std: f32,   // m
    pub flow_noise_std: f32,  // rad/s

    // Static sensor biases
    pub accel_bias: Vector3<f32>,
    pub gyro_bias: Vector3<f32>,

    // Sample rates; zero disables a sensor entirely
    pub gps_hz: f32,
    pub baro_hz: f32,
    pub mag_hz: f32,
    pub tas_hz: f32,
    pub rng_hz: f32,
    pub flow_hz: f32,

    /// GNSS dropout window (start s, end s).
    pub gps_outage: Option<(f32, f32)>,

    /// Earth magnetic field in NED (Gauss).
    pub mag_field_ned: Vector3<f32>,
    /// Baro altitude of the NED origin (the filter's height datum).
    pub baro_ref_hgt: f32,
    /// Terrain NED-down coordinate under the whole trajectory.
    pub terrain_d: f32,
    /// Ambient wind, North/East (affects airspeed only).
    pub wind_ne: Vector2<f32>,

    pub seed: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            noise_scale: 1.0,
            accel_noise_std: 0.05,
            gyro_noise_std: 0.002,
            mag_noise_std: 0.002,
            baro_noise_std: 0.3,
            gps_pos_noise_std: 1.5,
            gps_vel_noise_std: 0.1,
            tas_noise_std: 0.7,
            rng_noise_std: 0.1,
            flow_noise_std: 0.02,
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            gps_hz: 10.0,
            baro_hz: 20.0,
            mag_hz: 10.0,
            tas_hz: 0.0,
            rng_hz: 0.0,
            flow_hz: 0.0,
            gps_outage: None,
            mag_field_ned: Vector3::new(0.2, 0.0, 0.45),
            baro_ref_hgt: 100.0,
            terrain_d: 0.0,
            wind_ne: Vector2::zeros(),
            seed: 42,
        }
    }
}

pub struct ImuRecord {
    pub time_ms: u64,
    pub d_ang: Vector3<f32>,
    pub d_vel: Vector3<f32>,
    pub dt: f32,
}

pub struct GpsRecord {
    pub time_ms: u64,
    pub vel_ned: Vector3<f32>,
    pub pos_ne: Vector2<f32>,
}

pub struct ScalarRecord {
    pub time_ms: u64,
    pub value: f32,
}

pub struct MagRecord {
    pub time_ms: u64,
    pub mag: Vector3<f32>,
}

pub struct FlowRecord {
    pub time_ms: u64,
    pub los: [f32; 2],
    pub dt: f32,
}

pub struct SensorData {
    pub imu: Vec<ImuRecord>,
    pub gps: Vec<GpsRecord>,
    pub baro: Vec<ScalarRecord>,
    pub mag: Vec<MagRecord>,
    pub tas: Vec<ScalarRecord>,
    pub rng: Vec<ScalarRecord>,
    pub flow: Vec<FlowRecord>,
}

pub fn generate_sensor_data(truth: &Truth, cfg: &SensorConfig) -> SensorData {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let dist = |std: f32| Normal::new(0.0, (cfg.noise_scale * std) as f64).unwrap();

    let d_accel = dist(cfg.accel_noise_std);
    let d_gyro = dist(cfg.gyro_noise_std);
    let d_mag = dist(cfg.mag_noise_std);
    let d_baro = dist(cfg.baro_noise_std);
    let d_gps_p = dist(cfg.gps_pos_noise_std);
    let d_gps_v = dist(cfg.gps_vel_noise_std);
    let d_tas = dist(cfg.tas_noise_std);
    let d_rng = dist(cfg.rng_noise_std);
    let d_flow = dist(cfg.flow_noise_std);

    let mut data = SensorData {
        imu: Vec::with_capacity(truth.time.len()),
        gps: Vec::new(),
        baro: Vec::new(),
        mag: Vec::new(),
        tas: Vec::new(),
        rng: Vec::new(),
        flow: Vec::new(),
    };

    let dt = truth.dt;
    let mut next_gps = 0.0f32;
    let mut next_baro = 0.0f32;
    let mut next_mag = 0.0f32;
    let mut next_tas = 0.0f32;
    let mut next_rng = 0.0f32;
    let mut next_flow = 0.0f32;

    for i in 0..truth.time.len() {
        let t = truth.time[i];
        let time_ms = (t * 1000.0).round() as u64;

        // IMU increments integrate the preceding interval [t_{i-1}, t_i], so
        // the record stream starts one tick in; aiding sensors start at t = 0
        if i > 0 {
            let d_ang = (truth.body_rates[i - 1] + cfg.gyro_bias + noise3(&d_gyro, &mut rng)) * dt;
            let d_vel = (truth.accel_body[i - 1] + cfg.accel_bias + noise3(&d_accel, &mut rng)) * dt;
            data.imu.push(ImuRecord {
                time_ms,
                d_ang,
                d_vel,
                dt,
            });
        }

        if due(cfg.gps_hz, t, &mut next_gps) {
            let in_outage = cfg
                .gps_outage
                .map(|(start, end)| t >= start && t < end)
                .unwrap_or(false);
            if !in_outage {
                let vel = truth.vel[i] + noise3(&d_gps_v, &mut rng);
                let pos = truth.pos[i];
                data.gps.push(GpsRecord {
                    time_ms,
                    vel_ned: vel,
                    pos_ne: Vector2::new(
                        pos.x + sample(&d_gps_p, &mut rng),
                        pos.y + sample(&d_gps_p, &mut rng),
                    ),
                });
            }
        }

        if due(cfg.baro_hz, t, &mut next_baro) {
            let hgt = cfg.baro_ref_hgt - truth.pos[i].z + sample(&d_baro, &mut rng);
            data.baro.push(ScalarRecord {
                time_ms,
                value: hgt,
            });
        }

        if due(cfg.mag_hz, t, &mut next_mag) {
            let mag_body = truth.att[i].inverse_transform_vector(&cfg.mag_field_ned);
            data.mag.push(MagRecord {
                time_ms,
                mag: mag_body + noise3(&d_mag, &mut rng),
            });
        }

        if due(cfg.tas_hz, t, &mut next_tas) {
            let rel = Vector3::new(
                truth.vel[i].x - cfg.wind_ne.x,
                truth.vel[i].y - cfg.wind_ne.y,
                truth.vel[i].z,
            );
            data.tas.push(ScalarRecord {
                time_ms,
                value: rel.norm() + sample(&d_tas, &mut rng),
            });
        }

        if due(cfg.rng_hz, t, &mut next_rng) {
            let tbn = truth.att[i].to_rotation_matrix().into_inner();
            let cos_tilt = tbn[(2, 2)];
            let h_agl = cfg.terrain_d - truth.pos[i].z;
            if cos_tilt > 0.5 && h_agl > 0.0 {
                data.rng.push(ScalarRecord {
                    time_ms,
                    value: h_agl / cos_tilt + sample(&d_rng, &mut rng),
                });
            }
        }

        if due(cfg.flow_hz, t, &mut next_flow) {
            let tnb = truth.att[i].inverse().to_rotation_matrix().into_inner();
            let h_agl = cfg.terrain_d - truth.pos[i].z;
            if h_agl > 0.1 {
                let range = h_agl / tnb[(2, 2)].max(0.5);
                let rel = tnb * truth.vel[i];
                let rates = truth.body_rates[i];
                // dt is the IMU tick: the filter converts the recalled
                // per-tick delta angle back to a rate with it
                data.flow.push(FlowRecord {
                    time_ms,
                    los: [
                        rates.x - rel.y / range + sample(&d_flow, &mut rng),
                        rates.y + rel.x / range + sample(&d_flow, &mut rng),
                    ],
                    dt,
                });
            }
        }
    }

    data
}

fn sample(d: &Normal<f64>, rng: &mut StdRng) -> f32 {
    d.sample(rng) as f32
}

fn noise3(d: &Normal<f64>, rng: &mut StdRng) -> Vector3<f32> {
    Vector3::new(sample(d, rng), sample(d, rng), sample(d, rng))
}

fn due(hz: f32, t: f32, next: &mut f32) -> bool {
    if hz <= 0.0 {
        return false;
    }
    if t + 1e-6 >= *next {
        *next += 1.0 / hz;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{generate, Scenario};

    #[test]
    fn test_rates_and_counts() {
        let truth = generate(Scenario::StaticPad, 2.0, 0.01);
        let data = generate_sensor_data(&truth, &SensorConfig::default());
        assert_eq!(data.imu.len(), truth.time.len() - 1);
        // 10 Hz GPS over 2 s: ~21 samples including t=0
        assert!(data.gps.len() >= 20 && data.gps.len() <= 22);
        assert!(data.baro.len() >= 40);
        assert!(data.tas.is_empty());
    }

    #[test]
    fn test_outage_window_drops_gps() {
        let truth = generate(Scenario::StaticPad, 3.0, 0.01);
        let cfg = SensorConfig {
            gps_outage: Some((1.0, 2.0)),
            ..Default::default()
        };
        let data = generate_sensor_data(&truth, &cfg);
        assert!(!data
            .gps
            .iter()
            .any(|g| g.time_ms >= 1000 && g.time_ms < 2000));
        assert!(data.gps.iter().any(|g| g.time_ms >= 2000));
    }

    #[test]
    fn test_zero_noise_is_exact() {
        let truth = generate(Scenario::StaticPad, 1.0, 0.01);
        let cfg = SensorConfig {
            noise_scale: 0.0,
            ..Default::default()
        };
        let data = generate_sensor_data(&truth, &cfg);
        let imu = data.imu.last().unwrap();
        assert_eq!(imu.d_ang, Vector3::zeros());
        let baro = data.baro.last().unwrap();
        assert!((baro.value - 100.0).abs() < 1e-5);
    }
}
