//! Deterministic truth-trajectory generators.
//!
//! The filter, not the vehicle, is under test here, so these are kinematic
//! profiles rather than a dynamics model: a motionless pad, a constant-rate
//! yaw turn, and an accelerate-then-cruise leg. Everything is exact, so any
//! estimation error seen downstream belongs to the sensors or the filter.

use kestrel_core::GRAVITY;
use nalgebra::{UnitQuaternion, Vector3};

/// Flight profile selector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scenario {
    /// Motionless, level, nose north.
    StaticPad,
    /// Level, motionless position, constant body-Z rotation (rad/s).
    YawRotation { rate: f32 },
    /// Accelerate north at `accel` m/s² until `cruise_speed`, then hold.
    CruiseLeg { accel: f32, cruise_speed: f32 },
}

/// Columnar truth output, one row per IMU tick.
pub struct Truth {
    pub dt: f32,
    pub time: Vec<f32>,
    pub pos: Vec<Vector3<f32>>,
    pub vel: Vec<Vector3<f32>>,
    pub att: Vec<UnitQuaternion<f32>>,
    /// Body rotation rates (rad/s).
    pub body_rates: Vec<Vector3<f32>>,
    /// Specific force in body axes (what an accelerometer reads).
    pub accel_body: Vec<Vector3<f32>>,
}

/// Generate `duration` seconds of truth at the IMU interval `dt`.
pub fn generate(scenario: Scenario, duration: f32, dt: f32) -> Truth {
    let n = (duration / dt).round() as usize + 1;
    let mut truth = Truth {
        dt,
        time: Vec::with_capacity(n),
        pos: Vec::with_capacity(n),
        vel: Vec::with_capacity(n),
        att: Vec::with_capacity(n),
        body_rates: Vec::with_capacity(n),
        accel_body: Vec::with_capacity(n),
    };

    let gravity_ned = Vector3::new(0.0, 0.0, GRAVITY);
    let mut pos = Vector3::zeros();
    let mut vel = Vector3::zeros();
    let mut att = UnitQuaternion::identity();

    for i in 0..n {
        let t = i as f32 * dt;

        let (rates, accel_ned) = match scenario {
            Scenario::StaticPad => (Vector3::zeros(), Vector3::zeros()),
            Scenario::YawRotation { rate } => (Vector3::new(0.0, 0.0, rate), Vector3::zeros()),
            Scenario::CruiseLeg {
                accel,
                cruise_speed,
            } => {
                let a = if vel.x < cruise_speed { accel } else { 0.0 };
                (Vector3::zeros(), Vector3::new(a, 0.0, 0.0))
            }
        };

        // Specific force: kinematic acceleration minus gravity, in body axes
        let accel_body = att.inverse_transform_vector(&(accel_ned - gravity_ned));

        truth.time.push(t);
        truth.pos.push(pos);
        truth.vel.push(vel);
        truth.att.push(att);
        truth.body_rates.push(rates);
        truth.accel_body.push(accel_body);

        // Advance to the next tick
        pos += vel * dt + 0.5 * accel_ned * dt * dt;
        vel += accel_ned * dt;
        let angle = rates.norm() * dt;
        if angle > 0.0 {
            let axis = nalgebra::Unit::new_normalize(rates);
            att *= UnitQuaternion::from_axis_angle(&axis, angle);
        }
    }

    truth
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_static_pad_is_static() {
        let truth = generate(Scenario::StaticPad, 1.0, 0.01);
        let last = truth.pos.last().unwrap();
        assert_relative_eq!(last.norm(), 0.0);
        // Accelerometer reads -1g on body Z while level
        let f = truth.accel_body.last().unwrap();
        assert_relative_eq!(f.z, -GRAVITY, epsilon = 1e-5);
    }

    #[test]
    fn test_yaw_rotation_accumulates_heading() {
        let truth = generate(Scenario::YawRotation { rate: 0.1 }, 10.0, 0.01);
        let (_, _, yaw) = truth.att.last().unwrap().euler_angles();
        assert_relative_eq!(yaw, 1.0, epsilon = 1e-3);
        assert_relative_eq!(truth.pos.last().unwrap().norm(), 0.0);
    }

    #[test]
    fn test_cruise_leg_reaches_speed() {
        let truth = generate(
            Scenario::CruiseLeg {
                accel: 2.0,
                cruise_speed: 10.0,
            },
            10.0,
            0.01,
        );
        let v = truth.vel.last().unwrap();
        assert!(v.x >= 10.0 && v.x < 10.1, "vx = {}", v.x);
        assert!(truth.pos.last().unwrap().x > 50.0);
    }
}
