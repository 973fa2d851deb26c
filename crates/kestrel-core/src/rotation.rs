//! Quaternion and rotation-matrix helpers.
//!
//! The filter keeps the attitude quaternion as four raw state-vector entries
//! (scalar first, body→NED sense), so everything here works on plain
//! `Vector4<f32>` components rather than `UnitQuaternion`: the covariance
//! predictor and the magnetometer/optical-flow observation models need
//! per-component Jacobians.
//!
//! Euler angles use the aerospace 3-2-1 sequence and exist only for
//! initialization and reporting; the running state is always the quaternion.

use libm::{asinf, atan2f, cosf, sinf, sqrtf};
use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3, Vector4};

/// Hamilton product a ⊗ b, both scalar-first.
pub fn quat_mul(a: &Vector4<f32>, b: &Vector4<f32>) -> Vector4<f32> {
    Vector4::new(
        a[0] * b[0] - a[1] * b[1] - a[2] * b[2] - a[3] * b[3],
        a[0] * b[1] + a[1] * b[0] + a[2] * b[3] - a[3] * b[2],
        a[0] * b[2] - a[1] * b[3] + a[2] * b[0] + a[3] * b[1],
        a[0] * b[3] + a[1] * b[2] - a[2] * b[1] + a[3] * b[0],
    )
}

/// Normalize to unit length. A degenerate (near-zero) quaternion collapses to
/// identity rather than propagating garbage.
pub fn quat_normalize(q: &Vector4<f32>) -> Vector4<f32> {
    let norm = sqrtf(q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]);
    if norm > 1e-12 {
        q / norm
    } else {
        Vector4::new(1.0, 0.0, 0.0, 0.0)
    }
}

/// Incremental rotation quaternion from a body-frame delta angle.
///
/// Exact form; falls back to the second-order small-angle expansion below
/// 1e-8 rad where sin(x)/x is numerically unreliable in f32.
pub fn delta_quat(del_ang: &Vector3<f32>) -> Vector4<f32> {
    let mag = del_ang.norm();
    if mag > 1e-8 {
        let half = 0.5 * mag;
        let s = sinf(half) / mag;
        Vector4::new(cosf(half), del_ang.x * s, del_ang.y * s, del_ang.z * s)
    } else {
        Vector4::new(
            1.0 - 0.125 * mag * mag,
            0.5 * del_ang.x,
            0.5 * del_ang.y,
            0.5 * del_ang.z,
        )
    }
}

/// Body→NED direction cosine matrix for a unit quaternion.
pub fn quat_to_tbn(q: &Vector4<f32>) -> Matrix3<f32> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    Matrix3::new(
        q0 * q0 + q1 * q1 - q2 * q2 - q3 * q3,
        2.0 * (q1 * q2 - q0 * q3),
        2.0 * (q1 * q3 + q0 * q2),
        2.0 * (q1 * q2 + q0 * q3),
        q0 * q0 - q1 * q1 + q2 * q2 - q3 * q3,
        2.0 * (q2 * q3 - q0 * q1),
        2.0 * (q1 * q3 - q0 * q2),
        2.0 * (q2 * q3 + q0 * q1),
        q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3,
    )
}

/// 3-2-1 Euler (roll, pitch, yaw) → quaternion.
pub fn eul_to_quat(eul: &Vector3<f32>) -> Vector4<f32> {
    let (cr, sr) = (cosf(0.5 * eul.x), sinf(0.5 * eul.x));
    let (cp, sp) = (cosf(0.5 * eul.y), sinf(0.5 * eul.y));
    let (cy, sy) = (cosf(0.5 * eul.z), sinf(0.5 * eul.z));
    Vector4::new(
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    )
}

/// Quaternion → 3-2-1 Euler (roll, pitch, yaw).
///
/// Pitch is clamped to ±90° at the gimbal singularity; callers must not drive
/// control feedback through this conversion.
pub fn quat_to_eul(q: &Vector4<f32>) -> Vector3<f32> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    let sin_pitch = (2.0 * (q0 * q2 - q3 * q1)).clamp(-1.0, 1.0);
    Vector3::new(
        atan2f(2.0 * (q0 * q1 + q2 * q3), 1.0 - 2.0 * (q1 * q1 + q2 * q2)),
        asinf(sin_pitch),
        atan2f(2.0 * (q0 * q3 + q1 * q2), 1.0 - 2.0 * (q2 * q2 + q3 * q3)),
    )
}

/// Matrix form of right-multiplication: q ⊗ p = quat_right_mat(p) · q.
///
/// This is the attitude block of the state-transition Jacobian when the
/// strapdown step composes the state quaternion with an increment p.
pub fn quat_right_mat(p: &Vector4<f32>) -> Matrix4<f32> {
    let (p0, p1, p2, p3) = (p[0], p[1], p[2], p[3]);
    Matrix4::new(
        p0, -p1, -p2, -p3, //
        p1, p0, p3, -p2, //
        p2, -p3, p0, p1, //
        p3, p2, -p1, p0,
    )
}

/// ∂(q ⊗ δq(ΔΘ))/∂ΔΘ for small ΔΘ: half the vector columns of the
/// left-multiplication matrix of q. Maps delta-angle uncertainty into
/// quaternion space; its negation is the gyro-bias column block of F.
pub fn quat_del_ang_jacobian(q: &Vector4<f32>) -> SMatrix<f32, 4, 3> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    0.5 * SMatrix::<f32, 4, 3>::new(
        -q1, -q2, -q3, //
        q0, -q3, q2, //
        q3, q0, -q1, //
        -q2, q1, q0,
    )
}

/// ∂(Tbn(q) · c)/∂q for a constant body-frame vector c. 3×4, one column per
/// quaternion component.
pub fn dtbn_times_dq(q: &Vector4<f32>, c: &Vector3<f32>) -> SMatrix<f32, 3, 4> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    let (cx, cy, cz) = (c.x, c.y, c.z);
    2.0 * SMatrix::<f32, 3, 4>::new(
        q0 * cx - q3 * cy + q2 * cz,
        q1 * cx + q2 * cy + q3 * cz,
        -q2 * cx + q1 * cy + q0 * cz,
        -q3 * cx - q0 * cy + q1 * cz,
        //
        q3 * cx + q0 * cy - q1 * cz,
        q2 * cx - q1 * cy - q0 * cz,
        q1 * cx + q2 * cy + q3 * cz,
        q0 * cx - q3 * cy + q2 * cz,
        //
        -q2 * cx + q1 * cy + q0 * cz,
        q3 * cx + q0 * cy - q1 * cz,
        -q0 * cx + q3 * cy - q2 * cz,
        q1 * cx + q2 * cy + q3 * cz,
    )
}

/// ∂(Tnb(q) · c)/∂q for a constant NED-frame vector c. 3×4.
pub fn dtnb_times_dq(q: &Vector4<f32>, c: &Vector3<f32>) -> SMatrix<f32, 3, 4> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
    let (cx, cy, cz) = (c.x, c.y, c.z);
    2.0 * SMatrix::<f32, 3, 4>::new(
        q0 * cx + q3 * cy - q2 * cz,
        q1 * cx + q2 * cy + q3 * cz,
        -q2 * cx + q1 * cy - q0 * cz,
        -q3 * cx + q0 * cy + q1 * cz,
        //
        -q3 * cx + q0 * cy + q1 * cz,
        q2 * cx - q1 * cy + q0 * cz,
        q1 * cx + q2 * cy + q3 * cz,
        -q0 * cx - q3 * cy + q2 * cz,
        //
        q2 * cx - q1 * cy + q0 * cz,
        q3 * cx - q0 * cy - q1 * cz,
        q0 * cx + q3 * cy - q2 * cz,
        q1 * cx + q2 * cy + q3 * cz,
    )
}

/// Tilt solve from a near-static accelerometer sample plus a tilt-compensated
/// compass yaw. Returns the initial attitude quaternion.
pub fn attitude_from_accel_mag(accel: &Vector3<f32>, mag: &Vector3<f32>) -> Vector4<f32> {
    let roll = atan2f(-accel.y, -accel.z);
    let pitch = atan2f(accel.x, sqrtf(accel.y * accel.y + accel.z * accel.z));

    let (cr, sr) = (cosf(roll), sinf(roll));
    let (cp, sp) = (cosf(pitch), sinf(pitch));
    let mag_x = mag.x * cp + mag.y * sr * sp + mag.z * cr * sp;
    let mag_y = mag.y * cr - mag.z * sr;
    let yaw = atan2f(-mag_y, mag_x);

    eul_to_quat(&Vector3::new(roll, pitch, yaw))
}

/// First-order DCM for a small misalignment rotation (flow sensor mounting).
pub fn small_angle_dcm(ang: &[f32; 3]) -> Matrix3<f32> {
    Matrix3::new(
        1.0, ang[2], -ang[1], //
        -ang[2], 1.0, ang[0], //
        ang[1], -ang[0], 1.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_euler_quaternion_round_trip() {
        let cases = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.3, -0.2, 1.1),
            Vector3::new(-1.2, 0.9, -2.8),
            Vector3::new(0.05, 1.4, 3.1),
        ];
        for eul in cases {
            let q = eul_to_quat(&eul);
            let back = quat_to_eul(&q);
            assert_relative_eq!(eul.x, back.x, epsilon = 1e-5);
            assert_relative_eq!(eul.y, back.y, epsilon = 1e-5);
            assert_relative_eq!(eul.z, back.z, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_tbn_orthonormal() {
        let q = quat_normalize(&Vector4::new(0.7, -0.3, 0.5, 0.4));
        let t = quat_to_tbn(&q);
        let should_be_eye = t * t.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(should_be_eye[(i, j)], expect, epsilon = 1e-6);
            }
        }
        assert_relative_eq!(t.determinant(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_delta_quat_composes_rotation() {
        // 0.1 rad about Z applied to identity attitude should yaw by 0.1 rad
        let q = Vector4::new(1.0, 0.0, 0.0, 0.0);
        let dq = delta_quat(&Vector3::new(0.0, 0.0, 0.1));
        let rotated = quat_normalize(&quat_mul(&q, &dq));
        let eul = quat_to_eul(&rotated);
        assert_relative_eq!(eul.z, 0.1, epsilon = 1e-6);
        assert_relative_eq!(eul.x, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_quat_right_mat_matches_product() {
        let a = quat_normalize(&Vector4::new(0.9, 0.1, -0.2, 0.3));
        let b = quat_normalize(&Vector4::new(0.8, -0.4, 0.2, 0.1));
        let direct = quat_mul(&a, &b);
        let via_mat = quat_right_mat(&b) * a;
        for i in 0..4 {
            assert_relative_eq!(direct[i], via_mat[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_dtbn_jacobian_against_finite_difference() {
        let q = quat_normalize(&Vector4::new(0.9, 0.15, -0.25, 0.3));
        let c = Vector3::new(0.4, -1.2, 2.0);
        let jac = dtbn_times_dq(&q, &c);
        let eps = 1e-3_f32;
        for k in 0..4 {
            let mut qp = q;
            let mut qm = q;
            qp[k] += eps;
            qm[k] -= eps;
            let numeric = (quat_to_tbn(&qp) * c - quat_to_tbn(&qm) * c) / (2.0 * eps);
            for row in 0..3 {
                assert_relative_eq!(jac[(row, k)], numeric[row], epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn test_dtnb_jacobian_against_finite_difference() {
        let q = quat_normalize(&Vector4::new(0.8, -0.2, 0.35, -0.15));
        let c = Vector3::new(-0.7, 0.5, 1.3);
        let jac = dtnb_times_dq(&q, &c);
        let eps = 1e-3_f32;
        for k in 0..4 {
            let mut qp = q;
            let mut qm = q;
            qp[k] += eps;
            qm[k] -= eps;
            let numeric = (quat_to_tbn(&qp).transpose() * c - quat_to_tbn(&qm).transpose() * c)
                / (2.0 * eps);
            for row in 0..3 {
                assert_relative_eq!(jac[(row, k)], numeric[row], epsilon = 2e-2);
            }
        }
    }

    #[test]
    fn test_attitude_init_level_north() {
        // Level vehicle, nose north: accel reads -1g on Z, field points N+D
        let q = attitude_from_accel_mag(
            &Vector3::new(0.0, 0.0, -9.80665),
            &Vector3::new(0.2, 0.0, 0.45),
        );
        let eul = quat_to_eul(&q);
        assert_relative_eq!(eul.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(eul.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(eul.z, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_attitude_init_yawed() {
        let yaw = 0.8_f32;
        // Rotate the NED field into a body frame yawed by 0.8 rad
        let q_true = eul_to_quat(&Vector3::new(0.0, 0.0, yaw));
        let tnb = quat_to_tbn(&q_true).transpose();
        let mag_body = tnb * Vector3::new(0.2, 0.0, 0.45);
        let q = attitude_from_accel_mag(&Vector3::new(0.0, 0.0, -9.80665), &mag_body);
        assert_relative_eq!(quat_to_eul(&q).z, yaw, epsilon = 1e-4);
    }
}
