//! # Kestrel Core
//!
//! 24-state strapdown navigation EKF for small flying vehicles, designed for
//! `no_std` environments. This crate contains only the code that needs to run
//! on the flight computer:
//! - strapdown mechanization and quaternion attitude integration
//! - fixed-dimension 24×24 covariance propagation
//! - sequential measurement fusion (GNSS, baro, mag, airspeed, range, flow)
//! - ring-buffered state history for delayed-measurement alignment
//! - numerical health, constraint and reset machinery
//!
//! All matrices are compile-time sized (`nalgebra::SMatrix`) and live on the
//! stack; there is no allocation on the hot path.
//!
//! # Features
//! - `std` (default): standard library support, required for the test suite
//! - disable default features for bare-metal targets

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

pub mod ekf;
pub mod fusion;
pub mod geo;
pub mod params;
pub mod rotation;

// Re-export core types
pub use ekf::{
    ChannelHealth, EkfReport, ImuSample, NavEkf, SensorSwitches, HISTORY_LEN, N_STATES, N_STORED,
};
pub use fusion::{
    AirspeedObs, FlowObs, FusionStatus, GpsFusionMode, MagObs, RangeObs, VelPosObs,
};
pub use params::EkfParams;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gravity magnitude (m/s^2)
pub const GRAVITY: f32 = 9.80665;

/// Earth rotation rate (rad/s)
pub const EARTH_RATE: f32 = 7.2921e-5;
