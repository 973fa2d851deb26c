//! Kestrel Simulation Library
//!
//! Deterministic truth trajectories, sensor models and a filter harness for
//! exercising the navigation EKF end to end.

pub mod harness;
pub mod scenario;
pub mod sensor;

// Re-export main types
pub use harness::{
    params_json, run_filter, run_filter_returning_ekf, FilterResult, FusionTally, HarnessConfig,
};
pub use scenario::{generate, Scenario, Truth};
pub use sensor::{generate_sensor_data, SensorConfig, SensorData};
