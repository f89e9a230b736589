// only use std when feature = "std" is enabled or during testing
#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod fmt;

pub mod attitude;
pub mod config;
pub mod dead_reckoning;
pub mod fallback;
pub mod geo;
pub mod manager;
pub mod motion;
pub mod providers;
pub mod readings;
pub mod sync;
pub mod time;
pub mod trajectory;
mod welford;

pub use attitude::{Attitude, AttitudeConfig, AttitudeEstimator};
pub use config::{ConfigError, DebugLevel, FusionConfig};
pub use dead_reckoning::{
    DeadReckoningConfig, DeadReckoningIntegrator, ImuStep, STATIONARY_THRESHOLD_MS, StepEvent,
};
pub use fallback::{AcceptedFix, FallbackConfig, FallbackLocationController, RequestOutcome};
pub use geo::{
    CoordinateTransform, MAX_PLANAR_RADIUS_M, Origin, haversine_distance_m, heading_difference,
    initial_bearing_deg, normalize_heading,
};
pub use manager::{FusionLocationManager, FusionStatus, Stats, TripStats};
pub use motion::{MotionClassifier, MotionInput, MotionState, MotionThresholds};
pub use providers::{
    CompassSource, GnssSource, ImuSource, NetworkLocationProvider, NoCompass, NoNetworkLocation,
};
pub use readings::{CompassReading, GnssFix, ImuSample, LocationMethod, NetworkLocationResult};
pub use sync::MotionInterruptFlag;
pub use time::Clock;
pub use trajectory::{LocationSource, TrajectoryPoint};

/// Standard gravity used for gravity compensation and g-force thresholds, m/s^2
pub const GRAVITY: f32 = 9.81;

#[cfg(test)]
mod tests;
