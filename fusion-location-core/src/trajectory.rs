use core::fmt;

use serde::{Deserialize, Serialize};

use crate::readings::LocationMethod;

/// Where the most recent position correction came from.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationSource {
    #[default]
    None,
    Gnss,
    Lbs,
    Wifi,
}

impl From<LocationMethod> for LocationSource {
    fn from(method: LocationMethod) -> Self {
        match method {
            LocationMethod::Lbs => LocationSource::Lbs,
            LocationMethod::Wifi => LocationSource::Wifi,
        }
    }
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LocationSource::None => "none",
            LocationSource::Gnss => "GNSS",
            LocationSource::Lbs => "LBS",
            LocationSource::Wifi => "WiFi",
        })
    }
}

/// Fused estimate for one tick. When `valid` is false the other fields carry
/// no meaning.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct TrajectoryPoint {
    pub lat: f64,
    pub lng: f64,
    /// m above sea level, relative to the last fix carrying an altitude
    pub altitude: f32,
    /// m/s, horizontal
    pub speed: f32,
    /// deg clockwise from north
    pub heading: f32,
    pub pitch: f32,
    pub roll: f32,
    pub lean_angle: f32,
    pub timestamp_ms: u64,
    pub valid: bool,
    /// estimated horizontal error, m
    pub accuracy_m: f32,
    pub source: LocationSource,
}

impl TrajectoryPoint {
    pub const fn invalid(timestamp_ms: u64) -> Self {
        Self {
            lat: 0.0,
            lng: 0.0,
            altitude: 0.0,
            speed: 0.0,
            heading: 0.0,
            pitch: 0.0,
            roll: 0.0,
            lean_angle: 0.0,
            timestamp_ms,
            valid: false,
            accuracy_m: f32::MAX,
            source: LocationSource::None,
        }
    }
}
