use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// One accelerometer + gyroscope sample.
///
/// Body frame: x forward, y left, z up. A device at rest and level reads
/// `acc = [0, 0, +g]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    /// m/s^2
    pub acc: [f32; 3],
    /// deg/s
    pub gyro: [f32; 3],
    pub timestamp_ms: u64,
}

impl ImuSample {
    pub fn new(acc: [f32; 3], gyro: [f32; 3], timestamp_ms: u64) -> Self {
        Self {
            acc,
            gyro,
            timestamp_ms,
        }
    }

    pub fn acceleration(&self) -> Vector3<f32> {
        Vector3::from(self.acc)
    }

    /// rad/s
    pub fn angular_velocity(&self) -> Vector3<f32> {
        Vector3::new(
            self.gyro[0].to_radians(),
            self.gyro[1].to_radians(),
            self.gyro[2].to_radians(),
        )
    }

    pub fn is_finite(&self) -> bool {
        self.acc.iter().chain(self.gyro.iter()).all(|v| v.is_finite())
    }
}

/// Satellite fix as reported by the GNSS receiver.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct GnssFix {
    pub lat: f64,
    pub lng: f64,
    /// meters above sea level
    pub altitude: Option<f32>,
    /// m/s
    pub speed_mps: f32,
    /// course over ground, degrees clockwise from north
    pub course_deg: Option<f32>,
    pub satellites: u8,
    pub hdop: Option<f32>,
    pub valid: bool,
    pub timestamp_ms: u64,
}

impl GnssFix {
    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CompassReading {
    /// true heading, degrees clockwise from north
    pub heading_deg: f32,
    pub valid: bool,
    pub timestamp_ms: u64,
}

/// Network assisted positioning methods.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationMethod {
    /// cell tower based
    Lbs,
    Wifi,
}

/// Answer to a network location request. `valid == false` means the provider
/// gave up; the coordinates are then meaningless.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct NetworkLocationResult {
    pub method: LocationMethod,
    pub request_id: u32,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f32,
    pub valid: bool,
}

impl NetworkLocationResult {
    pub fn failed(method: LocationMethod, request_id: u32) -> Self {
        Self {
            method,
            request_id,
            lat: 0.0,
            lng: 0.0,
            accuracy_m: f32::MAX,
            valid: false,
        }
    }
}
