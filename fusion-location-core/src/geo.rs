use libm::{asin, atan2, cos, sin, sqrt};
use serde::{Deserialize, Serialize};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * core::f64::consts::PI / 180.0;

/// Beyond this distance from the origin the equirectangular approximation
/// error becomes noticeable and the manager re-anchors the origin.
pub const MAX_PLANAR_RADIUS_M: f64 = 5_000.0;

/// Anchor of the local planar frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Origin {
    pub lat: f64,
    pub lng: f64,
    pub has_origin: bool,
}

/// Geodetic <-> local planar conversion around a movable origin.
///
/// x points east, y points north, both in meters. Results are meaningless
/// until an origin is set.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateTransform {
    origin: Origin,
    meters_per_degree_lng: f64,
}

impl Default for CoordinateTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinateTransform {
    pub const fn new() -> Self {
        Self {
            origin: Origin {
                lat: 0.0,
                lng: 0.0,
                has_origin: false,
            },
            meters_per_degree_lng: METERS_PER_DEGREE,
        }
    }

    pub fn with_origin(lat: f64, lng: f64) -> Self {
        let mut transform = Self::new();
        transform.set_origin(lat, lng);
        transform
    }

    pub fn set_origin(&mut self, lat: f64, lng: f64) {
        self.origin = Origin {
            lat,
            lng: wrap_longitude(lng),
            has_origin: true,
        };
        // keep the scale finite at the poles
        let cos_lat = cos(lat.to_radians()).max(1e-6);
        self.meters_per_degree_lng = METERS_PER_DEGREE * cos_lat;
    }

    pub fn clear_origin(&mut self) {
        *self = Self::new();
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn has_origin(&self) -> bool {
        self.origin.has_origin
    }

    pub fn to_local_xy(&self, lat: f64, lng: f64) -> (f64, f64) {
        let d_lng = wrap_longitude(lng - self.origin.lng);
        let d_lat = lat - self.origin.lat;
        (d_lng * self.meters_per_degree_lng, d_lat * METERS_PER_DEGREE)
    }

    pub fn to_lat_lng(&self, x: f64, y: f64) -> (f64, f64) {
        let lat = self.origin.lat + y / METERS_PER_DEGREE;
        let lng = wrap_longitude(self.origin.lng + x / self.meters_per_degree_lng);
        (lat, lng)
    }

    /// Expresses a point given in `previous`'s planar frame in this frame.
    pub fn reproject_from(&self, previous: &CoordinateTransform, x: f64, y: f64) -> (f64, f64) {
        let (lat, lng) = previous.to_lat_lng(x, y);
        self.to_local_xy(lat, lng)
    }
}

/// Wraps into (-180, 180].
fn wrap_longitude(lng: f64) -> f64 {
    let mut wrapped = lng % 360.0;
    if wrapped > 180.0 {
        wrapped -= 360.0;
    } else if wrapped <= -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

/// Maps any angle in degrees into [0, 360). Non-finite input maps to 0.
pub fn normalize_heading(deg: f32) -> f32 {
    if !deg.is_finite() {
        return 0.0;
    }
    let mut h = deg % 360.0;
    if h < 0.0 {
        h += 360.0;
    }
    // -1e-8 % 360 + 360 rounds up to exactly 360
    if h >= 360.0 { 0.0 } else { h }
}

/// Signed shortest rotation from `from` to `to`, in (-180, 180].
pub fn heading_difference(to: f32, from: f32) -> f32 {
    let d = normalize_heading(to - from);
    if d > 180.0 { d - 360.0 } else { d }
}

pub fn haversine_distance_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let s_phi = sin(d_phi / 2.0);
    let s_lambda = sin(d_lambda / 2.0);
    let a = s_phi * s_phi + cos(phi1) * cos(phi2) * s_lambda * s_lambda;
    2.0 * EARTH_RADIUS_M * asin(sqrt(a.clamp(0.0, 1.0)))
}

/// Initial great-circle bearing from point 1 to point 2, degrees clockwise
/// from north in [0, 360).
pub fn initial_bearing_deg(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f32 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let y = sin(d_lambda) * cos(phi2);
    let x = cos(phi1) * sin(phi2) - sin(phi1) * cos(phi2) * cos(d_lambda);
    normalize_heading(atan2(y, x).to_degrees() as f32)
}
