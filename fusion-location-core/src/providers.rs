//! Collaborator interfaces. Hardware drivers and the modem stack live outside
//! this crate and plug in through these traits.

use crate::readings::{CompassReading, GnssFix, ImuSample, LocationMethod, NetworkLocationResult};

pub trait ImuSource {
    fn is_available(&self) -> bool;

    /// Latest sample, `None` if nothing new arrived since the last poll.
    fn poll_imu(&mut self) -> Option<ImuSample>;
}

pub trait GnssSource {
    fn poll_gnss(&mut self) -> Option<GnssFix>;
}

pub trait CompassSource {
    fn is_available(&self) -> bool;

    fn poll_heading(&mut self) -> Option<CompassReading>;
}

/// Cell / Wi-Fi positioning through the modem.
///
/// `start_request` must return immediately; the answer is picked up later
/// through `poll_result`.
pub trait NetworkLocationProvider {
    fn is_available(&self) -> bool;

    /// Returns false if the provider refused to start the request.
    fn start_request(&mut self, method: LocationMethod, request_id: u32) -> bool;

    fn poll_result(&mut self) -> Option<NetworkLocationResult>;
}

/// For devices without a magnetometer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompass;

impl CompassSource for NoCompass {
    fn is_available(&self) -> bool {
        false
    }

    fn poll_heading(&mut self) -> Option<CompassReading> {
        None
    }
}

/// For devices without a modem.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetworkLocation;

impl NetworkLocationProvider for NoNetworkLocation {
    fn is_available(&self) -> bool {
        false
    }

    fn start_request(&mut self, _method: LocationMethod, _request_id: u32) -> bool {
        false
    }

    fn poll_result(&mut self) -> Option<NetworkLocationResult> {
        None
    }
}

impl<T: ImuSource + ?Sized> ImuSource for &mut T {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn poll_imu(&mut self) -> Option<ImuSample> {
        (**self).poll_imu()
    }
}

impl<T: GnssSource + ?Sized> GnssSource for &mut T {
    fn poll_gnss(&mut self) -> Option<GnssFix> {
        (**self).poll_gnss()
    }
}

impl<T: CompassSource + ?Sized> CompassSource for &mut T {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn poll_heading(&mut self) -> Option<CompassReading> {
        (**self).poll_heading()
    }
}

impl<T: NetworkLocationProvider + ?Sized> NetworkLocationProvider for &mut T {
    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn start_request(&mut self, method: LocationMethod, request_id: u32) -> bool {
        (**self).start_request(method, request_id)
    }

    fn poll_result(&mut self) -> Option<NetworkLocationResult> {
        (**self).poll_result()
    }
}
