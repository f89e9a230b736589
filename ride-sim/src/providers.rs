//! Host side collaborators: a settable clock, queue backed sensor feeds and a
//! network positioning service with latency and failures.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use fusion_location_core::{
    Clock, CompassReading, CompassSource, CoordinateTransform, GnssFix, GnssSource, ImuSample,
    ImuSource, LocationMethod, NetworkLocationProvider, NetworkLocationResult,
};
use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::NetworkScenario;

#[derive(Clone, Default)]
pub struct HostClock(Rc<Cell<u64>>);

impl HostClock {
    pub fn set(&self, ms: u64) {
        self.0.set(ms);
    }
}

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }
}

/// Readings queued by the driver and drained by the engine.
pub struct Feed<T> {
    enabled: bool,
    queue: Rc<RefCell<VecDeque<T>>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            queue: self.queue.clone(),
        }
    }
}

impl<T> Feed<T> {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            queue: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn push(&self, reading: T) {
        if self.enabled {
            self.queue.borrow_mut().push_back(reading);
        }
    }

    pub fn clear(&self) {
        self.queue.borrow_mut().clear();
    }

    fn pop(&self) -> Option<T> {
        self.queue.borrow_mut().pop_front()
    }
}

impl ImuSource for Feed<ImuSample> {
    fn is_available(&self) -> bool {
        self.enabled
    }

    fn poll_imu(&mut self) -> Option<ImuSample> {
        self.pop()
    }
}

impl GnssSource for Feed<GnssFix> {
    fn poll_gnss(&mut self) -> Option<GnssFix> {
        self.pop()
    }
}

impl CompassSource for Feed<CompassReading> {
    fn is_available(&self) -> bool {
        self.enabled
    }

    fn poll_heading(&mut self) -> Option<CompassReading> {
        self.pop()
    }
}

/// Where the rider really is, shared with the network service.
pub type TruthHandle = Rc<Cell<(f64, f64)>>;

/// Answers positioning requests from the true position, offset by a random
/// error within the method's accuracy, after the method's latency.
pub struct SimulatedNetwork {
    clock: HostClock,
    truth: TruthHandle,
    config: NetworkScenario,
    rng: StdRng,
    pending: Vec<(u64, NetworkLocationResult)>,
}

impl SimulatedNetwork {
    pub fn new(clock: HostClock, truth: TruthHandle, config: NetworkScenario, seed: u64) -> Self {
        Self {
            clock,
            truth,
            config,
            rng: StdRng::seed_from_u64(seed),
            pending: Vec::new(),
        }
    }

    fn answer(&mut self, method: LocationMethod, request_id: u32) -> NetworkLocationResult {
        if self.rng.random::<f32>() < self.config.failure_rate {
            return NetworkLocationResult::failed(method, request_id);
        }
        let accuracy_m = match method {
            LocationMethod::Lbs => self.config.lbs_accuracy_m,
            LocationMethod::Wifi => self.config.wifi_accuracy_m,
        };
        let reach = accuracy_m as f64 / 2.0;
        let (lat, lng) = self.truth.get();
        let (lat, lng) = CoordinateTransform::with_origin(lat, lng).to_lat_lng(
            self.rng.random_range(-reach..=reach),
            self.rng.random_range(-reach..=reach),
        );
        NetworkLocationResult {
            method,
            request_id,
            lat,
            lng,
            accuracy_m,
            valid: true,
        }
    }
}

impl NetworkLocationProvider for SimulatedNetwork {
    fn is_available(&self) -> bool {
        self.config.available
    }

    fn start_request(&mut self, method: LocationMethod, request_id: u32) -> bool {
        let latency_ms = match method {
            LocationMethod::Lbs => self.config.lbs_latency_ms,
            LocationMethod::Wifi => self.config.wifi_latency_ms,
        };
        let due_ms = self.clock.now_ms() + latency_ms as u64;
        let result = self.answer(method, request_id);
        debug!(
            "network request #{} will {} at {} ms",
            request_id,
            if result.valid { "succeed" } else { "fail" },
            due_ms
        );
        self.pending.push((due_ms, result));
        true
    }

    fn poll_result(&mut self) -> Option<NetworkLocationResult> {
        let now = self.clock.now_ms();
        let index = self.pending.iter().position(|(due, _)| *due <= now)?;
        Some(self.pending.remove(index).1)
    }
}
