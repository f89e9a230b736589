use heapless::Deque;
use nalgebra::Vector3;

use super::{DeadReckoningConfig, ImuStep, STATIONARY_THRESHOLD_MS};
use crate::welford::Welford;

const WINDOW: usize = 16;
const MIN_WINDOW: usize = WINDOW / 2;

/// Decides whether the vehicle has been still for long enough to clamp the
/// velocity to zero.
#[derive(Debug, Clone)]
pub(super) struct StationaryDetector {
    acc_magnitudes: Deque<f32, WINDOW>,
    /// bias corrected gyro samples collected while quiet
    gyro: Welford<3>,
    quiet_since_ms: Option<u64>,
}

impl StationaryDetector {
    pub fn new() -> Self {
        Self {
            acc_magnitudes: Deque::new(),
            gyro: Welford::new(),
            quiet_since_ms: None,
        }
    }

    /// Returns true once the input has been quiet for
    /// `STATIONARY_THRESHOLD_MS`.
    pub fn update(&mut self, step: &ImuStep, now_ms: u64, config: &DeadReckoningConfig) -> bool {
        if self.acc_magnitudes.is_full() {
            self.acc_magnitudes.pop_front();
        }
        // cannot fail, a slot was freed above
        let _ = self.acc_magnitudes.push_back(step.acc_magnitude);

        if self.is_quiet(step, config) {
            let since = *self.quiet_since_ms.get_or_insert(now_ms);
            self.gyro.update(&step.gyro);
            now_ms.saturating_sub(since) >= STATIONARY_THRESHOLD_MS
        } else {
            self.wake();
            false
        }
    }

    fn is_quiet(&self, step: &ImuStep, config: &DeadReckoningConfig) -> bool {
        if self.acc_magnitudes.len() < MIN_WINDOW {
            return false;
        }

        let mut welford = Welford::<1>::new();
        for magnitude in self.acc_magnitudes.iter() {
            welford.push(*magnitude);
        }
        let variance = welford.scalar_variance().unwrap_or(f32::MAX);

        variance < config.stationary_variance
            && step.linear_acc_enu.norm() < config.stationary_linear_accel_mps2
            && step.gyro.norm().to_degrees() < config.stationary_gyro_dps
    }

    pub fn wake(&mut self) {
        self.quiet_since_ms = None;
        self.gyro.reset();
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Mean angular rate over the current quiet period, rad/s.
    pub fn quiet_gyro_mean(&self) -> Option<Vector3<f32>> {
        if self.gyro.count() >= MIN_WINDOW as u32 {
            Some(self.gyro.mean())
        } else {
            None
        }
    }
}
