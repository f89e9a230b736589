mod stationary;

use libm::{exp, sqrt};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use self::stationary::StationaryDetector;
use crate::time::elapsed_ms;

/// How long the input must stay quiet before a zero velocity update.
pub const STATIONARY_THRESHOLD_MS: u64 = 1000;
/// A fix reporting more than this restarts stillness detection.
const MOVING_FIX_SPEED_MPS: f64 = 0.5;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DeadReckoningConfig {
    /// (m/s^2)^2, variance of the acceleration magnitude over the window
    pub stationary_variance: f32,
    pub stationary_linear_accel_mps2: f32,
    pub stationary_gyro_dps: f32,
    /// Anything faster is treated as numerical divergence
    pub max_speed_mps: f32,
    pub decay_after_ms: u32,
    pub velocity_decay_per_s: f32,
    pub vertical_damping_per_s: f32,
}

impl Default for DeadReckoningConfig {
    fn default() -> Self {
        Self {
            stationary_variance: 0.05,
            stationary_linear_accel_mps2: 0.3,
            stationary_gyro_dps: 3.0,
            max_speed_mps: 90.0,
            decay_after_ms: 30_000,
            velocity_decay_per_s: 0.2,
            vertical_damping_per_s: 1.0,
        }
    }
}

/// Per sample input of the integrator.
#[derive(Debug, Clone, Copy)]
pub struct ImuStep {
    /// gravity compensated, east/north/up, m/s^2
    pub linear_acc_enu: Vector3<f32>,
    /// raw accelerometer magnitude, m/s^2
    pub acc_magnitude: f32,
    /// bias corrected body rate, rad/s
    pub gyro: Vector3<f32>,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Moving,
    /// first tick of a stationary period
    ZuptStarted,
    Stationary,
    /// velocity blew past `max_speed_mps`, state was reset
    DivergenceReset,
}

#[derive(Debug, Clone)]
struct IntegrationState {
    velocity: Vector3<f64>,
    position: Vector3<f64>,
    last_velocity: Vector3<f64>,
    is_stationary: bool,
    stationary_start_ms: Option<u64>,
}

impl IntegrationState {
    const fn zeroed() -> Self {
        Self {
            velocity: Vector3::new(0.0, 0.0, 0.0),
            position: Vector3::new(0.0, 0.0, 0.0),
            last_velocity: Vector3::new(0.0, 0.0, 0.0),
            is_stationary: false,
            stationary_start_ms: None,
        }
    }
}

/// Double integrates linear acceleration in the local planar frame (x east,
/// y north, z up), with zero velocity updates and drift damping.
#[derive(Debug, Clone)]
pub struct DeadReckoningIntegrator {
    config: DeadReckoningConfig,
    state: IntegrationState,
    detector: StationaryDetector,
    last_correction_ms: u64,
}

impl DeadReckoningIntegrator {
    pub fn new(config: DeadReckoningConfig) -> Self {
        Self {
            config,
            state: IntegrationState::zeroed(),
            detector: StationaryDetector::new(),
            last_correction_ms: 0,
        }
    }

    pub fn set_config(&mut self, config: DeadReckoningConfig) {
        self.config = config;
    }

    /// Back to the origin at rest.
    pub fn reset(&mut self, now_ms: u64) {
        self.state = IntegrationState::zeroed();
        self.detector.reset();
        self.last_correction_ms = now_ms;
    }

    pub fn update(&mut self, step: &ImuStep, dt_s: f64, now_ms: u64) -> StepEvent {
        if self.detector.update(step, now_ms, &self.config) {
            let started = !self.state.is_stationary;
            if started {
                self.state.is_stationary = true;
                self.state.stationary_start_ms = Some(now_ms);
            }
            self.state.last_velocity = self.state.velocity;
            self.state.velocity = Vector3::zeros();
            return if started {
                StepEvent::ZuptStarted
            } else {
                StepEvent::Stationary
            };
        }
        self.leave_stationary();

        let acc: Vector3<f64> = step.linear_acc_enu.cast::<f64>();
        let previous_position = self.state.position;

        self.state.last_velocity = self.state.velocity;
        self.state.position += self.state.velocity * dt_s + acc * (0.5 * dt_s * dt_s);
        self.state.velocity += acc * dt_s;

        // no vertical reference, keep the channel from running away
        self.state.velocity.z *= exp(-(self.config.vertical_damping_per_s as f64) * dt_s);

        if elapsed_ms(now_ms, self.last_correction_ms) > self.config.decay_after_ms as u64 {
            let k = exp(-(self.config.velocity_decay_per_s as f64) * dt_s);
            self.state.velocity.x *= k;
            self.state.velocity.y *= k;
        }

        let speed = self.horizontal_speed();
        if !speed.is_finite() || speed > self.config.max_speed_mps as f64 {
            log_warn!(
                "dead reckoning diverged ({} m/s), resetting velocity",
                speed
            );
            if previous_position.iter().all(|p| p.is_finite()) {
                self.state.position = previous_position;
            }
            self.state.velocity = Vector3::zeros();
            self.state.last_velocity = Vector3::zeros();
            self.detector.wake();
            return StepEvent::DivergenceReset;
        }

        StepEvent::Moving
    }

    fn leave_stationary(&mut self) {
        if self.state.is_stationary {
            self.state.is_stationary = false;
            self.state.stationary_start_ms = None;
        }
    }

    /// Snaps to an external fix. `velocity_en` is (east, north) in m/s; fixes
    /// without a velocity keep the integrated one.
    pub fn apply_fix(&mut self, x: f64, y: f64, velocity_en: Option<(f64, f64)>, now_ms: u64) {
        self.state.position = Vector3::new(x, y, 0.0);
        if let Some((east, north)) = velocity_en {
            self.state.velocity = Vector3::new(east, north, 0.0);
            if sqrt(east * east + north * north) > MOVING_FIX_SPEED_MPS {
                self.detector.wake();
            }
        } else {
            self.state.velocity.z = 0.0;
        }
        self.state.last_velocity = self.state.velocity;
        self.leave_stationary();
        self.last_correction_ms = now_ms;
    }

    /// Moves the planar position without touching velocity, used when the
    /// origin changes.
    pub fn set_position_xy(&mut self, x: f64, y: f64) {
        self.state.position.x = x;
        self.state.position.y = y;
    }

    /// Motion interrupt: whatever stillness was building up is over.
    pub fn wake(&mut self) {
        self.detector.wake();
        self.leave_stationary();
    }

    pub fn position(&self) -> Vector3<f64> {
        self.state.position
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.state.velocity
    }

    pub fn last_velocity(&self) -> Vector3<f64> {
        self.state.last_velocity
    }

    pub fn horizontal_speed(&self) -> f64 {
        let v = &self.state.velocity;
        sqrt(v.x * v.x + v.y * v.y)
    }

    pub fn is_stationary(&self) -> bool {
        self.state.is_stationary
    }

    pub fn stationary_since_ms(&self) -> Option<u64> {
        self.state.stationary_start_ms
    }

    pub fn last_correction_ms(&self) -> u64 {
        self.last_correction_ms
    }

    /// Residual gyro rate averaged over the current stationary period.
    pub fn stationary_gyro_mean(&self) -> Option<Vector3<f32>> {
        if self.state.is_stationary {
            self.detector.quiet_gyro_mean()
        } else {
            None
        }
    }
}
