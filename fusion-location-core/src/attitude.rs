use ahrs::{Ahrs, Madgwick};
#[allow(unused_imports)]
use micromath::F32Ext;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    GRAVITY,
    geo::{heading_difference, normalize_heading},
    readings::ImuSample,
};

/// Largest gyro offset accepted as bias, rad/s (10 deg/s).
const MAX_GYRO_BIAS: f32 = 0.1745;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AttitudeConfig {
    /// Madgwick gain after convergence
    pub beta: f32,
    /// Madgwick gain while converging
    pub initial_beta: f32,
    pub convergence_updates: u32,
    pub convergence_residual_deg: f32,
    /// Accelerometer correction is skipped while |acc - gravity| exceeds this
    pub accel_rejection_mps2: f32,
    pub rejection_recovery_ms: u32,
    /// Madgwick gain while the accelerometer is forced back on after
    /// `rejection_recovery_ms`
    pub recovery_beta: f32,
    /// Fraction of the compass disagreement applied per reading
    pub compass_weight: f32,
    /// Fraction of the GNSS course disagreement applied per fix
    pub course_weight: f32,
    pub course_min_speed_mps: f32,
}

impl Default for AttitudeConfig {
    fn default() -> Self {
        Self {
            beta: 0.05,
            initial_beta: 0.5,
            convergence_updates: 100,
            convergence_residual_deg: 3.0,
            accel_rejection_mps2: 0.4,
            rejection_recovery_ms: 20_000,
            recovery_beta: 0.002,
            compass_weight: 0.02,
            course_weight: 0.1,
            course_min_speed_mps: 3.0,
        }
    }
}

/// Roll positive = leaning right, pitch positive = nose up, heading clockwise
/// from true north. `yaw_deg` is the raw filter yaw (counter-clockwise).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Attitude {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub heading_deg: f32,
}

/// Madgwick attitude filter plus the bookkeeping around it: convergence,
/// acceleration rejection, gyro bias and the heading reference.
///
/// The filter frame shares "up" with the earth but its yaw reference is
/// arbitrary; `heading_offset_deg` maps filter yaw onto true heading.
#[derive(Debug, Clone)]
pub struct AttitudeEstimator {
    config: AttitudeConfig,
    /// body -> filter frame
    orientation: UnitQuaternion<f32>,
    /// rad/s
    gyro_bias: Vector3<f32>,
    /// bias corrected, rad/s
    last_gyro: Vector3<f32>,
    updates: u32,
    converged: bool,
    rejecting_since_ms: Option<u64>,
    /// accelerometer forced back on, low gain until the residual clears
    recovering: bool,
    heading_offset_deg: f32,
    heading_referenced: bool,
}

impl AttitudeEstimator {
    pub fn new(config: AttitudeConfig) -> Self {
        Self {
            config,
            orientation: UnitQuaternion::identity(),
            gyro_bias: Vector3::zeros(),
            last_gyro: Vector3::zeros(),
            updates: 0,
            converged: false,
            rejecting_since_ms: None,
            recovering: false,
            heading_offset_deg: 0.0,
            heading_referenced: false,
        }
    }

    /// Forgets everything except the configuration and the learned gyro bias.
    pub fn reset(&mut self) {
        let gyro_bias = self.gyro_bias;
        *self = Self::new(self.config.clone());
        self.gyro_bias = gyro_bias;
    }

    pub fn set_config(&mut self, config: AttitudeConfig) {
        self.config = config;
    }

    /// Starts from a known attitude, e.g. restored from the last power cycle.
    pub fn seed(&mut self, roll_deg: f32, pitch_deg: f32, heading_deg: f32) {
        self.orientation =
            UnitQuaternion::from_euler_angles(roll_deg.to_radians(), -pitch_deg.to_radians(), 0.0);
        self.heading_offset_deg = normalize_heading(heading_deg);
        self.heading_referenced = true;
        self.converged = true;
        self.updates = self.config.convergence_updates;
        self.rejecting_since_ms = None;
        self.recovering = false;
    }

    pub fn update(&mut self, sample: &ImuSample, dt_s: f32) -> Attitude {
        let acc = sample.acceleration();
        let gyro = sample.angular_velocity() - self.gyro_bias;
        self.last_gyro = gyro;

        let residual = (acc - self.gravity_body()).norm();
        let use_accelerometer = if self.converged {
            self.accept_accelerometer(residual, sample.timestamp_ms)
        } else {
            true
        };

        if use_accelerometer {
            let beta = if !self.converged {
                self.config.initial_beta
            } else if self.recovering {
                self.config.recovery_beta
            } else {
                self.config.beta
            };
            let mut filter = Madgwick::new_with_quat(dt_s, beta, self.orientation);
            match filter.update_imu(&gyro, &acc) {
                Ok(quat) if quat.coords.iter().all(|c| c.is_finite()) => self.orientation = *quat,
                // zero acceleration, a zero length correction step or a bad sample
                _ => self.propagate(&gyro, dt_s),
            }
        } else {
            self.propagate(&gyro, dt_s);
        }

        self.updates = self.updates.saturating_add(1);
        if !self.converged && self.updates >= self.config.convergence_updates {
            let acc_norm = acc.norm();
            let residual_deg = acc.angle(&self.gravity_body()).to_degrees();
            if acc_norm > 0.5 * GRAVITY && residual_deg < self.config.convergence_residual_deg {
                self.converged = true;
                log_info!(
                    "attitude converged after {} updates, residual {} deg",
                    self.updates,
                    residual_deg
                );
            }
        }

        self.attitude()
    }

    fn accept_accelerometer(&mut self, residual: f32, timestamp_ms: u64) -> bool {
        if residual <= self.config.accel_rejection_mps2 {
            if self.recovering {
                log_info!("accelerometer residual back to {} m/s^2", residual);
            }
            self.rejecting_since_ms = None;
            self.recovering = false;
            return true;
        }
        if self.recovering {
            return true;
        }

        let since = *self.rejecting_since_ms.get_or_insert(timestamp_ms);
        if timestamp_ms.saturating_sub(since) >= self.config.rejection_recovery_ms as u64 {
            log_warn!(
                "accelerometer rejected for {} ms, blending it back in",
                timestamp_ms - since
            );
            self.rejecting_since_ms = None;
            self.recovering = true;
            return true;
        }
        false
    }

    fn propagate(&mut self, gyro: &Vector3<f32>, dt_s: f32) {
        self.orientation = self.orientation * UnitQuaternion::from_scaled_axis(gyro * dt_s);
    }

    pub fn attitude(&self) -> Attitude {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        let yaw_deg = yaw.to_degrees();
        Attitude {
            roll_deg: roll.to_degrees(),
            pitch_deg: -pitch.to_degrees(),
            yaw_deg,
            heading_deg: normalize_heading(self.heading_offset_deg - yaw_deg),
        }
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn is_heading_referenced(&self) -> bool {
        self.heading_referenced
    }

    pub fn orientation(&self) -> UnitQuaternion<f32> {
        self.orientation
    }

    /// rad/s
    pub fn gyro_bias(&self) -> Vector3<f32> {
        self.gyro_bias
    }

    /// Expected accelerometer reading at rest, m/s^2 in body frame.
    pub fn gravity_body(&self) -> Vector3<f32> {
        self.orientation.inverse_transform_vector(&Vector3::z()) * GRAVITY
    }

    /// Gravity compensated acceleration in the filter frame.
    pub fn linear_acceleration(&self, acc: &Vector3<f32>) -> Vector3<f32> {
        self.orientation.transform_vector(acc) - Vector3::z() * GRAVITY
    }

    /// Gravity compensated acceleration in east/north/up.
    pub fn linear_acceleration_enu(&self, acc: &Vector3<f32>) -> Vector3<f32> {
        let a = self.linear_acceleration(acc);
        let theta = (90.0 - self.heading_offset_deg).to_radians();
        let (s, c) = (theta.sin(), theta.cos());
        Vector3::new(c * a.x - s * a.y, s * a.x + c * a.y, a.z)
    }

    /// Horizontal linear acceleration split into (forward, left) along the
    /// current heading, independent of lean.
    pub fn forward_lateral(&self, acc: &Vector3<f32>) -> (f32, f32) {
        let a = self.linear_acceleration(acc);
        let (_, _, yaw) = self.orientation.euler_angles();
        let (s, c) = (yaw.sin(), yaw.cos());
        (c * a.x + s * a.y, -s * a.x + c * a.y)
    }

    /// Rotation rate about the vertical, deg/s, positive turning left.
    pub fn yaw_rate_dps(&self) -> f32 {
        self.orientation.transform_vector(&self.last_gyro).z.to_degrees()
    }

    /// Magnitude of the bias corrected angular rate, deg/s.
    pub fn angular_rate_dps(&self) -> f32 {
        self.last_gyro.norm().to_degrees()
    }

    /// Bias corrected angular rate of the last sample, rad/s.
    pub fn angular_rate(&self) -> Vector3<f32> {
        self.last_gyro
    }

    /// Folds the residual rate measured while stationary into the bias.
    pub fn learn_gyro_bias(&mut self, residual_rate: &Vector3<f32>) {
        let bias = self.gyro_bias + residual_rate;
        if bias.norm() > MAX_GYRO_BIAS {
            log_warn!("ignoring implausible gyro bias {} rad/s", bias.norm());
            return;
        }
        self.gyro_bias = bias;
        log_debug!(
            "gyro bias now [{}, {}, {}] rad/s",
            bias.x,
            bias.y,
            bias.z
        );
    }

    /// Pulls the heading reference towards an absolute heading. The first
    /// reference is taken as is.
    pub fn align_heading(&mut self, heading_deg: f32, weight: f32) {
        if !heading_deg.is_finite() {
            return;
        }
        let yaw_deg = self.attitude().yaw_deg;
        let target = normalize_heading(heading_deg + yaw_deg);
        if !self.heading_referenced {
            self.heading_offset_deg = target;
            self.heading_referenced = true;
            log_info!("heading referenced at {} deg", normalize_heading(heading_deg));
            return;
        }
        let weight = weight.clamp(0.0, 1.0);
        self.heading_offset_deg = normalize_heading(
            self.heading_offset_deg + weight * heading_difference(target, self.heading_offset_deg),
        );
    }

    pub fn align_with_compass(&mut self, heading_deg: f32) {
        self.align_heading(heading_deg, self.config.compass_weight);
    }

    /// GNSS course is only meaningful while moving.
    pub fn align_with_course(&mut self, course_deg: f32, speed_mps: f32) {
        if speed_mps >= self.config.course_min_speed_mps {
            self.align_heading(course_deg, self.config.course_weight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;
    use approx::assert_relative_eq;

    const DT: f32 = 0.02;

    fn run(estimator: &mut AttitudeEstimator, acc: [f32; 3], gyro: [f32; 3], ticks: u32) {
        // continue from the estimator's own update count so timestamps stay monotonic
        let start = estimator.updates as u64;
        for i in 0..ticks as u64 {
            let sample = ImuSample::new(acc, gyro, (start + i + 1) * 20);
            estimator.update(&sample, DT);
        }
    }

    fn tilted(roll_deg: f32, pitch_deg: f32) -> [f32; 3] {
        let q = UnitQuaternion::from_euler_angles(roll_deg.to_radians(), -pitch_deg.to_radians(), 0.0);
        let g = q.inverse_transform_vector(&Vector3::z()) * GRAVITY;
        [g.x, g.y, g.z]
    }

    #[test]
    fn converges_from_rest_with_right_lean() {
        init_logger();

        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        run(&mut estimator, tilted(20.0, 0.0), [0.0; 3], 50);
        assert!(!estimator.is_converged());

        run(&mut estimator, tilted(20.0, 0.0), [0.0; 3], 250);
        assert!(estimator.is_converged());
        let attitude = estimator.attitude();
        assert_relative_eq!(attitude.roll_deg, 20.0, epsilon = 1.0);
        assert_relative_eq!(attitude.pitch_deg, 0.0, epsilon = 1.0);
    }

    #[test]
    fn nose_up_is_positive_pitch() {
        init_logger();

        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        run(&mut estimator, [GRAVITY * 10f32.to_radians().sin(), 0.0, GRAVITY * 10f32.to_radians().cos()], [0.0; 3], 300);
        assert_relative_eq!(estimator.attitude().pitch_deg, 10.0, epsilon = 1.0);
    }

    #[test]
    fn sustained_forward_acceleration_is_rejected() {
        init_logger();

        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        estimator.seed(0.0, 0.0, 0.0);
        run(&mut estimator, [0.5, 0.0, GRAVITY], [0.0; 3], 500);

        let attitude = estimator.attitude();
        assert!(attitude.pitch_deg.abs() < 0.1);
        assert!(estimator.is_converged());

        // heading north: forward acceleration points north
        let enu = estimator.linear_acceleration_enu(&Vector3::new(0.5, 0.0, GRAVITY));
        assert_relative_eq!(enu, Vector3::new(0.0, 0.5, 0.0), epsilon = 1e-4);
        let (forward, lateral) = estimator.forward_lateral(&Vector3::new(0.5, 0.0, GRAVITY));
        assert_relative_eq!(forward, 0.5, epsilon = 1e-4);
        assert_relative_eq!(lateral, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn rejection_timeout_blends_accelerometer_back_in() {
        init_logger();

        let config = AttitudeConfig {
            rejection_recovery_ms: 1_000,
            ..Default::default()
        };
        let mut estimator = AttitudeEstimator::new(config);
        estimator.seed(0.0, 0.0, 0.0);
        run(&mut estimator, [2.0, 0.0, GRAVITY], [0.0; 3], 40);
        assert!(!estimator.is_recovering());
        assert!(estimator.attitude().pitch_deg.abs() < 1e-3);

        run(&mut estimator, [2.0, 0.0, GRAVITY], [0.0; 3], 260);
        assert!(estimator.is_converged());
        assert!(estimator.is_recovering());
        // pulled towards the apparent tilt, but slowly: 5 s at the recovery gain
        let pitch = estimator.attitude().pitch_deg;
        assert!(pitch > 0.1, "pitch {}", pitch);
        assert!(pitch < 2.0, "pitch {}", pitch);

        run(&mut estimator, [0.0, 0.0, GRAVITY], [0.0; 3], 5);
        assert!(!estimator.is_recovering());
        assert!(estimator.is_converged());
    }

    #[test]
    fn left_turn_reduces_heading() {
        init_logger();

        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        estimator.seed(0.0, 0.0, 90.0);
        // 10 deg/s counter-clockwise for 9 s
        run(&mut estimator, [0.0, 0.0, GRAVITY], [0.0, 0.0, 10.0], 450);

        let attitude = estimator.attitude();
        assert!(heading_difference(attitude.heading_deg, 0.0).abs() < 1.0);
        assert_relative_eq!(estimator.yaw_rate_dps(), 10.0, epsilon = 0.1);
    }

    #[test]
    fn compass_snaps_then_blends() {
        init_logger();

        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        estimator.align_heading(200.0, 0.1);
        assert!(estimator.is_heading_referenced());
        assert_relative_eq!(estimator.attitude().heading_deg, 200.0, epsilon = 1e-3);

        estimator.align_heading(220.0, 0.1);
        assert_relative_eq!(estimator.attitude().heading_deg, 202.0, epsilon = 1e-3);

        // short way across north
        estimator.align_heading(10.0, 1.0);
        assert_relative_eq!(estimator.attitude().heading_deg, 10.0, epsilon = 1e-3);
    }

    #[test]
    fn course_ignored_when_slow() {
        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        estimator.align_with_course(45.0, 1.0);
        assert!(!estimator.is_heading_referenced());
        estimator.align_with_course(45.0, 10.0);
        assert_relative_eq!(estimator.attitude().heading_deg, 45.0, epsilon = 1e-3);
    }

    #[test]
    fn gyro_bias_is_learned_and_bounded() {
        let mut estimator = AttitudeEstimator::new(AttitudeConfig::default());
        estimator.learn_gyro_bias(&Vector3::new(0.01, 0.0, -0.02));
        assert_relative_eq!(estimator.gyro_bias(), Vector3::new(0.01, 0.0, -0.02));

        estimator.learn_gyro_bias(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(estimator.gyro_bias(), Vector3::new(0.01, 0.0, -0.02));

        estimator.reset();
        assert_relative_eq!(estimator.gyro_bias(), Vector3::new(0.01, 0.0, -0.02));
    }
}
