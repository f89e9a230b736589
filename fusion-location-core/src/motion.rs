use biquad::{Biquad, Coefficients, DirectForm2Transposed, Q_BUTTERWORTH_F32, ToHertz as _, Type};
use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::GRAVITY;

const LEAN_HISTORY: usize = 8;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MotionThresholds {
    pub accel_threshold_mps2: f32,
    pub brake_threshold_mps2: f32,
    pub lean_threshold_deg: f32,
    pub wheelie_pitch_deg: f32,
    pub stoppie_pitch_deg: f32,
    pub drift_yaw_rate_dps: f32,
    /// measured lateral minus centripetal from yaw rate and speed
    pub drift_lateral_residual_mps2: f32,
    pub drift_min_speed_mps: f32,
    /// in g, compared against the raw accelerometer magnitude
    pub high_g_threshold: f32,
    pub moving_speed_mps: f32,
    pub release_ms: u32,
    pub moving_release_ms: u32,
    pub accel_lowpass_hz: f32,
}

impl Default for MotionThresholds {
    fn default() -> Self {
        Self {
            accel_threshold_mps2: 0.3,
            brake_threshold_mps2: 0.3,
            lean_threshold_deg: 15.0,
            wheelie_pitch_deg: 10.0,
            stoppie_pitch_deg: 8.0,
            drift_yaw_rate_dps: 100.0,
            drift_lateral_residual_mps2: 3.0,
            drift_min_speed_mps: 3.0,
            high_g_threshold: 1.5,
            moving_speed_mps: 1.0,
            release_ms: 300,
            moving_release_ms: 10_000,
            accel_lowpass_hz: 5.0,
        }
    }
}

/// Motorcycle motion flags for one tick. Immutable snapshot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionState {
    pub is_accelerating: bool,
    pub is_braking: bool,
    pub is_leaning: bool,
    pub is_wheelie: bool,
    pub is_stoppie: bool,
    pub is_drifting: bool,
    pub is_moving: bool,
    pub is_aggressive: bool,
    /// deg, positive leaning right
    pub lean_angle: f32,
    /// deg/s
    pub lean_rate: f32,
    /// m/s^2, low-passed
    pub forward_accel: f32,
    /// m/s^2 towards the left, low-passed
    pub lateral_accel: f32,
    /// deg/s, positive turning left
    pub yaw_rate: f32,
    pub timestamp_ms: u64,
}

/// What the classifier looks at each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionInput {
    pub timestamp_ms: u64,
    pub forward_accel: f32,
    pub lateral_accel: f32,
    /// raw accelerometer magnitude, m/s^2
    pub acc_magnitude: f32,
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_rate_dps: f32,
    pub speed_mps: f32,
    pub stationary: bool,
}

/// Keeps a flag raised for a while after its condition clears.
#[derive(Debug, Clone, Copy, Default)]
struct Hold {
    last_true_ms: Option<u64>,
}

impl Hold {
    fn step(&mut self, condition: bool, now_ms: u64, release_ms: u32) -> bool {
        if condition {
            self.last_true_ms = Some(now_ms);
            return true;
        }
        match self.last_true_ms {
            Some(t) if now_ms.saturating_sub(t) < release_ms as u64 => true,
            _ => {
                self.last_true_ms = None;
                false
            }
        }
    }

    fn clear(&mut self) {
        self.last_true_ms = None;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Holds {
    accelerating: Hold,
    braking: Hold,
    leaning: Hold,
    wheelie: Hold,
    stoppie: Hold,
    drifting: Hold,
    moving: Hold,
    aggressive: Hold,
}

#[derive(Debug, Clone, Copy)]
struct LeanSample {
    timestamp_ms: u64,
    roll_deg: f32,
}

pub struct MotionClassifier {
    thresholds: MotionThresholds,
    sample_rate_hz: f32,
    forward_low_pass: DirectForm2Transposed<f32>,
    lateral_low_pass: DirectForm2Transposed<f32>,
    lean_history: Deque<LeanSample, LEAN_HISTORY>,
    holds: Holds,
    state: MotionState,
}

impl MotionClassifier {
    pub fn new(thresholds: MotionThresholds, sample_rate_hz: f32) -> Self {
        let coefficients = low_pass_coefficients(sample_rate_hz, thresholds.accel_lowpass_hz);
        Self {
            thresholds,
            sample_rate_hz,
            forward_low_pass: DirectForm2Transposed::<f32>::new(coefficients),
            lateral_low_pass: DirectForm2Transposed::<f32>::new(coefficients),
            lean_history: Deque::new(),
            holds: Holds::default(),
            state: MotionState::default(),
        }
    }

    /// Rebuilds the filters, e.g. when the update rate changes.
    pub fn reconfigure(&mut self, thresholds: MotionThresholds, sample_rate_hz: f32) {
        *self = Self::new(thresholds, sample_rate_hz);
    }

    pub fn thresholds(&self) -> &MotionThresholds {
        &self.thresholds
    }

    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }

    pub fn reset(&mut self) {
        self.forward_low_pass.reset_state();
        self.lateral_low_pass.reset_state();
        self.lean_history.clear();
        self.holds = Holds::default();
        self.state = MotionState::default();
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn classify(&mut self, input: &MotionInput) -> MotionState {
        let now = input.timestamp_ms;
        let lean_rate = self.lean_rate(now, input.roll_deg);
        let forward = self.forward_low_pass.run(input.forward_accel);
        let lateral = self.lateral_low_pass.run(input.lateral_accel);

        let t = &self.thresholds;
        let release = t.release_ms;

        let raw_accelerating = forward > t.accel_threshold_mps2;
        let raw_braking = forward < -t.brake_threshold_mps2;
        let mut is_accelerating = self.holds.accelerating.step(raw_accelerating, now, release);
        let mut is_braking = self.holds.braking.step(raw_braking, now, release);
        if is_accelerating && is_braking {
            // a held flag loses against the other one's live condition, else the sign decides
            if raw_braking || (!raw_accelerating && forward < 0.0) {
                is_accelerating = false;
                self.holds.accelerating.clear();
            } else {
                is_braking = false;
                self.holds.braking.clear();
            }
        }

        let is_moving = self.holds.moving.step(
            !input.stationary && input.speed_mps > t.moving_speed_mps,
            now,
            t.moving_release_ms,
        );

        let is_leaning = self.holds.leaning.step(
            input.roll_deg.abs() > t.lean_threshold_deg,
            now,
            release,
        );

        let is_wheelie = self.holds.wheelie.step(
            is_moving && input.pitch_deg > t.wheelie_pitch_deg,
            now,
            release,
        );

        let is_stoppie = self.holds.stoppie.step(
            input.pitch_deg < -t.stoppie_pitch_deg && forward < -t.brake_threshold_mps2,
            now,
            release,
        );

        let centripetal = input.speed_mps * input.yaw_rate_dps.to_radians();
        let lateral_residual = lateral - centripetal;
        let is_drifting = self.holds.drifting.step(
            input.speed_mps >= t.drift_min_speed_mps
                && (input.yaw_rate_dps.abs() >= t.drift_yaw_rate_dps
                    || lateral_residual.abs() >= t.drift_lateral_residual_mps2),
            now,
            release,
        );

        let is_aggressive = self.holds.aggressive.step(
            input.acc_magnitude > t.high_g_threshold * GRAVITY,
            now,
            release,
        );

        self.state = MotionState {
            is_accelerating,
            is_braking,
            is_leaning,
            is_wheelie,
            is_stoppie,
            is_drifting,
            is_moving,
            is_aggressive,
            lean_angle: input.roll_deg,
            lean_rate,
            forward_accel: forward,
            lateral_accel: lateral,
            yaw_rate: input.yaw_rate_dps,
            timestamp_ms: now,
        };
        self.state
    }

    /// deg/s over the history window
    fn lean_rate(&mut self, now_ms: u64, roll_deg: f32) -> f32 {
        if self.lean_history.is_full() {
            self.lean_history.pop_front();
        }
        // cannot fail, a slot was freed above
        let _ = self.lean_history.push_back(LeanSample {
            timestamp_ms: now_ms,
            roll_deg,
        });

        match self.lean_history.front() {
            Some(oldest) if now_ms > oldest.timestamp_ms => {
                let dt_s = (now_ms - oldest.timestamp_ms) as f32 / 1000.0;
                (roll_deg - oldest.roll_deg) / dt_s
            }
            _ => 0.0,
        }
    }
}

fn low_pass_coefficients(sample_rate_hz: f32, cutoff_hz: f32) -> Coefficients<f32> {
    // cutoff must stay below Nyquist
    let cutoff = cutoff_hz.min(sample_rate_hz * 0.45);
    match Coefficients::<f32>::from_params(
        Type::LowPass,
        sample_rate_hz.hz(),
        cutoff.hz(),
        Q_BUTTERWORTH_F32,
    ) {
        Ok(coefficients) => coefficients,
        Err(_) => {
            log_warn!(
                "invalid low pass ({} Hz at {} Hz), passing acceleration through",
                cutoff_hz,
                sample_rate_hz
            );
            Coefficients {
                a1: 0.0,
                a2: 0.0,
                b0: 1.0,
                b1: 0.0,
                b2: 0.0,
            }
        }
    }
}
