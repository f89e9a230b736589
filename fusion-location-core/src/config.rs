use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    attitude::AttitudeConfig, dead_reckoning::DeadReckoningConfig, fallback::FallbackConfig,
    motion::MotionThresholds,
};

pub const MIN_UPDATE_INTERVAL_MS: u32 = 5;
pub const MAX_UPDATE_INTERVAL_MS: u32 = 1_000;

/// Verbosity of the manager's own diagnostics. Warnings and errors are
/// always logged.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DebugLevel {
    Off,
    /// state transitions: source changes, ZUPT, origin moves
    #[default]
    Info,
    /// one line per tick
    Verbose,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub update_interval_ms: u32,
    pub max_dt_ms: u32,
    pub min_satellites: u8,
    pub max_hdop: f32,
    /// fixes older than this when they arrive are dropped
    pub gnss_stale_ms: u32,
    /// horizontal accuracy assumed per unit of HDOP, m
    pub gnss_accuracy_per_hdop_m: f32,
    /// accuracy assumed for `update_with_gps`, m
    pub gnss_default_accuracy_m: f32,
    /// position uncertainty added per second without a correction, m/s
    pub dead_reckoning_error_growth_mps: f32,
    /// a fix this far from the dead reckoned position re-anchors the origin
    pub reanchor_jump_m: f32,
    pub debug_level: DebugLevel,
    pub attitude: AttitudeConfig,
    pub dead_reckoning: DeadReckoningConfig,
    pub motion: MotionThresholds,
    pub fallback: FallbackConfig,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 20,
            max_dt_ms: 200,
            min_satellites: 4,
            max_hdop: 5.0,
            gnss_stale_ms: 2_000,
            gnss_accuracy_per_hdop_m: 5.0,
            gnss_default_accuracy_m: 10.0,
            dead_reckoning_error_growth_mps: 0.5,
            reanchor_jump_m: 500.0,
            debug_level: DebugLevel::Info,
            attitude: AttitudeConfig::default(),
            dead_reckoning: DeadReckoningConfig::default(),
            motion: MotionThresholds::default(),
            fallback: FallbackConfig::default(),
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    UpdateIntervalOutOfRange(u32),
    /// max dt shorter than one update interval
    MaxDtTooShort { max_dt_ms: u32, update_interval_ms: u32 },
    /// a threshold that must be a positive finite number is not
    NotPositive(&'static str),
    /// a weight outside [0, 1]
    WeightOutOfRange(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UpdateIntervalOutOfRange(ms) => write!(
                f,
                "update interval {} ms outside {}..={} ms",
                ms, MIN_UPDATE_INTERVAL_MS, MAX_UPDATE_INTERVAL_MS
            ),
            ConfigError::MaxDtTooShort {
                max_dt_ms,
                update_interval_ms,
            } => write!(
                f,
                "max dt {} ms is shorter than the update interval {} ms",
                max_dt_ms, update_interval_ms
            ),
            ConfigError::NotPositive(name) => write!(f, "{} must be positive", name),
            ConfigError::WeightOutOfRange(name) => write!(f, "{} must be within 0..=1", name),
        }
    }
}

fn positive(value: f32, name: &'static str) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive(name))
    }
}

fn weight(value: f32, name: &'static str) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::WeightOutOfRange(name))
    }
}

pub fn validate_update_interval(update_interval_ms: u32) -> Result<(), ConfigError> {
    if (MIN_UPDATE_INTERVAL_MS..=MAX_UPDATE_INTERVAL_MS).contains(&update_interval_ms) {
        Ok(())
    } else {
        Err(ConfigError::UpdateIntervalOutOfRange(update_interval_ms))
    }
}

impl FusionConfig {
    pub fn sample_rate_hz(&self) -> f32 {
        1000.0 / self.update_interval_ms.max(1) as f32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_update_interval(self.update_interval_ms)?;
        if self.max_dt_ms < self.update_interval_ms {
            return Err(ConfigError::MaxDtTooShort {
                max_dt_ms: self.max_dt_ms,
                update_interval_ms: self.update_interval_ms,
            });
        }
        positive(self.max_hdop, "max_hdop")?;
        positive(self.gnss_accuracy_per_hdop_m, "gnss_accuracy_per_hdop_m")?;
        positive(self.gnss_default_accuracy_m, "gnss_default_accuracy_m")?;
        positive(self.reanchor_jump_m, "reanchor_jump_m")?;

        let a = &self.attitude;
        positive(a.beta, "attitude.beta")?;
        positive(a.initial_beta, "attitude.initial_beta")?;
        positive(a.convergence_residual_deg, "attitude.convergence_residual_deg")?;
        positive(a.accel_rejection_mps2, "attitude.accel_rejection_mps2")?;
        positive(a.recovery_beta, "attitude.recovery_beta")?;
        weight(a.compass_weight, "attitude.compass_weight")?;
        weight(a.course_weight, "attitude.course_weight")?;

        let d = &self.dead_reckoning;
        positive(d.stationary_variance, "dead_reckoning.stationary_variance")?;
        positive(
            d.stationary_linear_accel_mps2,
            "dead_reckoning.stationary_linear_accel_mps2",
        )?;
        positive(d.stationary_gyro_dps, "dead_reckoning.stationary_gyro_dps")?;
        positive(d.max_speed_mps, "dead_reckoning.max_speed_mps")?;

        let m = &self.motion;
        positive(m.accel_threshold_mps2, "motion.accel_threshold_mps2")?;
        positive(m.brake_threshold_mps2, "motion.brake_threshold_mps2")?;
        positive(m.high_g_threshold, "motion.high_g_threshold")?;
        positive(m.accel_lowpass_hz, "motion.accel_lowpass_hz")?;

        positive(self.fallback.max_accuracy_m, "fallback.max_accuracy_m")?;
        Ok(())
    }
}
