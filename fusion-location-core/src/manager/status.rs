use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{geo::Origin, trajectory::LocationSource};

/// Monotonic counters. Diagnostics only, nothing branches on them.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub total_updates: u32,
    pub gps_updates: u32,
    pub imu_updates: u32,
    pub mag_updates: u32,
    pub fusion_updates: u32,
    pub lbs_updates: u32,
    pub wifi_updates: u32,
    pub rejected_gnss: u32,
    pub divergence_resets: u32,
}

/// One-glance health summary of the engine.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct FusionStatus {
    pub timestamp_ms: u64,
    pub valid: bool,
    pub source: LocationSource,
    /// no correction within the GNSS staleness window
    pub dead_reckoning: bool,
    pub attitude_converged: bool,
    pub heading_referenced: bool,
    pub stationary: bool,
    pub accuracy_m: f32,
    pub imu_age_ms: Option<u64>,
    pub gnss_age_ms: Option<u64>,
    pub compass_age_ms: Option<u64>,
    pub correction_age_ms: Option<u64>,
    pub lbs_in_progress: bool,
    pub wifi_in_progress: bool,
    pub origin: Origin,
    pub stats: Stats,
}

struct Age(Option<u64>);

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ms) => write!(f, "{}ms", ms),
            None => f.write_str("-"),
        }
    }
}

fn flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

impl fmt::Display for FusionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} src={} mode={} att={} hdg={} still={}",
            self.timestamp_ms,
            if self.valid { "valid" } else { "INVALID" },
            self.source,
            if self.dead_reckoning { "DR" } else { "FIX" },
            if self.attitude_converged { "ok" } else { "init" },
            if self.heading_referenced { "ref" } else { "free" },
            flag(self.stationary),
        )?;
        if self.accuracy_m < 1.0e6 {
            write!(f, " acc={:.1}m", self.accuracy_m)?;
        } else {
            f.write_str(" acc=-")?;
        }
        write!(
            f,
            " age imu={} gnss={} mag={} fix={} fb lbs={} wifi={}",
            Age(self.imu_age_ms),
            Age(self.gnss_age_ms),
            Age(self.compass_age_ms),
            Age(self.correction_age_ms),
            flag(self.lbs_in_progress),
            flag(self.wifi_in_progress),
        )?;
        let s = &self.stats;
        write!(
            f,
            " n={} gps={} imu={} mag={} fused={} lbs={} wifi={} rej={} div={}",
            s.total_updates,
            s.gps_updates,
            s.imu_updates,
            s.mag_updates,
            s.fusion_updates,
            s.lbs_updates,
            s.wifi_updates,
            s.rejected_gnss,
            s.divergence_resets,
        )
    }
}
