use anyhow::{Context, Result, anyhow};
use fusion_location_core::FusionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub engine: FusionConfig,
    pub scenario: ScenarioConfig,
    pub output: OutputConfig,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&config_str)?;
        config
            .engine
            .validate()
            .map_err(|e| anyhow!("invalid engine configuration: {}", e))?;
        Ok(config)
    }
}

/// One leg of a scripted ride. Speeds never go negative, a long brake ends at
/// a standstill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Phase {
    Rest { duration_s: f32 },
    Straight { duration_s: f32, accel_mps2: f32 },
    /// constant speed, positive yaw rate turns left
    Turn { duration_s: f32, yaw_rate_dps: f32 },
}

impl Phase {
    pub fn duration_s(&self) -> f32 {
        match self {
            Phase::Rest { duration_s }
            | Phase::Straight { duration_s, .. }
            | Phase::Turn { duration_s, .. } => *duration_s,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub start_lat: f64,
    pub start_lng: f64,
    pub start_heading_deg: f32,
    /// start from the true attitude instead of waiting for convergence
    pub seed_attitude: bool,
    pub seed: u64,
    /// engine and road vibration while moving, m/s^2 peak
    pub vibration_mps2: f32,
    pub gyro_vibration_dps: f32,
    pub sensor_noise_mps2: f32,
    pub gnss: GnssScenario,
    pub compass: CompassScenario,
    pub network: NetworkScenario,
    pub phases: Vec<Phase>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            start_lat: 39.9042,
            start_lng: 116.4074,
            start_heading_deg: 0.0,
            seed_attitude: true,
            seed: 7,
            vibration_mps2: 1.0,
            gyro_vibration_dps: 2.0,
            sensor_noise_mps2: 0.02,
            gnss: GnssScenario::default(),
            compass: CompassScenario::default(),
            network: NetworkScenario::default(),
            phases: vec![
                Phase::Rest { duration_s: 5.0 },
                Phase::Straight {
                    duration_s: 8.0,
                    accel_mps2: 2.5,
                },
                Phase::Straight {
                    duration_s: 20.0,
                    accel_mps2: 0.0,
                },
                Phase::Turn {
                    duration_s: 9.0,
                    yaw_rate_dps: 10.0,
                },
                Phase::Straight {
                    duration_s: 30.0,
                    accel_mps2: 0.0,
                },
                Phase::Straight {
                    duration_s: 5.0,
                    accel_mps2: -4.0,
                },
                Phase::Rest { duration_s: 10.0 },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outage {
    pub start_s: f32,
    pub duration_s: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssScenario {
    pub period_ms: u32,
    pub noise_m: f32,
    pub satellites: u8,
    pub hdop: f32,
    pub outages: Vec<Outage>,
}

impl Default for GnssScenario {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            noise_m: 2.0,
            satellites: 11,
            hdop: 0.9,
            outages: vec![Outage {
                start_s: 30.0,
                duration_s: 45.0,
            }],
        }
    }
}

impl GnssScenario {
    pub fn in_outage(&self, t_s: f32) -> bool {
        self.outages
            .iter()
            .any(|o| t_s >= o.start_s && t_s < o.start_s + o.duration_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompassScenario {
    pub enabled: bool,
    pub period_ms: u32,
    pub noise_deg: f32,
}

impl Default for CompassScenario {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 100,
            noise_deg: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkScenario {
    pub available: bool,
    pub lbs_latency_ms: u32,
    pub wifi_latency_ms: u32,
    pub lbs_accuracy_m: f32,
    pub wifi_accuracy_m: f32,
    /// fraction of requests answered with a failure
    pub failure_rate: f32,
}

impl Default for NetworkScenario {
    fn default() -> Self {
        Self {
            available: true,
            lbs_latency_ms: 3_000,
            wifi_latency_ms: 1_500,
            lbs_accuracy_m: 600.0,
            wifi_accuracy_m: 40.0,
            failure_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// one JSON line per period
    pub period_ms: u32,
    pub status_log_period_ms: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            status_log_period_ms: 10_000,
        }
    }
}
