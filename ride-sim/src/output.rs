use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
};

use anyhow::Result;
use fusion_location_core::{FusionStatus, LocationSource, MotionState, TrajectoryPoint, TripStats};
use serde::Serialize;

/// Accuracies past this mean "no correction yet".
const UNKNOWN_ACCURACY_M: f32 = 1.0e6;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TruthRecord {
    pub lat: f64,
    pub lng: f64,
    pub speed_mps: f32,
    pub heading_deg: f32,
    pub lean_deg: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub t_ms: u64,
    pub valid: bool,
    pub source: LocationSource,
    pub lat: f64,
    pub lng: f64,
    pub altitude_m: f32,
    pub speed_mps: f32,
    pub heading_deg: f32,
    pub lean_deg: f32,
    pub pitch_deg: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f32>,
    pub motion: MotionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truth: Option<TruthRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_m: Option<f64>,
}

impl OutputRecord {
    pub fn new(point: &TrajectoryPoint, motion: MotionState) -> Self {
        Self {
            t_ms: point.timestamp_ms,
            valid: point.valid,
            source: point.source,
            lat: point.lat,
            lng: point.lng,
            altitude_m: point.altitude,
            speed_mps: point.speed,
            heading_deg: point.heading,
            lean_deg: point.lean_angle,
            pitch_deg: point.pitch,
            accuracy_m: (point.accuracy_m < UNKNOWN_ACCURACY_M).then_some(point.accuracy_m),
            motion,
            truth: None,
            error_m: None,
        }
    }
}

/// Horizontal error of valid estimates against ground truth.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ErrorStats {
    pub samples: u32,
    pub mean_m: f64,
    pub max_m: f64,
    pub final_m: f64,
}

impl ErrorStats {
    pub fn add(&mut self, error_m: f64) {
        self.samples += 1;
        self.mean_m += (error_m - self.mean_m) / self.samples as f64;
        self.max_m = self.max_m.max(error_m);
        self.final_m = error_m;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub status: FusionStatus,
    pub trip: TripStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorStats>,
}

/// JSON lines, one record per line, the summary last.
pub struct OutputSink {
    writer: Box<dyn Write>,
}

impl OutputSink {
    pub fn create(path: Option<&Path>) -> Result<Self> {
        let writer: Box<dyn Write> = match path {
            Some(path) => Box::new(BufWriter::new(File::create(path)?)),
            None => Box::new(BufWriter::new(io::stdout())),
        };
        Ok(Self { writer })
    }

    pub fn record(&mut self, record: &OutputRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        writeln!(self.writer)?;
        Ok(())
    }

    pub fn finish(mut self, summary: &Summary) -> Result<()> {
        #[derive(Serialize)]
        struct Wrapped<'a> {
            summary: &'a Summary,
        }
        serde_json::to_writer(&mut self.writer, &Wrapped { summary })?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}
