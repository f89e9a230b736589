use heapless::Deque;
use serde::{Deserialize, Serialize};

use crate::{geo::haversine_distance_m, time::elapsed_ms, trajectory::TrajectoryPoint};

pub const TRAJECTORY_CAPACITY: usize = 64;
const TRAJECTORY_SAMPLE_MS: u64 = 1_000;
/// segments implying more than this are position corrections, not travel
const MAX_SEGMENT_SPEED_MPS: f64 = 100.0;
const MIN_SEGMENT_M: f64 = 0.5;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct TripStats {
    pub recording: bool,
    pub distance_m: f64,
    pub max_speed_mps: f32,
    pub max_lean_left_deg: f32,
    pub max_lean_right_deg: f32,
    pub duration_ms: u64,
    pub point_count: u32,
}

/// Trip statistics plus a short ring of recent points, one per second.
#[derive(Debug, Clone)]
pub(super) struct TripRecorder {
    stats: TripStats,
    /// duration of earlier recording segments
    banked_ms: u64,
    started_ms: Option<u64>,
    last_point: Option<TrajectoryPoint>,
    points: Deque<TrajectoryPoint, TRAJECTORY_CAPACITY>,
}

impl TripRecorder {
    pub fn new() -> Self {
        Self {
            stats: TripStats::default(),
            banked_ms: 0,
            started_ms: None,
            last_point: None,
            points: Deque::new(),
        }
    }

    pub fn start(&mut self, now_ms: u64) {
        if self.started_ms.is_none() {
            self.started_ms = Some(now_ms);
            self.stats.recording = true;
            self.last_point = None;
        }
    }

    pub fn stop(&mut self, now_ms: u64) {
        if let Some(started) = self.started_ms.take() {
            self.banked_ms += elapsed_ms(now_ms, started);
            self.stats.duration_ms = self.banked_ms;
            self.stats.recording = false;
        }
    }

    /// Drops statistics and points, keeps recording if it was.
    pub fn clear(&mut self, now_ms: u64) {
        let recording = self.started_ms.is_some();
        *self = Self::new();
        if recording {
            self.start(now_ms);
        }
    }

    pub fn record(&mut self, point: &TrajectoryPoint) {
        let Some(started) = self.started_ms else {
            return;
        };
        self.stats.duration_ms = self.banked_ms + elapsed_ms(point.timestamp_ms, started);
        if !point.valid {
            return;
        }

        self.stats.max_speed_mps = self.stats.max_speed_mps.max(point.speed);
        if point.lean_angle < 0.0 {
            self.stats.max_lean_left_deg = self.stats.max_lean_left_deg.max(-point.lean_angle);
        } else {
            self.stats.max_lean_right_deg = self.stats.max_lean_right_deg.max(point.lean_angle);
        }

        if let Some(last) = self.last_point {
            let dt_ms = elapsed_ms(point.timestamp_ms, last.timestamp_ms);
            if dt_ms < TRAJECTORY_SAMPLE_MS {
                return;
            }
            let d = haversine_distance_m(last.lat, last.lng, point.lat, point.lng);
            let max_d = MAX_SEGMENT_SPEED_MPS * dt_ms as f64 / 1000.0;
            if (MIN_SEGMENT_M..=max_d).contains(&d) {
                self.stats.distance_m += d;
            }
        }
        self.push(*point);
    }

    fn push(&mut self, point: TrajectoryPoint) {
        if self.points.is_full() {
            self.points.pop_front();
        }
        let _ = self.points.push_back(point);
        self.last_point = Some(point);
        self.stats.point_count = self.stats.point_count.saturating_add(1);
    }

    pub fn stats(&self) -> TripStats {
        self.stats
    }

    pub fn recent(&self) -> impl Iterator<Item = TrajectoryPoint> + '_ {
        self.points.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(t_ms: u64, north_m: f64, speed: f32, lean: f32) -> TrajectoryPoint {
        TrajectoryPoint {
            lat: 39.9042 + north_m / 111_194.93,
            lng: 116.4074,
            speed,
            lean_angle: lean,
            timestamp_ms: t_ms,
            valid: true,
            ..TrajectoryPoint::invalid(t_ms)
        }
    }

    #[test]
    fn ignores_points_while_not_recording() {
        let mut trip = TripRecorder::new();
        trip.record(&point(0, 0.0, 10.0, 0.0));
        assert_eq!(trip.stats(), TripStats::default());
        assert_eq!(trip.recent().count(), 0);
    }

    #[test]
    fn accumulates_distance_speed_and_lean() {
        let mut trip = TripRecorder::new();
        trip.start(0);
        for i in 0..=20u64 {
            // 10 m/s north, ticks every 200 ms, swinging lean
            let lean = if i % 2 == 0 { -35.0 } else { 28.0 };
            trip.record(&point(i * 200, i as f64 * 2.0, 10.0 + i as f32 * 0.1, lean));
        }
        let stats = trip.stats();
        assert_relative_eq!(stats.distance_m, 40.0, epsilon = 0.05);
        assert_relative_eq!(stats.max_speed_mps, 12.0);
        assert_eq!(stats.max_lean_left_deg, 35.0);
        assert_eq!(stats.max_lean_right_deg, 28.0);
        assert_eq!(stats.duration_ms, 4_000);
        assert_eq!(stats.point_count, 5);
        assert!(stats.recording);
    }

    #[test]
    fn correction_jumps_are_not_distance() {
        let mut trip = TripRecorder::new();
        trip.start(0);
        trip.record(&point(0, 0.0, 5.0, 0.0));
        trip.record(&point(1_000, 500.0, 5.0, 0.0));
        assert_eq!(trip.stats().distance_m, 0.0);
    }

    #[test]
    fn stop_banks_duration_and_clear_resets() {
        let mut trip = TripRecorder::new();
        trip.start(1_000);
        trip.stop(3_000);
        trip.start(10_000);
        trip.record(&point(11_000, 0.0, 1.0, 0.0));
        assert_eq!(trip.stats().duration_ms, 3_000);
        trip.stop(12_000);
        assert_eq!(trip.stats().duration_ms, 4_000);
        assert!(!trip.stats().recording);

        trip.clear(13_000);
        assert_eq!(trip.stats(), TripStats::default());
        assert_eq!(trip.recent().count(), 0);
    }

    #[test]
    fn ring_keeps_latest_points() {
        let mut trip = TripRecorder::new();
        trip.start(0);
        for i in 0..100u64 {
            trip.record(&point(i * 1_000, i as f64, 1.0, 0.0));
        }
        assert_eq!(trip.recent().count(), TRAJECTORY_CAPACITY);
        assert_eq!(trip.recent().last().map(|p| p.timestamp_ms), Some(99_000));
    }
}
