//! Scripted ride with known ground truth.

use std::{cell::Cell, rc::Rc};

use anyhow::{Result, bail};
use fusion_location_core::{
    CompassReading, CoordinateTransform, FusionLocationManager, GRAVITY, GnssFix, ImuSample,
    haversine_distance_m, normalize_heading,
};
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    config::{Phase, ScenarioConfig, SimConfig},
    output::{ErrorStats, OutputRecord, OutputSink, Summary, TruthRecord},
    providers::{Feed, HostClock, SimulatedNetwork},
};

/// Turns ease in and out over this long.
const TURN_RAMP_S: f32 = 1.0;
const MOVING_SPEED_MPS: f32 = 0.5;

/// Ideal body frame readings: specific force in m/s^2, angular rate in deg/s.
struct BodyMotion {
    acc: [f32; 3],
    gyro: [f32; 3],
}

/// Point mass rider with a coordinated lean in turns.
struct Truth {
    transform: CoordinateTransform,
    east_m: f64,
    north_m: f64,
    speed_mps: f32,
    heading_deg: f32,
    lean_deg: f32,
}

impl Truth {
    fn new(scenario: &ScenarioConfig) -> Self {
        Self {
            transform: CoordinateTransform::with_origin(scenario.start_lat, scenario.start_lng),
            east_m: 0.0,
            north_m: 0.0,
            speed_mps: 0.0,
            heading_deg: normalize_heading(scenario.start_heading_deg),
            lean_deg: 0.0,
        }
    }

    fn lat_lng(&self) -> (f64, f64) {
        self.transform.to_lat_lng(self.east_m, self.north_m)
    }

    fn step(&mut self, phase: &Phase, t_s: f32, dt_s: f32) -> BodyMotion {
        let (accel_mps2, yaw_rate_dps) = match *phase {
            // stops dead if still rolling
            Phase::Rest { .. } => (-self.speed_mps / dt_s, 0.0),
            Phase::Straight { accel_mps2, .. } => (accel_mps2, 0.0),
            Phase::Turn {
                duration_s,
                yaw_rate_dps,
            } => {
                let ramp = (t_s / TURN_RAMP_S)
                    .min((duration_s - t_s) / TURN_RAMP_S)
                    .clamp(0.0, 1.0);
                (0.0, yaw_rate_dps * ramp)
            }
        };

        let previous_speed = self.speed_mps;
        self.speed_mps = (self.speed_mps + accel_mps2 * dt_s).max(0.0);
        let forward_mps2 = (self.speed_mps - previous_speed) / dt_s;

        let omega = yaw_rate_dps.to_radians();
        let centripetal_mps2 = self.speed_mps * omega;
        // leans into the turn, left turns lean left (negative)
        let lean_rad = -(centripetal_mps2 / GRAVITY).atan();
        let lean_deg = lean_rad.to_degrees();
        let roll_rate_dps = (lean_deg - self.lean_deg) / dt_s;
        self.lean_deg = lean_deg;

        self.heading_deg = normalize_heading(self.heading_deg - yaw_rate_dps * dt_s);
        let heading_rad = (self.heading_deg as f64).to_radians();
        let travelled_m = self.speed_mps as f64 * dt_s as f64;
        self.east_m += travelled_m * heading_rad.sin();
        self.north_m += travelled_m * heading_rad.cos();

        let (s, c) = lean_rad.sin_cos();
        BodyMotion {
            acc: [
                forward_mps2,
                c * centripetal_mps2 + s * GRAVITY,
                -s * centripetal_mps2 + c * GRAVITY,
            ],
            gyro: [roll_rate_dps, yaw_rate_dps * s, yaw_rate_dps * c],
        }
    }

    fn record(&self) -> TruthRecord {
        let (lat, lng) = self.lat_lng();
        TruthRecord {
            lat,
            lng,
            speed_mps: self.speed_mps,
            heading_deg: self.heading_deg,
            lean_deg: self.lean_deg,
        }
    }
}

fn jitter(rng: &mut StdRng, amplitude: f32) -> f32 {
    rng.random_range(-amplitude..=amplitude)
}

pub fn run(config: &SimConfig, sink: &mut OutputSink) -> Result<Summary> {
    let scenario = &config.scenario;
    let interval_ms = config.engine.update_interval_ms as u64;
    let gnss_period_ms = scenario.gnss.period_ms.max(1) as u64;
    let compass_period_ms = scenario.compass.period_ms.max(1) as u64;

    let clock = HostClock::default();
    let imu = Feed::<ImuSample>::new(true);
    let gnss = Feed::<GnssFix>::new(true);
    let compass = Feed::<CompassReading>::new(scenario.compass.enabled);
    let truth_handle = Rc::new(Cell::new((scenario.start_lat, scenario.start_lng)));
    let network = SimulatedNetwork::new(
        clock.clone(),
        truth_handle.clone(),
        scenario.network.clone(),
        scenario.seed.wrapping_add(1),
    );

    let mut manager = FusionLocationManager::new(
        clock.clone(),
        imu.clone(),
        gnss.clone(),
        compass.clone(),
        network,
        config.engine.clone(),
    );
    if !manager.begin(scenario.start_lat, scenario.start_lng) {
        bail!("engine refused to start, check the configuration");
    }
    if scenario.seed_attitude {
        manager.seed_attitude(0.0, 0.0, scenario.start_heading_deg);
    }
    manager.start_recording();

    let mut truth = Truth::new(scenario);
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let mut errors = ErrorStats::default();
    let mut now_ms = 0u64;
    let mut last_output_ms = 0u64;
    let mut last_status_ms = 0u64;

    for phase in &scenario.phases {
        info!("phase {:?}", phase);
        let steps = (phase.duration_s() * 1000.0) as u64 / interval_ms;
        for step in 0..steps {
            now_ms += interval_ms;
            clock.set(now_ms);
            let t_s = (step * interval_ms) as f32 / 1000.0;
            let motion = truth.step(phase, t_s, interval_ms as f32 / 1000.0);
            truth_handle.set(truth.lat_lng());

            let (acc_noise, gyro_noise) = if truth.speed_mps > MOVING_SPEED_MPS {
                (scenario.vibration_mps2, scenario.gyro_vibration_dps)
            } else {
                (scenario.sensor_noise_mps2, 0.05)
            };
            let acc = motion.acc.map(|a| a + jitter(&mut rng, acc_noise));
            let gyro = motion.gyro.map(|g| g + jitter(&mut rng, gyro_noise));
            imu.push(ImuSample::new(acc, gyro, now_ms));

            let ride_s = now_ms as f32 / 1000.0;
            if now_ms % gnss_period_ms == 0 && !scenario.gnss.in_outage(ride_s) {
                let reach = scenario.gnss.noise_m;
                let (lat, lng) = truth.transform.to_lat_lng(
                    truth.east_m + jitter(&mut rng, reach) as f64,
                    truth.north_m + jitter(&mut rng, reach) as f64,
                );
                gnss.push(GnssFix {
                    lat,
                    lng,
                    altitude: Some(50.0),
                    speed_mps: truth.speed_mps,
                    course_deg: (truth.speed_mps > MOVING_SPEED_MPS).then_some(truth.heading_deg),
                    satellites: scenario.gnss.satellites,
                    hdop: Some(scenario.gnss.hdop),
                    valid: true,
                    timestamp_ms: now_ms,
                });
            }
            if now_ms % compass_period_ms == 0 {
                compass.push(CompassReading {
                    heading_deg: normalize_heading(
                        truth.heading_deg + jitter(&mut rng, scenario.compass.noise_deg),
                    ),
                    valid: true,
                    timestamp_ms: now_ms,
                });
            }

            manager.run_loop();
            // one sample per loop, a skipped loop must not replay it later
            imu.clear();

            let point = manager.current_position();
            let truth_record = truth.record();
            let error_m = point
                .valid
                .then(|| haversine_distance_m(point.lat, point.lng, truth_record.lat, truth_record.lng));
            if let Some(error_m) = error_m {
                errors.add(error_m);
            }

            if now_ms - last_output_ms >= config.output.period_ms as u64 {
                last_output_ms = now_ms;
                let mut record = OutputRecord::new(&point, manager.motion_state());
                record.truth = Some(truth_record);
                record.error_m = error_m;
                sink.record(&record)?;
            }
            if now_ms - last_status_ms >= config.output.status_log_period_ms as u64 {
                last_status_ms = now_ms;
                info!("{}", manager.status());
            }
        }
    }

    manager.stop_recording();
    let summary = Summary {
        status: manager.status(),
        trip: manager.trip_stats(),
        error: Some(errors),
    };
    info!(
        "ride done: {:.0} m, mean error {:.1} m, max {:.1} m",
        summary.trip.distance_m, errors.mean_m, errors.max_m
    );
    Ok(summary)
}
