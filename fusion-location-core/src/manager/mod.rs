mod status;
#[cfg(test)]
mod tests;
mod trip;

use libm::{cos, sin, sqrt};

pub use status::{FusionStatus, Stats};
pub use trip::{TRAJECTORY_CAPACITY, TripStats};

use self::trip::TripRecorder;
use crate::{
    attitude::AttitudeEstimator,
    config::{ConfigError, DebugLevel, FusionConfig, validate_update_interval},
    dead_reckoning::{DeadReckoningIntegrator, ImuStep, StepEvent},
    fallback::{FallbackConfig, FallbackLocationController, RequestOutcome, method_name},
    geo::{CoordinateTransform, MAX_PLANAR_RADIUS_M, Origin},
    motion::{MotionClassifier, MotionInput, MotionState},
    providers::{
        CompassSource, GnssSource, ImuSource, NetworkLocationProvider, NoCompass,
        NoNetworkLocation,
    },
    readings::{GnssFix, LocationMethod},
    sync::MotionInterruptFlag,
    time::{Clock, clamped_dt_s, elapsed_ms},
    trajectory::{LocationSource, TrajectoryPoint},
};

/// Reported accuracy before any correction.
const UNKNOWN_ACCURACY_M: f32 = f32::MAX;

#[derive(Debug, Clone, Copy)]
struct Correction {
    timestamp_ms: u64,
    accuracy_m: f32,
    source: LocationSource,
}

fn valid_coordinates(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

/// Owns the estimators and the sensor collaborators, runs the fusion loop and
/// decides which position source is authoritative.
///
/// Call `begin` once, then `run_loop` as often as convenient; it rate limits
/// itself to `update_interval_ms`.
pub struct FusionLocationManager<C, I, G, M = NoCompass, N = NoNetworkLocation>
where
    C: Clock,
    I: ImuSource,
    G: GnssSource,
    M: CompassSource,
    N: NetworkLocationProvider,
{
    clock: C,
    imu: I,
    gnss: G,
    compass: M,
    network: N,

    config: FusionConfig,
    transform: CoordinateTransform,
    attitude: AttitudeEstimator,
    integrator: DeadReckoningIntegrator,
    classifier: MotionClassifier,
    fallback: FallbackLocationController,
    trip: TripRecorder,
    stats: Stats,
    motion_flag: Option<&'static MotionInterruptFlag>,

    begun: bool,
    last_loop_ms: Option<u64>,
    /// sensor timestamp of the last integrated IMU sample
    last_imu_sample_ms: Option<u64>,
    last_imu_ms: Option<u64>,
    /// GNSS loss timer, starts at `begin`
    last_gnss_fix_ms: u64,
    gnss_seen: bool,
    last_compass_ms: Option<u64>,
    last_correction: Option<Correction>,
    altitude_m: f32,
    point: TrajectoryPoint,
    motion: MotionState,
}

impl<C, I, G, M, N> FusionLocationManager<C, I, G, M, N>
where
    C: Clock,
    I: ImuSource,
    G: GnssSource,
    M: CompassSource,
    N: NetworkLocationProvider,
{
    pub fn new(clock: C, imu: I, gnss: G, compass: M, network: N, config: FusionConfig) -> Self {
        Self {
            clock,
            imu,
            gnss,
            compass,
            network,
            transform: CoordinateTransform::new(),
            attitude: AttitudeEstimator::new(config.attitude.clone()),
            integrator: DeadReckoningIntegrator::new(config.dead_reckoning.clone()),
            classifier: MotionClassifier::new(config.motion.clone(), config.sample_rate_hz()),
            fallback: FallbackLocationController::new(config.fallback.clone()),
            trip: TripRecorder::new(),
            stats: Stats::default(),
            motion_flag: None,
            begun: false,
            last_loop_ms: None,
            last_imu_sample_ms: None,
            last_imu_ms: None,
            last_gnss_fix_ms: 0,
            gnss_seen: false,
            last_compass_ms: None,
            last_correction: None,
            altitude_m: 0.0,
            point: TrajectoryPoint::invalid(0),
            motion: MotionState::default(),
            config,
        }
    }

    /// Anchors the planar frame at the initial guess and resets every
    /// estimator. Returns false when the IMU is missing, the coordinates are
    /// unusable or the configuration is invalid.
    pub fn begin(&mut self, init_lat: f64, init_lng: f64) -> bool {
        if let Err(e) = self.config.validate() {
            log_error!("invalid fusion configuration: {}", e);
            return false;
        }
        if !valid_coordinates(init_lat, init_lng) {
            log_error!("invalid initial position {}, {}", init_lat, init_lng);
            return false;
        }
        if !self.imu.is_available() {
            log_error!("IMU unavailable, fusion location not started");
            return false;
        }

        let now = self.clock.now_ms();
        self.transform.set_origin(init_lat, init_lng);
        self.attitude.reset();
        self.integrator.reset(now);
        self.classifier.reset();
        self.fallback.reset();
        self.last_loop_ms = None;
        self.last_imu_sample_ms = None;
        self.last_imu_ms = None;
        self.last_gnss_fix_ms = now;
        self.gnss_seen = false;
        self.last_compass_ms = None;
        self.last_correction = None;
        self.altitude_m = 0.0;
        self.motion = MotionState::default();
        self.begun = true;
        self.refresh_point(now);

        if !self.compass.is_available() {
            log_info!("no compass, heading follows GNSS course");
        }
        log_info!("fusion location started at {}, {}", init_lat, init_lng);
        true
    }

    /// One fusion step, if the update interval has elapsed. Returns whether a
    /// step ran.
    pub fn run_loop(&mut self) -> bool {
        if !self.begun {
            return false;
        }
        let now = self.clock.now_ms();
        if let Some(last) = self.last_loop_ms {
            if elapsed_ms(now, last) < self.config.update_interval_ms as u64 {
                return false;
            }
        }
        self.last_loop_ms = Some(now);
        self.stats.total_updates = self.stats.total_updates.wrapping_add(1);

        if let Some(flag) = self.motion_flag {
            if flag.take() {
                if self.integrator.is_stationary() {
                    log_at!(self.config.debug_level, DebugLevel::Info, "motion interrupt, leaving stationary");
                }
                self.integrator.wake();
            }
        }

        self.process_imu(now);
        self.process_compass(now);
        self.process_gnss();
        self.process_fallback(now);
        self.keep_origin_near();

        self.refresh_point(now);
        if self.point.valid {
            self.stats.fusion_updates = self.stats.fusion_updates.wrapping_add(1);
        }
        self.trip.record(&self.point);

        if self.config.debug_level >= DebugLevel::Verbose {
            log_debug!(
                "[{}] {}, {} v={} hdg={} lean={} src={}",
                now,
                self.point.lat,
                self.point.lng,
                self.point.speed,
                self.point.heading,
                self.point.lean_angle,
                self.point.source
            );
        }
        true
    }

    fn process_imu(&mut self, now: u64) {
        if !self.imu.is_available() {
            return;
        }
        let Some(sample) = self.imu.poll_imu() else {
            return;
        };
        if !sample.is_finite() {
            log_warn!("dropping non-finite IMU sample");
            return;
        }

        let Some(previous_ms) = self.last_imu_sample_ms else {
            self.last_imu_sample_ms = Some(sample.timestamp_ms);
            return;
        };
        let Some(dt) = clamped_dt_s(previous_ms, sample.timestamp_ms, self.config.max_dt_ms)
        else {
            if sample.timestamp_ms < previous_ms {
                log_warn!("IMU clock went backwards, resynchronising");
                self.last_imu_sample_ms = Some(sample.timestamp_ms);
            }
            return;
        };
        self.last_imu_sample_ms = Some(sample.timestamp_ms);
        self.last_imu_ms = Some(now);
        self.stats.imu_updates = self.stats.imu_updates.wrapping_add(1);

        let attitude = self.attitude.update(&sample, dt as f32);
        if !self.attitude.is_converged() {
            return;
        }

        let acc = sample.acceleration();
        let step = ImuStep {
            linear_acc_enu: self.attitude.linear_acceleration_enu(&acc),
            acc_magnitude: acc.norm(),
            gyro: self.attitude.angular_rate(),
        };
        match self.integrator.update(&step, dt, now) {
            StepEvent::ZuptStarted => {
                if let Some(rate) = self.integrator.stationary_gyro_mean() {
                    self.attitude.learn_gyro_bias(&rate);
                }
                log_at!(self.config.debug_level, DebugLevel::Info, "[{}] stationary, velocity zeroed", now);
            }
            StepEvent::DivergenceReset => {
                self.stats.divergence_resets = self.stats.divergence_resets.wrapping_add(1);
            }
            StepEvent::Moving | StepEvent::Stationary => {}
        }

        let (forward, lateral) = self.attitude.forward_lateral(&acc);
        self.motion = self.classifier.classify(&MotionInput {
            timestamp_ms: now,
            forward_accel: forward,
            lateral_accel: lateral,
            acc_magnitude: acc.norm(),
            roll_deg: attitude.roll_deg,
            pitch_deg: attitude.pitch_deg,
            yaw_rate_dps: self.attitude.yaw_rate_dps(),
            speed_mps: self.integrator.horizontal_speed() as f32,
            stationary: self.integrator.is_stationary(),
        });
    }

    fn process_compass(&mut self, now: u64) {
        if !self.compass.is_available() {
            return;
        }
        let Some(reading) = self.compass.poll_heading() else {
            return;
        };
        if !reading.valid || !reading.heading_deg.is_finite() {
            return;
        }
        self.attitude.align_with_compass(reading.heading_deg);
        self.stats.mag_updates = self.stats.mag_updates.wrapping_add(1);
        self.last_compass_ms = Some(now);
    }

    fn process_gnss(&mut self) {
        if let Some(fix) = self.gnss.poll_gnss() {
            self.update_with_gnss(&fix);
        }
    }

    fn process_fallback(&mut self, now: u64) {
        if let Some(fix) = self.fallback.poll(now, &mut self.network) {
            let gnss_fresh =
                self.gnss_seen && !self.fallback.is_gnss_lost(now, self.last_gnss_fix_ms);
            if !gnss_fresh {
                match fix.method {
                    LocationMethod::Lbs => {
                        self.stats.lbs_updates = self.stats.lbs_updates.wrapping_add(1)
                    }
                    LocationMethod::Wifi => {
                        self.stats.wifi_updates = self.stats.wifi_updates.wrapping_add(1)
                    }
                }
                self.apply_correction(
                    fix.lat,
                    fix.lng,
                    None,
                    fix.accuracy_m,
                    fix.method.into(),
                    now,
                );
            } else {
                log_at!(
                    self.config.debug_level,
                    DebugLevel::Info,
                    "GNSS is back, dropping {} fix",
                    method_name(fix.method)
                );
            }
        }

        if let Some(outcome) = self
            .fallback
            .update(now, self.last_gnss_fix_ms, &mut self.network)
        {
            log_at!(
                self.config.debug_level,
                DebugLevel::Info,
                "[{}] GNSS lost, fallback request {}",
                now,
                outcome
            );
        }
    }

    /// External GNSS injection. `valid` gates whether the call counts as a
    /// fix at all. Returns whether the fix was applied.
    pub fn update_with_gps(&mut self, lat: f64, lng: f64, speed: f32, valid: bool) -> bool {
        if !self.begun {
            log_warn!("GNSS fix before begin(), ignored");
            return false;
        }
        if !valid || !valid_coordinates(lat, lng) {
            return false;
        }
        let now = self.clock.now_ms();
        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        let accuracy_m = self.config.gnss_default_accuracy_m;
        self.accept_gnss(lat, lng, speed, None, None, accuracy_m, now);
        true
    }

    /// Full fix injection with quality gating. Returns whether the fix was
    /// applied.
    pub fn update_with_gnss(&mut self, fix: &GnssFix) -> bool {
        if !self.begun {
            log_warn!("GNSS fix before begin(), ignored");
            return false;
        }
        if !fix.valid {
            return false;
        }
        let now = self.clock.now_ms();
        let hdop_ok = fix.hdop.is_none_or(|hdop| hdop <= self.config.max_hdop);
        let age_ms = elapsed_ms(now, fix.timestamp_ms);
        if !fix.has_valid_coordinates()
            || fix.satellites < self.config.min_satellites
            || !hdop_ok
            || age_ms > self.config.gnss_stale_ms as u64
        {
            self.stats.rejected_gnss = self.stats.rejected_gnss.wrapping_add(1);
            log_debug!(
                "rejected GNSS fix: {} sats, age {} ms",
                fix.satellites,
                age_ms
            );
            return false;
        }

        let accuracy_m = match fix.hdop {
            Some(hdop) => hdop * self.config.gnss_accuracy_per_hdop_m,
            None => self.config.gnss_default_accuracy_m,
        };
        let speed = if fix.speed_mps.is_finite() {
            fix.speed_mps.max(0.0)
        } else {
            0.0
        };
        self.accept_gnss(
            fix.lat,
            fix.lng,
            speed,
            fix.course_deg.filter(|c| c.is_finite()),
            fix.altitude.filter(|a| a.is_finite()),
            accuracy_m,
            now,
        );
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_gnss(
        &mut self,
        lat: f64,
        lng: f64,
        speed: f32,
        course_deg: Option<f32>,
        altitude: Option<f32>,
        accuracy_m: f32,
        now: u64,
    ) {
        if let Some(course) = course_deg {
            self.attitude.align_with_course(course, speed);
        }
        if let Some(altitude) = altitude {
            self.altitude_m = altitude;
        }

        let direction = course_deg.unwrap_or(self.attitude.attitude().heading_deg);
        let direction = (direction as f64).to_radians();
        let speed = speed as f64;
        let velocity = (speed * sin(direction), speed * cos(direction));

        if !self.gnss_seen {
            self.gnss_seen = true;
            log_at!(self.config.debug_level, DebugLevel::Info, "[{}] first GNSS fix", now);
        }
        self.last_gnss_fix_ms = now;
        self.stats.gps_updates = self.stats.gps_updates.wrapping_add(1);
        self.apply_correction(lat, lng, Some(velocity), accuracy_m, LocationSource::Gnss, now);
    }

    /// Snaps the integrator to an external fix, re-anchoring the origin when
    /// the fix is far away from it or from the dead reckoned position.
    fn apply_correction(
        &mut self,
        lat: f64,
        lng: f64,
        velocity_en: Option<(f64, f64)>,
        accuracy_m: f32,
        source: LocationSource,
        now: u64,
    ) {
        let (mut x, mut y) = self.transform.to_local_xy(lat, lng);
        let position = self.integrator.position();
        let (dx, dy) = (x - position.x, y - position.y);
        let jump_m = sqrt(dx * dx + dy * dy);

        let far_from_origin = sqrt(x * x + y * y) > MAX_PLANAR_RADIUS_M;
        let large_jump = self.last_correction.is_some() && jump_m > self.config.reanchor_jump_m as f64;
        if far_from_origin || large_jump {
            log_at!(
                self.config.debug_level,
                DebugLevel::Info,
                "re-anchoring origin at {} fix, {} m from estimate",
                source,
                jump_m
            );
            self.transform.set_origin(lat, lng);
            x = 0.0;
            y = 0.0;
        }

        self.integrator.apply_fix(x, y, velocity_en, now);

        let previous = self.location_source();
        if previous != source {
            log_at!(
                self.config.debug_level,
                DebugLevel::Info,
                "[{}] location source {} -> {}",
                now,
                previous,
                source
            );
        }
        self.last_correction = Some(Correction {
            timestamp_ms: now,
            accuracy_m,
            source,
        });
        self.refresh_point(now);
    }

    /// Keeps the equirectangular approximation accurate on long rides.
    fn keep_origin_near(&mut self) {
        let p = self.integrator.position();
        if sqrt(p.x * p.x + p.y * p.y) > MAX_PLANAR_RADIUS_M {
            let (lat, lng) = self.transform.to_lat_lng(p.x, p.y);
            self.move_origin(lat, lng);
        }
    }

    fn move_origin(&mut self, lat: f64, lng: f64) {
        let previous = self.transform;
        self.transform.set_origin(lat, lng);
        let p = self.integrator.position();
        let (x, y) = self.transform.reproject_from(&previous, p.x, p.y);
        self.integrator.set_position_xy(x, y);
        log_at!(
            self.config.debug_level,
            DebugLevel::Info,
            "origin moved to {}, {}",
            lat,
            lng
        );
    }

    fn position_accuracy(&self, now: u64) -> f32 {
        match self.last_correction {
            Some(c) => {
                let since_s = elapsed_ms(now, c.timestamp_ms) as f32 / 1000.0;
                c.accuracy_m + self.config.dead_reckoning_error_growth_mps * since_s
            }
            None => UNKNOWN_ACCURACY_M,
        }
    }

    fn refresh_point(&mut self, now: u64) {
        let p = self.integrator.position();
        let (lat, lng) = self.transform.to_lat_lng(p.x, p.y);
        let attitude = self.attitude.attitude();
        let valid = self.transform.has_origin()
            && (self.attitude.is_converged() || self.last_correction.is_some());

        self.point = TrajectoryPoint {
            lat,
            lng,
            altitude: self.altitude_m + p.z as f32,
            speed: self.integrator.horizontal_speed() as f32,
            heading: attitude.heading_deg,
            pitch: attitude.pitch_deg,
            roll: attitude.roll_deg,
            lean_angle: attitude.roll_deg,
            timestamp_ms: now,
            valid,
            accuracy_m: self.position_accuracy(now),
            source: self.location_source(),
        };
    }

    pub fn current_position(&self) -> TrajectoryPoint {
        self.point
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion
    }

    pub fn location_source(&self) -> LocationSource {
        self.last_correction
            .map_or(LocationSource::None, |c| c.source)
    }

    pub fn is_stationary(&self) -> bool {
        self.integrator.is_stationary()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    pub fn status(&self) -> FusionStatus {
        let now = self.clock.now_ms();
        let age = |t: Option<u64>| t.map(|t| elapsed_ms(now, t));
        let correction_age_ms = age(self.last_correction.map(|c| c.timestamp_ms));
        FusionStatus {
            timestamp_ms: now,
            valid: self.point.valid,
            source: self.location_source(),
            dead_reckoning: correction_age_ms
                .is_none_or(|age| age > self.config.gnss_stale_ms as u64),
            attitude_converged: self.attitude.is_converged(),
            heading_referenced: self.attitude.is_heading_referenced(),
            stationary: self.integrator.is_stationary(),
            accuracy_m: self.position_accuracy(now),
            imu_age_ms: age(self.last_imu_ms),
            gnss_age_ms: age(self.gnss_seen.then_some(self.last_gnss_fix_ms)),
            compass_age_ms: age(self.last_compass_ms),
            correction_age_ms,
            lbs_in_progress: self.fallback.is_in_progress(LocationMethod::Lbs),
            wifi_in_progress: self.fallback.is_in_progress(LocationMethod::Wifi),
            origin: self.transform.origin(),
            stats: self.stats,
        }
    }

    pub fn start_recording(&mut self) {
        let now = self.clock.now_ms();
        self.trip.start(now);
        log_at!(self.config.debug_level, DebugLevel::Info, "[{}] trip recording started", now);
    }

    pub fn stop_recording(&mut self) {
        let now = self.clock.now_ms();
        self.trip.stop(now);
        log_at!(self.config.debug_level, DebugLevel::Info, "[{}] trip recording stopped", now);
    }

    pub fn clear_trajectory(&mut self) {
        let now = self.clock.now_ms();
        self.trip.clear(now);
    }

    pub fn trip_stats(&self) -> TripStats {
        self.trip.stats()
    }

    /// Oldest first, one point per second of recording.
    pub fn recent_trajectory(&self) -> impl Iterator<Item = TrajectoryPoint> + '_ {
        self.trip.recent()
    }

    pub fn configure_fallback_location(&mut self, config: FallbackConfig) -> Result<(), ConfigError> {
        if !(config.max_accuracy_m.is_finite() && config.max_accuracy_m > 0.0) {
            return Err(ConfigError::NotPositive("fallback.max_accuracy_m"));
        }
        self.fallback.configure(config.clone());
        self.config.fallback = config;
        Ok(())
    }

    pub fn request_lbs_location(&mut self) -> RequestOutcome {
        self.request_network_location(LocationMethod::Lbs)
    }

    pub fn request_wifi_location(&mut self) -> RequestOutcome {
        self.request_network_location(LocationMethod::Wifi)
    }

    fn request_network_location(&mut self, method: LocationMethod) -> RequestOutcome {
        let now = self.clock.now_ms();
        let outcome = self.fallback.request(method, now, &mut self.network);
        log_at!(
            self.config.debug_level,
            DebugLevel::Info,
            "manual {} request: {}",
            method_name(method),
            outcome
        );
        outcome
    }

    pub fn origin(&self) -> Origin {
        self.transform.origin()
    }

    /// Moves the planar origin, keeping the current position in place.
    pub fn set_origin(&mut self, lat: f64, lng: f64) -> bool {
        if !valid_coordinates(lat, lng) {
            return false;
        }
        if self.transform.has_origin() {
            self.move_origin(lat, lng);
        } else {
            self.transform.set_origin(lat, lng);
        }
        let now = self.clock.now_ms();
        self.refresh_point(now);
        true
    }

    /// Re-anchors the origin at the current position estimate.
    pub fn reset_origin(&mut self) -> bool {
        if !self.transform.has_origin() {
            return false;
        }
        let p = self.integrator.position();
        let (lat, lng) = self.transform.to_lat_lng(p.x, p.y);
        self.set_origin(lat, lng)
    }

    /// Starts from a known attitude instead of waiting for convergence.
    /// Call after `begin`, which resets the attitude.
    pub fn seed_attitude(&mut self, roll_deg: f32, pitch_deg: f32, heading_deg: f32) {
        self.attitude.seed(roll_deg, pitch_deg, heading_deg);
        let now = self.clock.now_ms();
        self.refresh_point(now);
        log_info!(
            "attitude seeded: roll {} pitch {} heading {}",
            roll_deg,
            pitch_deg,
            heading_deg
        );
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Replaces the whole configuration. Runtime state is kept.
    pub fn configure(&mut self, config: FusionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.attitude.set_config(config.attitude.clone());
        self.integrator.set_config(config.dead_reckoning.clone());
        self.classifier
            .reconfigure(config.motion.clone(), config.sample_rate_hz());
        self.fallback.configure(config.fallback.clone());
        self.config = config;
        Ok(())
    }

    pub fn set_update_interval_ms(&mut self, update_interval_ms: u32) -> Result<(), ConfigError> {
        validate_update_interval(update_interval_ms)?;
        if self.config.max_dt_ms < update_interval_ms {
            return Err(ConfigError::MaxDtTooShort {
                max_dt_ms: self.config.max_dt_ms,
                update_interval_ms,
            });
        }
        self.config.update_interval_ms = update_interval_ms;
        self.classifier
            .reconfigure(self.config.motion.clone(), self.config.sample_rate_hz());
        Ok(())
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.config.debug_level = level;
    }

    /// Wake-on-motion interrupt shared with the IMU driver.
    pub fn set_motion_interrupt_flag(&mut self, flag: &'static MotionInterruptFlag) {
        self.motion_flag = Some(flag);
    }

    /// Hands the collaborators back, e.g. to power them down.
    pub fn release(self) -> (C, I, G, M, N) {
        (self.clock, self.imu, self.gnss, self.compass, self.network)
    }
}
