use approx::assert_relative_eq;
use core::f64::consts::PI;
use std::{format, vec::Vec};

use crate::{
    GRAVITY,
    config::{ConfigError, FusionConfig},
    fallback::{FallbackConfig, RequestOutcome},
    geo::EARTH_RADIUS_M,
    readings::{GnssFix, LocationMethod},
    sync::MotionInterruptFlag,
    tests::{
        init_logger,
        sim::{AT_REST, Ride},
    },
    trajectory::LocationSource,
};

const BEIJING: (f64, f64) = (39.9042, 116.4074);
const M_PER_DEG: f64 = EARTH_RADIUS_M * PI / 180.0;
/// First sample only sets the IMU clock, then the low-pass filter settles.
const CLASSIFIER_WARMUP_TICKS: u32 = 4;

fn north_of_start(m: f64) -> f64 {
    BEIJING.0 + m / M_PER_DEG
}

fn started(config: FusionConfig) -> Ride {
    let mut ride = Ride::new(config);
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));
    ride.manager.seed_attitude(0.0, 0.0, 0.0);
    ride
}

fn short_gnss_timeout() -> FusionConfig {
    FusionConfig {
        fallback: FallbackConfig {
            gnss_timeout_ms: 5_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn begin_requires_imu_and_sane_input() {
    init_logger();

    let mut ride = Ride::new(FusionConfig::default());
    ride.imu.set_available(false);
    assert!(!ride.manager.begin(BEIJING.0, BEIJING.1));
    assert!(!ride.manager.run_loop());

    ride.imu.set_available(true);
    assert!(!ride.manager.begin(f64::NAN, BEIJING.1));
    assert!(!ride.manager.begin(BEIJING.0, 181.0));
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));
    assert!(ride.manager.run_loop());

    let mut ride = Ride::new(FusionConfig {
        update_interval_ms: 0,
        ..Default::default()
    });
    assert!(!ride.manager.begin(BEIJING.0, BEIJING.1));
}

#[test]
fn run_loop_is_rate_limited() {
    let mut ride = Ride::new(FusionConfig::default());
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));

    assert!(ride.manager.run_loop());
    assert!(!ride.manager.run_loop());
    ride.clock.advance(10);
    assert!(!ride.manager.run_loop());
    ride.clock.advance(10);
    assert!(ride.manager.run_loop());
    assert_eq!(ride.manager.stats().total_updates, 2);
}

#[test]
fn invalid_until_attitude_converges() {
    init_logger();

    let mut ride = Ride::new(FusionConfig::default());
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));

    ride.rest(50);
    assert!(!ride.manager.current_position().valid);
    assert!(!ride.manager.status().attitude_converged);

    ride.rest(100);
    let point = ride.manager.current_position();
    assert!(point.valid);
    assert_eq!(point.source, LocationSource::None);
    assert_eq!(point.accuracy_m, f32::MAX);
    assert_relative_eq!(point.lat, BEIJING.0, epsilon = 1e-9);
    assert_relative_eq!(point.lng, BEIJING.1, epsilon = 1e-9);
    assert!(format!("{}", ride.manager.status()).contains("mode=DR"));
}

#[test]
fn gnss_fix_makes_point_valid_before_convergence() {
    let mut ride = Ride::new(FusionConfig::default());
    assert!(!ride.manager.update_with_gps(BEIJING.0, BEIJING.1, 0.0, true));
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));
    ride.rest(5);
    assert!(!ride.manager.current_position().valid);

    assert!(ride.manager.update_with_gps(north_of_start(20.0), BEIJING.1, 0.0, true));
    let point = ride.manager.current_position();
    assert!(point.valid);
    assert_eq!(point.source, LocationSource::Gnss);
    assert_relative_eq!(point.lat, north_of_start(20.0), epsilon = 1e-9);
}

#[test]
fn acceleration_then_fix() {
    init_logger();

    let mut ride = started(FusionConfig::default());

    let mut last_speed = 0.0;
    for i in 0..500 {
        assert!(ride.tick([0.5, 0.0, GRAVITY], [0.0; 3]));
        let point = ride.manager.current_position();
        assert!(point.valid);
        assert!(point.speed >= last_speed, "tick {}", i);
        last_speed = point.speed;
        if i >= CLASSIFIER_WARMUP_TICKS {
            assert!(ride.manager.motion_state().is_accelerating, "tick {}", i);
            assert!(!ride.manager.motion_state().is_braking);
        }
    }
    assert!(last_speed > 4.9 && last_speed < 5.0, "{}", last_speed);

    let point = ride.manager.current_position();
    assert!(point.lat > north_of_start(20.0));
    assert_relative_eq!(point.lng, BEIJING.1, epsilon = 1e-6);
    assert_relative_eq!(point.roll, 0.0, epsilon = 0.5);
    assert_relative_eq!(point.pitch, 0.0, epsilon = 0.5);

    let fix_lat = north_of_start(50.0);
    assert!(ride.manager.update_with_gps(fix_lat, BEIJING.1, 0.0, true));
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, fix_lat, epsilon = 1e-9);
    assert_relative_eq!(point.speed, 0.0, epsilon = 1e-6);

    ride.rest(1);
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, fix_lat, epsilon = 1e-7);
    assert_relative_eq!(point.lng, BEIJING.1, epsilon = 1e-7);
    assert!(point.speed < 0.01);
    assert_eq!(point.source, LocationSource::Gnss);
    assert_relative_eq!(ride.manager.origin().lat, BEIJING.0);
}

#[test]
fn sustained_acceleration_keeps_dead_reckoning() {
    init_logger();

    // 26 s of 1 m/s^2 with no fix, past the 20 s accelerometer rejection limit
    let mut ride = started(FusionConfig::default());
    let mut last_lat = BEIJING.0;
    for i in 0..1300 {
        assert!(ride.tick([1.0, 0.0, GRAVITY], [0.0; 3]));
        let point = ride.manager.current_position();
        assert!(point.valid, "tick {}", i);
        assert!(!ride.manager.is_stationary(), "tick {}", i);
        if i >= 2 {
            assert!(point.lat > last_lat, "tick {}", i);
        }
        last_lat = point.lat;
    }

    let point = ride.manager.current_position();
    assert!(point.speed > 20.0, "{}", point.speed);
    assert!(point.lat > north_of_start(250.0));
    assert!(ride.manager.status().attitude_converged);
    assert!(ride.manager.motion_state().is_accelerating);
    assert_eq!(ride.manager.stats().divergence_resets, 0);
}

#[test]
fn gnss_quality_gate() {
    init_logger();

    let mut ride = started(FusionConfig::default());
    ride.rest(100);

    let good = ride.fix(north_of_start(30.0), BEIJING.1, 0.0, None);
    let few_satellites = GnssFix {
        satellites: 2,
        ..good
    };
    let poor_hdop = GnssFix {
        hdop: Some(9.0),
        ..good
    };
    let stale = GnssFix {
        timestamp_ms: good.timestamp_ms - 2_500,
        ..good
    };
    let off_planet = GnssFix { lat: 95.0, ..good };
    for fix in [few_satellites, poor_hdop, stale, off_planet] {
        assert!(!ride.manager.update_with_gnss(&fix));
    }
    let not_a_fix = GnssFix {
        valid: false,
        ..good
    };
    assert!(!ride.manager.update_with_gnss(&not_a_fix));

    let stats = ride.manager.stats();
    assert_eq!(stats.rejected_gnss, 4);
    assert_eq!(stats.gps_updates, 0);
    assert_eq!(ride.manager.location_source(), LocationSource::None);

    ride.gnss.push(good);
    ride.rest(1);
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, good.lat, epsilon = 1e-8);
    assert_relative_eq!(point.altitude, 45.0, epsilon = 1e-3);
    assert_relative_eq!(point.accuracy_m, 0.8 * 5.0, epsilon = 0.1);
    assert_eq!(ride.manager.stats().gps_updates, 1);

    let status = ride.manager.status();
    assert!(!status.dead_reckoning);
    let line = format!("{}", status);
    assert!(line.contains("src=GNSS"), "{}", line);
    assert!(line.contains("mode=FIX"), "{}", line);
    assert!(line.contains("rej=4"), "{}", line);
}

#[test]
fn gps_injection_checks_validity() {
    let mut ride = started(FusionConfig::default());
    assert!(!ride.manager.update_with_gps(BEIJING.0, BEIJING.1, 0.0, false));
    assert!(!ride.manager.update_with_gps(91.0, BEIJING.1, 0.0, true));
    assert!(!ride.manager.update_with_gps(BEIJING.0, f64::INFINITY, 0.0, true));
    assert_eq!(ride.manager.stats().gps_updates, 0);
    assert_eq!(ride.manager.location_source(), LocationSource::None);
}

#[test]
fn course_sets_velocity_direction() {
    let mut ride = started(FusionConfig::default());
    ride.rest(10);

    let fix = ride.fix(BEIJING.0, BEIJING.1, 10.0, Some(90.0));
    assert!(ride.manager.update_with_gnss(&fix));
    assert_relative_eq!(ride.manager.current_position().speed, 10.0, epsilon = 1e-4);
    // course pulls the heading a tenth of the way
    assert_relative_eq!(ride.manager.current_position().heading, 9.0, epsilon = 0.1);

    ride.rest(1);
    let point = ride.manager.current_position();
    assert!(point.lng > BEIJING.1);
    assert_relative_eq!(point.lat, BEIJING.0, epsilon = 1e-8);
}

#[test]
fn far_fix_moves_origin() {
    let mut ride = started(FusionConfig::default());
    let far = north_of_start(10_000.0);
    assert!(ride.manager.update_with_gps(far, BEIJING.1, 0.0, true));

    let origin = ride.manager.origin();
    assert!(origin.has_origin);
    assert_relative_eq!(origin.lat, far);
    assert_relative_eq!(ride.manager.current_position().lat, far, epsilon = 1e-9);
}

#[test]
fn large_jump_between_fixes_moves_origin() {
    let mut ride = started(FusionConfig::default());
    assert!(ride.manager.update_with_gps(BEIJING.0, BEIJING.1, 0.0, true));
    ride.rest(5);
    assert_relative_eq!(ride.manager.origin().lat, BEIJING.0);

    let jump = north_of_start(1_000.0);
    assert!(ride.manager.update_with_gps(jump, BEIJING.1, 0.0, true));
    assert_relative_eq!(ride.manager.origin().lat, jump);
    assert_relative_eq!(ride.manager.current_position().lat, jump, epsilon = 1e-9);
}

#[test]
fn long_dead_reckoning_moves_origin() {
    init_logger();

    let mut ride = started(FusionConfig::default());
    ride.rest(20);
    assert!(ride.manager.update_with_gps(north_of_start(4_990.0), BEIJING.1, 20.0, true));
    assert_relative_eq!(ride.manager.origin().lat, BEIJING.0);

    // 30 ticks at 20 m/s crosses the 5 km radius
    ride.rest(30);
    let origin = ride.manager.origin();
    assert!(origin.lat > north_of_start(4_990.0));
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, north_of_start(5_002.0), epsilon = 1e-6);
    assert_relative_eq!(point.lng, BEIJING.1, epsilon = 1e-7);
}

#[test]
fn moving_origin_keeps_position() {
    let mut ride = started(FusionConfig::default());
    let (lat, lng) = (BEIJING.0 + 0.001, BEIJING.1 + 0.001);
    assert!(ride.manager.update_with_gps(lat, lng, 0.0, true));

    assert!(ride.manager.set_origin(BEIJING.0 + 0.002, BEIJING.1));
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, lat, epsilon = 1e-9);
    assert_relative_eq!(point.lng, lng, epsilon = 1e-9);
    assert_relative_eq!(ride.manager.origin().lat, BEIJING.0 + 0.002);

    assert!(!ride.manager.set_origin(f64::NAN, BEIJING.1));

    assert!(ride.manager.reset_origin());
    let origin = ride.manager.origin();
    assert_relative_eq!(origin.lat, lat, epsilon = 1e-9);
    assert_relative_eq!(origin.lng, lng, epsilon = 1e-9);
    let point = ride.manager.current_position();
    assert_relative_eq!(point.lat, lat, epsilon = 1e-9);
    assert_relative_eq!(point.lng, lng, epsilon = 1e-9);
}

#[test]
fn fallback_fills_gnss_gap() {
    init_logger();

    let mut ride = started(short_gnss_timeout());
    ride.rest(250);
    assert!(ride.network.requests().is_empty());

    ride.rest(1);
    let requests = ride.network.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, LocationMethod::Wifi);
    assert!(ride.manager.status().wifi_in_progress);

    let wifi_lat = north_of_start(200.0);
    ride.network.succeed_last(wifi_lat, BEIJING.1, 40.0);
    ride.rest(1);

    let point = ride.manager.current_position();
    assert_eq!(point.source, LocationSource::Wifi);
    assert_relative_eq!(point.lat, wifi_lat, epsilon = 1e-7);
    assert!(point.accuracy_m >= 40.0 && point.accuracy_m < 41.0);
    assert_eq!(ride.manager.stats().wifi_updates, 1);
    assert!(!ride.manager.status().wifi_in_progress);

    // no LBS storm straight after a good fix
    ride.rest(100);
    assert_eq!(ride.network.requests().len(), 1);
}

#[test]
fn fallback_fix_is_dropped_once_gnss_is_back() {
    init_logger();

    let mut ride = started(short_gnss_timeout());
    ride.rest(251);
    assert_eq!(ride.network.requests().len(), 1);

    assert!(ride.manager.update_with_gps(BEIJING.0, BEIJING.1, 0.0, true));
    ride.network.succeed_last(north_of_start(300.0), BEIJING.1, 40.0);
    ride.rest(1);

    assert_eq!(ride.manager.location_source(), LocationSource::Gnss);
    assert_relative_eq!(ride.manager.current_position().lat, BEIJING.0, epsilon = 1e-7);
    assert_eq!(ride.manager.stats().wifi_updates, 0);
    assert!(!ride.manager.status().wifi_in_progress);
}

#[test]
fn manual_lbs_request() {
    init_logger();

    let mut ride = started(FusionConfig::default());
    ride.rest(5);

    let first = ride.manager.request_lbs_location();
    assert!(matches!(first, RequestOutcome::Started { .. }));
    assert_eq!(ride.manager.request_lbs_location(), RequestOutcome::InProgress);
    assert_eq!(ride.network.requests().len(), 1);

    ride.network.succeed_last(north_of_start(300.0), BEIJING.1, 500.0);
    ride.rest(1);
    assert_eq!(ride.manager.location_source(), LocationSource::Lbs);
    assert_eq!(ride.manager.stats().lbs_updates, 1);

    assert!(matches!(
        ride.manager.request_lbs_location(),
        RequestOutcome::CoolingDown { .. }
    ));
    assert!(matches!(
        ride.manager.request_wifi_location(),
        RequestOutcome::Started { .. }
    ));
    assert_eq!(ride.network.requests().len(), 2);

    ride.network.set_available(false);
    assert_eq!(ride.manager.request_wifi_location(), RequestOutcome::Unavailable);
}

#[test]
fn fallback_configuration_is_checked() {
    let mut ride = started(FusionConfig::default());
    let bad = FallbackConfig {
        max_accuracy_m: -1.0,
        ..Default::default()
    };
    assert!(ride.manager.configure_fallback_location(bad).is_err());

    let disabled = FallbackConfig {
        enabled: false,
        gnss_timeout_ms: 1_000,
        ..Default::default()
    };
    assert!(ride.manager.configure_fallback_location(disabled).is_ok());
    assert!(!ride.manager.config().fallback.enabled);
    ride.rest(200);
    assert!(ride.network.requests().is_empty());
}

#[test]
fn zero_velocity_at_rest_and_motion_interrupt() {
    init_logger();

    static FLAG: MotionInterruptFlag = MotionInterruptFlag::new();

    let mut ride = started(FusionConfig::default());
    ride.manager.set_motion_interrupt_flag(&FLAG);
    assert!(ride.manager.update_with_gps(BEIJING.0, BEIJING.1, 3.0, true));

    ride.rest(80);
    assert!(ride.manager.is_stationary());
    assert!(ride.manager.status().stationary);
    assert!(ride.manager.current_position().speed < 1e-6);

    FLAG.signal();
    ride.rest(1);
    assert!(!FLAG.is_pending());
    assert!(!ride.manager.is_stationary());

    ride.rest(80);
    assert!(ride.manager.is_stationary());
}

#[test]
fn trip_recording() {
    init_logger();

    let mut ride = started(FusionConfig::default());
    ride.manager.start_recording();
    let start = ride.fix(BEIJING.0, BEIJING.1, 10.0, Some(0.0));
    assert!(ride.manager.update_with_gnss(&start));

    for s in 1..=10 {
        ride.rest(49);
        let fix = ride.fix(north_of_start(10.0 * s as f64), BEIJING.1, 10.0, Some(0.0));
        ride.gnss.push(fix);
        ride.rest(1);
    }
    assert!(!ride.manager.is_stationary());

    let stats = ride.manager.trip_stats();
    assert!(stats.recording);
    assert!(stats.distance_m > 80.0 && stats.distance_m < 100.0, "{}", stats.distance_m);
    assert_relative_eq!(stats.max_speed_mps, 10.0, epsilon = 0.1);
    assert!((9..=11).contains(&stats.point_count), "{}", stats.point_count);

    let recent: Vec<_> = ride.manager.recent_trajectory().collect();
    assert_eq!(recent.len(), stats.point_count as usize);
    assert!(recent.windows(2).all(|w| w[1].lat > w[0].lat));

    ride.manager.stop_recording();
    let stats = ride.manager.trip_stats();
    assert!(!stats.recording);
    assert_eq!(stats.duration_ms, 10_000);

    ride.manager.clear_trajectory();
    assert_eq!(ride.manager.trip_stats().distance_m, 0.0);
    assert_eq!(ride.manager.recent_trajectory().count(), 0);
}

#[test]
fn compass_references_heading() {
    let mut ride = Ride::new(FusionConfig::default());
    assert!(ride.manager.begin(BEIJING.0, BEIJING.1));
    ride.rest(2);
    assert!(!ride.manager.status().heading_referenced);

    ride.compass.push(120.0, ride.clock.now());
    ride.rest(1);
    assert!(ride.manager.status().heading_referenced);
    assert_eq!(ride.manager.stats().mag_updates, 1);
    assert_relative_eq!(ride.manager.current_position().heading, 120.0, epsilon = 0.5);
}

#[test]
fn stats_count_and_reset() {
    let mut ride = started(FusionConfig::default());
    ride.rest(10);
    let stats = ride.manager.stats();
    assert_eq!(stats.total_updates, 10);
    assert_eq!(stats.imu_updates, 9);
    assert_eq!(stats.fusion_updates, 10);

    ride.imu.set_available(false);
    ride.rest(5);
    assert_eq!(ride.manager.stats().imu_updates, 9);
    assert_eq!(ride.manager.stats().total_updates, 15);
    assert_eq!(ride.manager.status().imu_age_ms, Some(100));

    ride.manager.reset_stats();
    assert_eq!(ride.manager.stats(), Default::default());
}

#[test]
fn update_interval_is_validated() {
    let mut ride = started(FusionConfig::default());
    assert!(matches!(
        ride.manager.set_update_interval_ms(0),
        Err(ConfigError::UpdateIntervalOutOfRange(0))
    ));
    assert!(matches!(
        ride.manager.set_update_interval_ms(500),
        Err(ConfigError::MaxDtTooShort { .. })
    ));
    assert!(ride.manager.set_update_interval_ms(40).is_ok());
    assert_eq!(ride.manager.config().update_interval_ms, 40);

    assert!(ride.tick(AT_REST, [0.0; 3]));
    assert!(!ride.tick(AT_REST, [0.0; 3]));
    assert!(ride.tick(AT_REST, [0.0; 3]));
}
