use std::{fs::File, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use csv::Reader;
use fusion_location_core::{FusionLocationManager, GnssFix, ImuSample, NoCompass, NoNetworkLocation};
use log::{info, warn};
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    args::ReplayCli,
    config::SimConfig,
    output::{OutputRecord, OutputSink, Summary},
    providers::{Feed, HostClock},
};

#[derive(Debug, Deserialize)]
struct ImuRecord {
    timestamp_ms: u64,
    acc_x: f32,
    acc_y: f32,
    acc_z: f32,
    gyro_x: f32,
    gyro_y: f32,
    gyro_z: f32,
}

impl From<ImuRecord> for ImuSample {
    fn from(r: ImuRecord) -> Self {
        ImuSample::new(
            [r.acc_x, r.acc_y, r.acc_z],
            [r.gyro_x, r.gyro_y, r.gyro_z],
            r.timestamp_ms,
        )
    }
}

#[derive(Debug, Deserialize)]
struct GnssRecord {
    timestamp_ms: u64,
    lat: f64,
    lng: f64,
    speed_mps: f32,
    course_deg: Option<f32>,
    satellites: u8,
    hdop: Option<f32>,
    altitude: Option<f32>,
}

impl From<GnssRecord> for GnssFix {
    fn from(r: GnssRecord) -> Self {
        GnssFix {
            lat: r.lat,
            lng: r.lng,
            altitude: r.altitude,
            speed_mps: r.speed_mps,
            course_deg: r.course_deg,
            satellites: r.satellites,
            hdop: r.hdop,
            valid: true,
            timestamp_ms: r.timestamp_ms,
        }
    }
}

fn read_csv_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = Reader::from_reader(file);
    let mut records = Vec::new();
    for (i, row) in reader.deserialize().enumerate() {
        records.push(row.with_context(|| format!("{} row {}", path.display(), i + 2))?);
    }
    Ok(records)
}

pub fn run(config: &SimConfig, args: &ReplayCli, sink: &mut OutputSink) -> Result<Summary> {
    let imu_records: Vec<ImuRecord> = read_csv_records(&args.imu_csv)?;
    let mut fixes: Vec<GnssFix> = match &args.gnss_csv {
        Some(path) => read_csv_records::<GnssRecord>(path)?
            .into_iter()
            .map(GnssFix::from)
            .collect(),
        None => Vec::new(),
    };
    fixes.sort_by_key(|f| f.timestamp_ms);
    info!(
        "replaying {} IMU samples and {} GNSS fixes",
        imu_records.len(),
        fixes.len()
    );

    let (start_lat, start_lng) = match (args.lat, args.lng) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => fixes
            .first()
            .map(|f| (f.lat, f.lng))
            .ok_or(anyhow!("no GNSS fixes, pass --lat and --lng"))?,
    };
    let Some(first_ms) = imu_records.first().map(|r| r.timestamp_ms) else {
        bail!("no IMU samples in {}", args.imu_csv.display());
    };

    let clock = HostClock::default();
    clock.set(first_ms);
    let imu = Feed::<ImuSample>::new(true);
    let gnss = Feed::<GnssFix>::new(true);
    let mut manager = FusionLocationManager::new(
        clock.clone(),
        imu.clone(),
        gnss.clone(),
        NoCompass,
        NoNetworkLocation,
        config.engine.clone(),
    );
    if !manager.begin(start_lat, start_lng) {
        bail!("engine refused to start, check the configuration");
    }
    if let Some(heading) = args.heading {
        manager.seed_attitude(0.0, 0.0, heading);
    }
    manager.start_recording();

    let mut fixes = fixes.into_iter().peekable();
    let mut last_output_ms = first_ms;
    let mut skipped = 0u32;
    for record in imu_records {
        let now_ms = record.timestamp_ms;
        clock.set(now_ms);
        while let Some(fix) = fixes.next_if(|f| f.timestamp_ms <= now_ms) {
            gnss.push(fix);
        }
        imu.push(record.into());
        if !manager.run_loop() {
            skipped += 1;
        }
        imu.clear();

        if now_ms.saturating_sub(last_output_ms) >= config.output.period_ms as u64 {
            last_output_ms = now_ms;
            sink.record(&OutputRecord::new(
                &manager.current_position(),
                manager.motion_state(),
            ))?;
        }
    }
    if skipped > 0 {
        warn!(
            "{} samples arrived faster than the {} ms update interval and were skipped",
            skipped, config.engine.update_interval_ms
        );
    }

    manager.stop_recording();
    Ok(Summary {
        status: manager.status(),
        trip: manager.trip_stats(),
        error: None,
    })
}
