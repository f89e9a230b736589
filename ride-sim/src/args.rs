use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "Ride Sim")]
#[command(bin_name = "ride-sim")]
pub struct Cli {
    #[arg(long, help = "TOML configuration, built-in defaults when omitted")]
    pub config: Option<PathBuf>,

    #[arg(long, short, help = "write JSON lines here instead of stdout")]
    pub output: Option<PathBuf>,

    #[clap(subcommand)]
    pub mode: ModeSelect,
}

#[derive(Subcommand, Debug)]
pub enum ModeSelect {
    #[command(about = "ride the configured scenario and score the estimate against ground truth")]
    Synthetic,

    #[command(about = "feed recorded sensor CSV files through the engine")]
    Replay(ReplayCli),

    #[command(about = "print the effective configuration as TOML")]
    DumpConfig,
}

#[derive(Parser, Debug)]
pub struct ReplayCli {
    #[arg(help = "timestamp_ms,acc_x,acc_y,acc_z,gyro_x,gyro_y,gyro_z")]
    pub imu_csv: PathBuf,

    #[arg(long, help = "timestamp_ms,lat,lng,speed_mps,course_deg,satellites,hdop,altitude")]
    pub gnss_csv: Option<PathBuf>,

    #[arg(long, requires = "lng", allow_negative_numbers = true)]
    pub lat: Option<f64>,

    #[arg(long, requires = "lat", allow_negative_numbers = true)]
    pub lng: Option<f64>,

    #[arg(long, help = "initial heading, degrees clockwise from north")]
    pub heading: Option<f32>,
}
