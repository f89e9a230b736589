mod args;
mod config;
mod output;
mod providers;
mod replay;
mod synthetic;

use anyhow::Result;
use args::{Cli, ModeSelect};
use clap::Parser;
use config::SimConfig;
use log::LevelFilter;
use output::OutputSink;

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };

    match cli.mode {
        ModeSelect::Synthetic => {
            let mut sink = OutputSink::create(cli.output.as_deref())?;
            let summary = synthetic::run(&config, &mut sink)?;
            sink.finish(&summary)?;
        }
        ModeSelect::Replay(args) => {
            let mut sink = OutputSink::create(cli.output.as_deref())?;
            let summary = replay::run(&config, &args, &mut sink)?;
            sink.finish(&summary)?;
        }
        ModeSelect::DumpConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
