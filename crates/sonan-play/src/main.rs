//! sonan-play: play local files or generated tones through the sonan engine.
//!
//! Inputs are handed to the engine one after another through its next-source provider,
//! so consecutive tracks play without a gap. `--null-output` renders in real time without
//! touching an audio device.

use anyhow::Result;
use clap::Parser;
use sonan_play::cli::Args;
use sonan_play::config::{FileConfig, PlayConfig};
use sonan_play::runtime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,sonan_engine=info,sonan_play=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let file = match args.config.as_deref() {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    runtime::run_play(PlayConfig::resolve(&args, file))
}
