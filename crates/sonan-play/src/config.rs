//! Player configuration: an optional TOML file merged with CLI flags.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sonan_engine::{EngineConfig, OutputKind};
use sonan_types::OutputFormat;

use crate::cli::Args;

/// Settings accepted in the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub device: Option<String>,
    pub buffer_seconds: Option<f32>,
    pub preload_seconds: Option<f32>,
    pub chunk_frames: Option<usize>,
    pub output_format: Option<OutputFormat>,
    pub volume: Option<f32>,
    pub null_output: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<FileConfig>(&raw).with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Everything the runtime needs to play a list of inputs.
#[derive(Clone, Debug)]
pub struct PlayConfig {
    pub inputs: Vec<String>,
    pub engine: EngineConfig,
    pub start_at: Option<f64>,
    pub status_json: bool,
}

impl PlayConfig {
    /// Resolve CLI flags over file values over engine defaults.
    pub fn resolve(args: &Args, file: FileConfig) -> Self {
        let defaults = EngineConfig::default();
        let device = normalize_device_name(args.device.clone().or(file.device));
        let null_output = args.null_output || file.null_output.unwrap_or(false);
        let output = if null_output {
            OutputKind::Null {
                sample_rate: None,
                channels: None,
            }
        } else {
            OutputKind::Device { name: device }
        };

        let engine = EngineConfig {
            buffer_seconds: args
                .buffer_seconds
                .or(file.buffer_seconds)
                .unwrap_or(defaults.buffer_seconds),
            preload_seconds: args
                .preload_seconds
                .or(file.preload_seconds)
                .unwrap_or(defaults.preload_seconds),
            chunk_frames: args
                .chunk_frames
                .or(file.chunk_frames)
                .unwrap_or(defaults.chunk_frames),
            output_format: args
                .output_format
                .or(file.output_format)
                .unwrap_or(defaults.output_format),
            volume_percent: args.volume.or(file.volume).unwrap_or(defaults.volume_percent),
            output,
            ..defaults
        };

        Self {
            inputs: args.inputs.clone(),
            engine,
            start_at: args.start_at,
            status_json: args.status_json,
        }
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
