use std::path::PathBuf;

use clap::Parser;
use sonan_types::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "sonan-play", version)]
pub struct Args {
    /// Files or `tone:<hz>?seconds=..` specs, played in order without gaps
    pub inputs: Vec<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML config file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Decode buffer size in seconds of source audio
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// Buffered seconds at which a source counts as preloaded
    #[arg(long)]
    pub preload_seconds: Option<f32>,

    /// Converter chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long)]
    pub chunk_frames: Option<usize>,

    /// Sample encoding for the output device: f32, i16 or i32
    #[arg(long, value_parser = parse_output_format)]
    pub output_format: Option<OutputFormat>,

    /// Volume in percent (100 = unity)
    #[arg(long)]
    pub volume: Option<f32>,

    /// Seek the first input to this position (seconds) once it starts
    #[arg(long)]
    pub start_at: Option<f64>,

    /// Render in real time without an audio device
    #[arg(long)]
    pub null_output: bool,

    /// Print the final engine status as JSON
    #[arg(long)]
    pub status_json: bool,
}

fn parse_output_format(raw: &str) -> Result<OutputFormat, String> {
    OutputFormat::parse(raw).ok_or_else(|| format!("unknown output format {raw:?} (use f32, i16 or i32)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inputs_and_overrides() {
        let args = Args::parse_from([
            "sonan-play",
            "--output-format",
            "i16",
            "--volume",
            "50",
            "a.flac",
            "tone:440?seconds=1",
        ]);
        assert_eq!(args.inputs, vec!["a.flac", "tone:440?seconds=1"]);
        assert_eq!(args.output_format, Some(OutputFormat::I16));
        assert_eq!(args.volume, Some(50.0));
        assert!(args.buffer_seconds.is_none());
    }

    #[test]
    fn rejects_unknown_output_format() {
        assert!(Args::try_parse_from(["sonan-play", "--output-format", "u8"]).is_err());
    }
}
