use serde::{Deserialize, Serialize};

/// Top-level playback state of the engine.
///
/// Exactly one value is active at a time. The error value that accompanies
/// [`PlaybackState::Error`] is exposed separately by the engine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Error,
}

impl PlaybackState {
    /// `true` while an output unit is attached (playing or paused).
    pub fn is_active(self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Paused)
    }
}

/// Reason why a track stopped being the current one.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of input with nothing queued after it.
    Eof,
    /// Decoder, converter or output error interrupted playback.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
    /// The engine moved on to the next source.
    Switched,
}

/// Sample encoding emitted by the converter and consumed by the render sink.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// 32-bit float, native endian.
    #[default]
    F32,
    /// 16-bit signed integer, native endian.
    I16,
    /// 32-bit signed integer, native endian.
    I32,
}

impl OutputFormat {
    /// Bytes used by one sample of one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            OutputFormat::F32 | OutputFormat::I32 => 4,
            OutputFormat::I16 => 2,
        }
    }

    /// Parse a user-supplied format name (`f32`, `i16`, `i32`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "f32" | "float" => Some(OutputFormat::F32),
            "i16" | "s16" => Some(OutputFormat::I16),
            "i32" | "s32" => Some(OutputFormat::I32),
            _ => None,
        }
    }
}

/// Point-in-time engine status, suitable for logging or for a status API.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    /// Current top-level state.
    pub state: PlaybackState,
    /// Display text of the captured error (only in [`PlaybackState::Error`]).
    pub error: Option<String>,
    /// Location of the current source.
    pub now_playing: Option<String>,
    /// Location of the armed next source, if any.
    pub next: Option<String>,
    /// Played time in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Total track duration in milliseconds when known.
    pub duration_ms: Option<u64>,
    /// Preload progress of the current input (0.0..=1.0).
    pub preload_progress: f32,
    /// Whether the output can render a full tick without underrun.
    pub ready_to_play: bool,
    /// Volume in percent (100 = unity gain).
    pub volume_percent: f32,
    /// Source sample rate (Hz).
    pub source_rate_hz: Option<u32>,
    /// Source channel count.
    pub source_channels: Option<u16>,
    /// Output sample rate (Hz).
    pub output_rate_hz: Option<u32>,
    /// Output channel count.
    pub output_channels: Option<u16>,
    /// Output sample encoding.
    pub output_format: Option<OutputFormat>,
    /// Whether the converter resamples.
    pub resampling: Option<bool>,
    /// Bytes currently held by the decode buffer.
    pub buffered_bytes: Option<u64>,
    /// Decode buffer capacity in bytes.
    pub buffer_capacity_bytes: Option<u64>,
    /// Frames emitted as silence because of underruns.
    pub underrun_frames: Option<u64>,
    /// Number of render ticks that hit an underrun.
    pub underrun_events: Option<u64>,
    /// Why the previous track ended.
    pub end_reason: Option<PlaybackEndReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_serializes_snake_case() {
        let json = serde_json::to_string(&PlaybackState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        assert!(PlaybackState::Playing.is_active());
        assert!(!PlaybackState::Error.is_active());
    }

    #[test]
    fn output_format_parse_accepts_aliases() {
        assert_eq!(OutputFormat::parse("F32"), Some(OutputFormat::F32));
        assert_eq!(OutputFormat::parse(" s16 "), Some(OutputFormat::I16));
        assert_eq!(OutputFormat::parse("i32"), Some(OutputFormat::I32));
        assert_eq!(OutputFormat::parse("u8"), None);
        assert_eq!(OutputFormat::I16.bytes_per_sample(), 2);
    }

    #[test]
    fn status_defaults_to_stopped() {
        let status = EngineStatus::default();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert!(status.error.is_none());
        assert!(!status.ready_to_play);
    }
}
