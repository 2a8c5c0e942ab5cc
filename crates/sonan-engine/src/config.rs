use sonan_types::OutputFormat;

use crate::sink::OutputKind;

/// Engine tuning parameters shared by the decode, convert and render stages.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Decode buffer capacity, in seconds of source audio.
    pub buffer_seconds: f32,
    /// Buffered audio (seconds) at which preload progress reaches 1.0.
    pub preload_seconds: f32,
    /// Converter block size in source frames.
    pub chunk_frames: usize,
    /// Minimum preload-progress change that produces a notification.
    pub progress_step: f32,
    /// Preferred sample encoding for the render sink.
    pub output_format: OutputFormat,
    /// Render sink used by `play_url`.
    pub output: OutputKind,
    /// Initial volume in percent (100 = unity gain).
    pub volume_percent: f32,
}

impl Default for EngineConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            buffer_seconds: 2.0,
            preload_seconds: 0.5,
            chunk_frames: 1024,
            progress_step: 0.01,
            output_format: OutputFormat::F32,
            output: OutputKind::default(),
            volume_percent: 100.0,
        }
    }
}

impl EngineConfig {
    /// Buffer size actually used: non-finite or non-positive values fall back to 2s.
    pub fn effective_buffer_seconds(&self) -> f64 {
        if self.buffer_seconds.is_finite() && self.buffer_seconds > 0.0 {
            f64::from(self.buffer_seconds)
        } else {
            2.0
        }
    }

    /// Preload threshold, never larger than the buffer itself.
    pub fn effective_preload_seconds(&self) -> f64 {
        let buffer = self.effective_buffer_seconds();
        if self.preload_seconds.is_finite() && self.preload_seconds > 0.0 {
            f64::from(self.preload_seconds).min(buffer)
        } else {
            buffer.min(0.5)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_buffer_seconds_falls_back() {
        let mut config = EngineConfig::default();
        config.buffer_seconds = f32::NAN;
        assert_eq!(config.effective_buffer_seconds(), 2.0);
        config.buffer_seconds = -3.0;
        assert_eq!(config.effective_buffer_seconds(), 2.0);
    }

    #[test]
    fn preload_is_capped_by_buffer() {
        let mut config = EngineConfig::default();
        config.buffer_seconds = 0.25;
        config.preload_seconds = 1.0;
        assert_eq!(config.effective_preload_seconds(), 0.25);
    }
}
