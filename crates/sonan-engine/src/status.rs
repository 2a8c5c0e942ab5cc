//! Observable engine state.
//!
//! The control thread is the only writer; public query methods on the engine read from
//! here without a round trip. Counters that move on the render path (played frames,
//! underruns) are read live from the output unit's atomics at snapshot time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sonan_types::{EngineStatus, OutputFormat, PlaybackEndReason, PlaybackState};

use crate::error::EngineError;
use crate::input::InputUnit;
use crate::output::OutputUnit;
use crate::unit::AudioUnit;

/// Shared status store updated by the control thread.
#[derive(Default)]
pub struct EngineShared {
    inner: Mutex<SharedState>,
}

#[derive(Default)]
pub struct SharedState {
    pub state: PlaybackState,
    pub error: Option<EngineError>,
    pub current: Option<Arc<InputUnit>>,
    pub next: Option<Arc<InputUnit>>,
    pub output: Option<Arc<OutputUnit>>,
    pub preload_progress: f32,
    pub ready_to_play: bool,
    pub volume_percent: f32,
    pub output_format: OutputFormat,
    pub end_reason: Option<PlaybackEndReason>,
}

impl EngineShared {
    pub fn new(volume_percent: f32, output_format: OutputFormat) -> Self {
        Self {
            inner: Mutex::new(SharedState {
                volume_percent,
                output_format,
                ..SharedState::default()
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time status suitable for logging or an API response.
    pub fn snapshot(&self) -> EngineStatus {
        self.lock().snapshot()
    }
}

impl SharedState {
    /// Forget the session's units (they are closed by the control thread).
    pub fn clear_playback(&mut self) {
        self.current = None;
        self.next = None;
        self.output = None;
        self.preload_progress = 0.0;
        self.ready_to_play = false;
    }

    pub fn snapshot(&self) -> EngineStatus {
        let source_format = self.current.as_ref().and_then(|c| c.format());
        let spec = self.output.as_ref().map(|o| o.spec());
        let elapsed_ms = self
            .output
            .as_ref()
            .map(|o| (o.amount_played() * 1000.0).round() as u64);
        let duration_ms = self
            .current
            .as_ref()
            .and_then(|c| c.duration())
            .map(|d| (d * 1000.0).round() as u64);

        EngineStatus {
            state: self.state,
            error: self.error.as_ref().map(|e| e.to_string()),
            now_playing: self.current.as_ref().map(|c| c.source().to_string()),
            next: self.next.as_ref().map(|n| n.source().to_string()),
            elapsed_ms,
            duration_ms,
            preload_progress: self.preload_progress,
            ready_to_play: self.ready_to_play,
            volume_percent: self.volume_percent,
            source_rate_hz: source_format.map(|f| f.sample_rate),
            source_channels: source_format.map(|f| f.channels),
            output_rate_hz: spec.map(|s| s.sample_rate),
            output_channels: spec.map(|s| s.channels),
            output_format: spec.map(|s| s.encoding),
            resampling: self.output.as_ref().map(|o| o.is_resampling()),
            buffered_bytes: self.current.as_ref().map(|c| c.fill_level() as u64),
            buffer_capacity_bytes: self.current.as_ref().map(|c| c.buffer_capacity() as u64),
            underrun_frames: self.output.as_ref().map(|o| o.underrun_frames()),
            underrun_events: self.output.as_ref().map(|o| o.underrun_events()),
            end_reason: self.end_reason,
        }
    }
}
