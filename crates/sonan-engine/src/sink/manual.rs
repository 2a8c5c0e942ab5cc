use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sonan_types::OutputFormat;

use crate::error::EngineResult;
use crate::format::{AudioFormat, OutputSpec};
use crate::output::{Renderer, TickReport};

use super::RenderSink;

/// Caller-driven render clock.
///
/// Clones share one clock. Every session opened with `OutputKind::Manual(clock)` attaches
/// its renderer here, and each [`ManualClock::tick`] renders one block of
/// `frames_per_tick` frames. Used by tests and by hosts that pull audio themselves.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    frames_per_tick: usize,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    attached: Mutex<Option<Arc<Renderer>>>,
}

impl ManualClock {
    /// A clock rendering at the source's own rate and channel count.
    pub fn new(frames_per_tick: usize) -> Self {
        Self::with_format(frames_per_tick, None, None)
    }

    /// A clock with a fixed output rate and/or channel count.
    pub fn with_format(frames_per_tick: usize, sample_rate: Option<u32>, channels: Option<u16>) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                frames_per_tick: frames_per_tick.max(1),
                sample_rate,
                channels,
                attached: Mutex::new(None),
            }),
        }
    }

    fn attached(&self) -> MutexGuard<'_, Option<Arc<Renderer>>> {
        self.inner
            .attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frames_per_tick(&self) -> usize {
        self.inner.frames_per_tick
    }

    pub fn is_attached(&self) -> bool {
        self.attached().is_some()
    }

    /// Render one tick. `None` when no session is attached.
    pub fn tick(&self) -> Option<TickReport> {
        self.render().map(|(report, _)| report)
    }

    /// Render one tick and return the bytes the sink would have played.
    pub fn tick_bytes(&self) -> Option<Vec<u8>> {
        self.render().map(|(_, bytes)| bytes)
    }

    /// Render up to `n` ticks; returns how many were rendered.
    pub fn tick_n(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.tick().is_some()).count()
    }

    fn render(&self) -> Option<(TickReport, Vec<u8>)> {
        let renderer = self.attached().clone()?;
        let mut bytes = vec![0u8; self.inner.frames_per_tick * renderer.spec().bytes_per_frame()];
        let report = renderer.render(&mut bytes);
        Some((report, bytes))
    }

    pub(super) fn sink(&self, source: &AudioFormat, encoding: OutputFormat) -> ManualSink {
        ManualSink {
            clock: self.clone(),
            spec: OutputSpec {
                sample_rate: self.inner.sample_rate.unwrap_or(source.sample_rate),
                channels: self.inner.channels.unwrap_or(source.channels),
                encoding,
            },
            renderer: None,
        }
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("frames_per_tick", &self.inner.frames_per_tick)
            .field("sample_rate", &self.inner.sample_rate)
            .field("channels", &self.inner.channels)
            .field("attached", &self.is_attached())
            .finish()
    }
}

pub(super) struct ManualSink {
    clock: ManualClock,
    spec: OutputSpec,
    renderer: Option<Arc<Renderer>>,
}

impl RenderSink for ManualSink {
    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn start(&mut self, renderer: Arc<Renderer>) -> EngineResult<()> {
        *self.clock.attached() = Some(renderer.clone());
        self.renderer = Some(renderer);
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn resume(&mut self) -> EngineResult<()> {
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mine) = self.renderer.take() else {
            return;
        };
        let mut attached = self.clock.attached();
        // A newer session may already own the clock.
        if attached.as_ref().is_some_and(|r| Arc::ptr_eq(r, &mine)) {
            *attached = None;
        }
    }
}
