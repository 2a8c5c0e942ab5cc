//! Render sinks: whatever issues render ticks against a [`Renderer`].
//!
//! The sink to use is picked per session with an [`OutputKind`] value:
//! - [`OutputKind::Device`]: a CPAL output stream on a dedicated thread
//! - [`OutputKind::Null`]: a real-time paced thread that discards the audio
//! - [`OutputKind::Manual`]: ticks issued by the caller through a [`ManualClock`]

mod device;
mod manual;
mod null;

use std::sync::Arc;

use sonan_types::OutputFormat;

use crate::error::EngineResult;
use crate::format::{AudioFormat, OutputSpec};
use crate::output::Renderer;

pub use device::DeviceSink;
pub use manual::ManualClock;
pub use null::NullSink;

/// Device-side half of an output unit.
pub trait RenderSink: Send {
    /// Format the sink consumes. Fixed once the sink is open.
    fn spec(&self) -> OutputSpec;

    /// Begin issuing render ticks against `renderer`.
    fn start(&mut self, renderer: Arc<Renderer>) -> EngineResult<()>;

    fn pause(&mut self) -> EngineResult<()>;

    fn resume(&mut self) -> EngineResult<()>;

    /// Stop ticking and release device resources. Idempotent.
    fn stop(&mut self);
}

/// Which render sink a session uses.
#[derive(Clone, Debug)]
pub enum OutputKind {
    /// A CPAL output device, by name substring or the host default.
    Device { name: Option<String> },
    /// Paced like a device but discards audio. Rate and channels default to the source's.
    Null {
        sample_rate: Option<u32>,
        channels: Option<u16>,
    },
    /// Ticks are driven by the caller.
    Manual(ManualClock),
}

impl Default for OutputKind {
    fn default() -> Self {
        OutputKind::Device { name: None }
    }
}

/// Build the sink for `kind`, negotiating its format against the source.
pub fn open_sink(
    kind: &OutputKind,
    source: &AudioFormat,
    encoding: OutputFormat,
) -> EngineResult<Box<dyn RenderSink>> {
    match kind {
        OutputKind::Device { name } => Ok(Box::new(DeviceSink::open(name.clone(), source, encoding)?)),
        OutputKind::Null {
            sample_rate,
            channels,
        } => {
            let spec = OutputSpec {
                sample_rate: sample_rate.unwrap_or(source.sample_rate),
                channels: channels.unwrap_or(source.channels),
                encoding,
            };
            Ok(Box::new(NullSink::new(spec)))
        }
        OutputKind::Manual(clock) => Ok(Box::new(clock.sink(source, encoding))),
    }
}
