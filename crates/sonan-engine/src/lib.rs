//! Streaming audio playback engine.
//!
//! Sources are decoded by per-source input units into bounded buffers, converted to the
//! render sink's format, and rendered by an output unit. [`Engine`] sequences it all:
//! play, pause, seek, gapless continuation into a next source, and error capture.

pub mod buffer;
pub mod config;
pub mod converter;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod format;
pub mod input;
pub mod metadata;
pub mod output;
pub mod resample;
pub mod sink;
pub mod source;
pub mod status;
pub mod tone;
pub mod unit;

pub use config::EngineConfig;
pub use engine::{Engine, NextSourceProvider};
pub use error::{EngineError, EngineResult};
pub use events::EngineEvent;
pub use metadata::{ItemMetadata, TagValue};
pub use sink::{ManualClock, OutputKind};
pub use source::{Decoder, DecoderFactory, DecoderRegistry, Source};
pub use sonan_types::{EngineStatus, OutputFormat, PlaybackEndReason, PlaybackState};
