//! Playable sources and the decoder adapter contract.
//!
//! A [`Source`] is an opaque location; a [`DecoderFactory`] resolves it into a
//! [`Decoder`] that produces interleaved PCM bytes on demand. The built-in
//! [`DecoderRegistry`] handles local files (via Symphonia) and generated test tones.

use std::fmt;
use std::path::PathBuf;

use crate::error::EngineResult;
use crate::format::AudioFormat;
use crate::metadata::ItemMetadata;

/// Location of a playable item (a path, `file://` URL or `tone:` spec).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    location: String,
}

impl Source {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// URL scheme (`file`, `tone`, ...) if the location carries one.
    ///
    /// Single-letter prefixes are treated as Windows drive letters, not schemes.
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.location.split_once(':')?;
        if scheme.len() < 2
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return None;
        }
        Some(scheme)
    }

    /// Local filesystem path for plain paths and `file://` URLs.
    pub fn file_path(&self) -> Option<PathBuf> {
        match self.scheme() {
            None => Some(PathBuf::from(&self.location)),
            Some(s) if s.eq_ignore_ascii_case("file") => {
                let rest = &self.location[s.len() + 1..];
                let rest = rest.strip_prefix("//").unwrap_or(rest);
                Some(PathBuf::from(rest))
            }
            Some(_) => None,
        }
    }

    /// Lowercased file extension, used as a container hint.
    pub fn extension(&self) -> Option<String> {
        let tail = self.location.split(['?', '#']).next().unwrap_or(&self.location);
        let file = tail.rsplit(['/', '\\']).next().unwrap_or(tail);
        let mut parts = file.rsplit('.');
        let ext = parts.next()?;
        if parts.next().is_some() && !ext.is_empty() {
            Some(ext.to_ascii_lowercase())
        } else {
            None
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

impl From<&str> for Source {
    fn from(value: &str) -> Self {
        Source::new(value)
    }
}

impl From<String> for Source {
    fn from(value: String) -> Self {
        Source::new(value)
    }
}

/// Result of one decode step.
#[derive(Debug, PartialEq)]
pub enum DecodeStep {
    /// Interleaved bytes in the decoder's [`AudioFormat`]. May be empty.
    Data(Vec<u8>),
    /// The source has no more audio.
    EndOfInput,
}

/// Decoder adapter over a single opened source.
///
/// Implementations mutate an internal decode cursor; they are driven from one worker
/// thread at a time.
pub trait Decoder: Send {
    /// PCM format of the bytes returned by [`Decoder::decode_next`].
    fn format(&self) -> AudioFormat;

    /// Decode the next chunk.
    fn decode_next(&mut self) -> EngineResult<DecodeStep>;

    /// Reposition to `seconds`; returns the position actually reached.
    fn seek(&mut self, seconds: f64) -> EngineResult<f64>;

    /// Tag snapshot captured at open time.
    fn metadata(&self) -> ItemMetadata;

    /// Total frames, `None` when unknown (e.g. streams without a header count).
    fn frames_count(&self) -> Option<f64>;
}

/// Opens decoders for sources.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, source: &Source) -> EngineResult<Box<dyn Decoder>>;
}

/// Built-in decoder selection: `tone:` specs use the generated decoder, everything else is
/// handed to Symphonia as a local file.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecoderRegistry;

impl DecoderFactory for DecoderRegistry {
    fn open(&self, source: &Source) -> EngineResult<Box<dyn Decoder>> {
        match source.scheme() {
            Some(s) if s.eq_ignore_ascii_case("tone") => {
                Ok(Box::new(crate::tone::ToneDecoder::from_source(source)?))
            }
            _ => Ok(Box::new(crate::decode::SymphoniaDecoder::open(source)?)),
        }
    }
}
