//! Generated sine-tone decoder.
//!
//! Sources of the form `tone:<freq>?seconds=<s>&rate=<hz>&channels=<n>&amplitude=<a>`
//! decode to deterministic 16-bit little-endian PCM. Used by the CLI for device checks and
//! by tests as a fixture with a known length and format.

use std::f32::consts::TAU;

use crate::error::{EngineError, EngineResult};
use crate::format::{AudioFormat, ByteOrder, SampleEncoding};
use crate::metadata::ItemMetadata;
use crate::source::{DecodeStep, Decoder, Source};

const FRAMES_PER_CHUNK: u64 = 1024;

/// Parameters of a generated tone.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub amplitude: f32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            frequency_hz: 440.0,
            seconds: 10.0,
            sample_rate: 44_100,
            channels: 2,
            amplitude: 0.4,
        }
    }
}

impl ToneSpec {
    /// Parse a `tone:` location. Missing query keys keep their defaults.
    pub fn parse(location: &str) -> Result<Self, String> {
        let rest = location
            .split_once(':')
            .map(|(_, rest)| rest)
            .ok_or_else(|| "missing tone: prefix".to_string())?;
        let rest = rest.trim_start_matches('/');
        let (freq, query) = match rest.split_once('?') {
            Some((freq, query)) => (freq, Some(query)),
            None => (rest, None),
        };

        let mut spec = ToneSpec::default();
        if !freq.is_empty() {
            spec.frequency_hz = freq
                .parse()
                .map_err(|_| format!("invalid frequency {freq:?}"))?;
        }
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("invalid parameter {pair:?}"))?;
            let bad = || format!("invalid value for {key}: {value:?}");
            match key {
                "seconds" => spec.seconds = value.parse().map_err(|_| bad())?,
                "rate" => spec.sample_rate = value.parse().map_err(|_| bad())?,
                "channels" => spec.channels = value.parse().map_err(|_| bad())?,
                "amplitude" => spec.amplitude = value.parse().map_err(|_| bad())?,
                other => return Err(format!("unknown parameter {other:?}")),
            }
        }

        if !(spec.frequency_hz.is_finite() && spec.frequency_hz > 0.0) {
            return Err("frequency must be positive".to_string());
        }
        if !(spec.seconds.is_finite() && spec.seconds >= 0.0) {
            return Err("seconds must be non-negative".to_string());
        }
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err("rate and channels must be non-zero".to_string());
        }
        Ok(spec)
    }

    pub fn total_frames(&self) -> u64 {
        (self.seconds * f64::from(self.sample_rate)).round() as u64
    }
}

pub struct ToneDecoder {
    spec: ToneSpec,
    format: AudioFormat,
    total_frames: u64,
    position: u64,
}

impl ToneDecoder {
    pub fn new(spec: ToneSpec) -> Self {
        Self {
            spec,
            format: AudioFormat::new(
                spec.sample_rate,
                spec.channels,
                SampleEncoding::Int16,
                ByteOrder::Little,
            ),
            total_frames: spec.total_frames(),
            position: 0,
        }
    }

    pub fn from_source(source: &Source) -> EngineResult<Self> {
        let spec = ToneSpec::parse(source.location())
            .map_err(|reason| EngineError::source_open(source.location(), reason))?;
        Ok(Self::new(spec))
    }

    fn sample_at(&self, frame: u64) -> i16 {
        let t = frame as f64 / f64::from(self.spec.sample_rate);
        let phase = (t * f64::from(self.spec.frequency_hz)).fract() as f32;
        let v = (phase * TAU).sin() * self.spec.amplitude.clamp(0.0, 1.0);
        (v * 32_767.0) as i16
    }
}

impl Decoder for ToneDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn decode_next(&mut self) -> EngineResult<DecodeStep> {
        if self.position >= self.total_frames {
            return Ok(DecodeStep::EndOfInput);
        }
        let frames = FRAMES_PER_CHUNK.min(self.total_frames - self.position);
        let mut bytes = Vec::with_capacity(frames as usize * self.format.bytes_per_frame());
        for frame in self.position..self.position + frames {
            let sample = self.sample_at(frame).to_le_bytes();
            for _ in 0..self.spec.channels {
                bytes.extend_from_slice(&sample);
            }
        }
        self.position += frames;
        Ok(DecodeStep::Data(bytes))
    }

    fn seek(&mut self, seconds: f64) -> EngineResult<f64> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineError::seek(format!("invalid offset {seconds}")));
        }
        let frame = self.format.seconds_to_frames(seconds);
        if frame > self.total_frames {
            return Err(EngineError::seek(format!(
                "offset {seconds}s beyond end ({}s)",
                self.spec.seconds
            )));
        }
        self.position = frame;
        Ok(self.format.frames_to_seconds(frame as f64))
    }

    fn metadata(&self) -> ItemMetadata {
        let mut meta = ItemMetadata::new();
        meta.insert_text("TrackTitle", format!("Tone {} Hz", self.spec.frequency_hz));
        meta
    }

    fn frames_count(&self) -> Option<f64> {
        Some(self.total_frames as f64)
    }
}
