//! Converter: pulls decoded bytes from the current input unit and reshapes them into the
//! render sink's format.
//!
//! Per refill it shifts one block of `chunk_frames` source frames, decodes them to `f32`,
//! resamples when the rates differ, maps channels and encodes to the output encoding.
//! Converted bytes that do not fit the caller's request are staged for the next pull.
//!
//! A second, pre-armed input can be attached; when the current one is drained the converter
//! continues into it inside the same pull, which is what makes track changes gapless.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::events::UnitId;
use crate::format::{read_sample, write_sample, AudioFormat, OutputSpec};
use crate::input::InputUnit;
use crate::resample::StreamResampler;
use crate::unit::AudioUnit;

/// A gapless hand-off that happened during a pull.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Switch {
    /// Byte offset in the pull's destination where the new input's audio starts.
    pub offset: usize,
    pub from: UnitId,
    pub to: UnitId,
}

/// Outcome of one [`Converter::pull`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pull {
    pub bytes: usize,
    /// Input is drained, nothing is armed and nothing is staged.
    pub end_of_input: bool,
    pub switched: Option<Switch>,
}

enum Refill {
    Produced,
    Starved,
    Exhausted,
}

struct PendingSwitch {
    /// Staged bytes that still belong to the previous input.
    remaining: usize,
    from: UnitId,
    to: UnitId,
}

pub struct Converter {
    input: Arc<InputUnit>,
    next: Option<Arc<InputUnit>>,
    in_format: AudioFormat,
    spec: OutputSpec,
    chunk_frames: usize,
    resampler: Option<StreamResampler>,
    raw: Vec<u8>,
    carry: Vec<u8>,
    decoded: Vec<f32>,
    resampled: Vec<f32>,
    encoded: Vec<u8>,
    staged: VecDeque<u8>,
    tail_flushed: bool,
    pending_switch: Option<PendingSwitch>,
}

fn opened_format(unit: &InputUnit) -> EngineResult<AudioFormat> {
    unit.format().ok_or_else(|| {
        EngineError::configuration(format!("input unit {} is not open", unit.id()))
    })
}

fn build_resampler(
    format: &AudioFormat,
    spec: &OutputSpec,
    chunk_frames: usize,
) -> EngineResult<Option<StreamResampler>> {
    if format.sample_rate == spec.sample_rate {
        return Ok(None);
    }
    StreamResampler::new(
        format.sample_rate,
        spec.sample_rate,
        usize::from(format.channels),
        chunk_frames,
    )
    .map(Some)
}

/// Read one output sample for `dst_ch` from an interleaved source frame.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
fn map_channel(frame: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    let get = |ch: usize| frame.get(ch).copied().unwrap_or(0.0);
    match (frame.len(), dst_channels) {
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        (n, _) => get(dst_ch.min(n.saturating_sub(1))),
    }
}

impl Converter {
    pub fn new(input: Arc<InputUnit>, spec: OutputSpec, chunk_frames: usize) -> EngineResult<Self> {
        let in_format = opened_format(&input)?;
        let chunk_frames = chunk_frames.max(1);
        let resampler = build_resampler(&in_format, &spec, chunk_frames)?;
        Ok(Self {
            input,
            next: None,
            in_format,
            spec,
            chunk_frames,
            resampler,
            raw: Vec::new(),
            carry: Vec::new(),
            decoded: Vec::new(),
            resampled: Vec::new(),
            encoded: Vec::new(),
            staged: VecDeque::new(),
            tail_flushed: false,
            pending_switch: None,
        })
    }

    pub fn input(&self) -> &Arc<InputUnit> {
        &self.input
    }

    pub fn next(&self) -> Option<&Arc<InputUnit>> {
        self.next.as_ref()
    }

    pub fn in_format(&self) -> AudioFormat {
        self.in_format
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Arm (or clear) the input that follows the current one; returns the one it replaces.
    pub fn attach_next(&mut self, next: Option<Arc<InputUnit>>) -> Option<Arc<InputUnit>> {
        std::mem::replace(&mut self.next, next)
    }

    /// Fill `dest` with converted bytes; returns how many were written.
    ///
    /// Never blocks: a short count means the decoder has not caught up (underrun) or the
    /// input ended.
    pub fn pull(&mut self, dest: &mut [u8]) -> EngineResult<Pull> {
        let mut out = Pull::default();
        loop {
            let take = self.staged.len().min(dest.len() - out.bytes);
            if let Some(ps) = self.pending_switch.as_mut() {
                if ps.remaining <= take {
                    out.switched = Some(Switch {
                        offset: out.bytes + ps.remaining,
                        from: ps.from,
                        to: ps.to,
                    });
                    self.pending_switch = None;
                } else {
                    ps.remaining -= take;
                }
            }
            for (slot, byte) in dest[out.bytes..out.bytes + take]
                .iter_mut()
                .zip(self.staged.drain(..take))
            {
                *slot = byte;
            }
            out.bytes += take;
            if out.bytes == dest.len() {
                break;
            }

            match self.refill()? {
                Refill::Produced => continue,
                Refill::Starved => break,
                Refill::Exhausted => {
                    out.end_of_input = self.staged.is_empty();
                    if !out.end_of_input {
                        continue;
                    }
                    break;
                }
            }
        }
        Ok(out)
    }

    fn refill(&mut self) -> EngineResult<Refill> {
        let bpf = self.in_format.bytes_per_frame();
        let want = self.chunk_frames * bpf;
        self.raw.resize(want, 0);
        let n = self.input.shift_bytes(want, &mut self.raw);
        self.carry.extend_from_slice(&self.raw[..n]);

        let whole = self.carry.len() / bpf * bpf;
        if whole > 0 {
            self.decoded.clear();
            let sample_bytes = self.in_format.encoding.bytes();
            for sample in self.carry[..whole].chunks_exact(sample_bytes) {
                self.decoded.push(read_sample(
                    sample,
                    self.in_format.encoding,
                    self.in_format.byte_order,
                ));
            }
            self.carry.drain(..whole);
            match self.resampler.as_mut() {
                Some(rs) => {
                    self.resampled.clear();
                    rs.process(&self.decoded, &mut self.resampled)?;
                    let samples = std::mem::take(&mut self.resampled);
                    self.stage(&samples);
                    self.resampled = samples;
                }
                None => {
                    let samples = std::mem::take(&mut self.decoded);
                    self.stage(&samples);
                    self.decoded = samples;
                }
            }
            return Ok(Refill::Produced);
        }

        if !self.input.end_of_input() {
            return Ok(Refill::Starved);
        }

        if let Some(next) = self.next.take() {
            return self.advance(next).map(|()| Refill::Produced);
        }

        if !self.tail_flushed {
            self.tail_flushed = true;
            let before = self.staged.len();
            self.flush_resampler_tail()?;
            if self.staged.len() > before {
                return Ok(Refill::Produced);
            }
        }
        Ok(Refill::Exhausted)
    }

    /// Continue into `next` after the current input drained.
    fn advance(&mut self, next: Arc<InputUnit>) -> EngineResult<()> {
        let format = opened_format(&next)?;
        if format != self.in_format {
            self.flush_resampler_tail()?;
            self.renegotiate(format)?;
        }
        let from = self.input.id();
        let to = next.id();
        self.pending_switch = Some(PendingSwitch {
            remaining: self.staged.len(),
            from,
            to,
        });
        self.input = next;
        self.carry.clear();
        self.tail_flushed = false;
        tracing::debug!(from, to, "converter advanced to next input");
        Ok(())
    }

    /// Replace the input immediately, dropping everything staged from the old one.
    ///
    /// Returns the id of the replaced input.
    pub fn switch_input(&mut self, input: Arc<InputUnit>) -> EngineResult<UnitId> {
        let format = opened_format(&input)?;
        let previous = self.input.id();
        self.flush();
        if format != self.in_format {
            self.rebuild(format)?;
        }
        self.input = input;
        Ok(previous)
    }

    /// Change the source format. Only legal between tracks, i.e. once the current input is
    /// drained; mid-stream it is a configuration error.
    pub fn renegotiate(&mut self, format: AudioFormat) -> EngineResult<()> {
        if !self.input.end_of_input() {
            return Err(EngineError::configuration(format!(
                "format change to {} Hz / {} ch while input {} still has data",
                format.sample_rate,
                format.channels,
                self.input.id()
            )));
        }
        self.rebuild(format)
    }

    fn rebuild(&mut self, format: AudioFormat) -> EngineResult<()> {
        self.resampler = build_resampler(&format, &self.spec, self.chunk_frames)?;
        tracing::debug!(
            rate_hz = format.sample_rate,
            channels = format.channels,
            resampling = self.resampler.is_some(),
            "converter renegotiated"
        );
        self.in_format = format;
        self.carry.clear();
        Ok(())
    }

    /// Drop staged output and resampler state (flushed seek or switch).
    pub fn flush(&mut self) {
        self.staged.clear();
        self.carry.clear();
        self.pending_switch = None;
        self.tail_flushed = false;
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
    }

    fn flush_resampler_tail(&mut self) -> EngineResult<()> {
        if let Some(rs) = self.resampler.as_mut() {
            self.resampled.clear();
            rs.finish(&mut self.resampled)?;
            let samples = std::mem::take(&mut self.resampled);
            self.stage(&samples);
            self.resampled = samples;
        }
        Ok(())
    }

    fn stage(&mut self, samples: &[f32]) {
        let src_channels = usize::from(self.in_format.channels.max(1));
        let dst_channels = usize::from(self.spec.channels.max(1));
        self.encoded.clear();
        for frame in samples.chunks_exact(src_channels) {
            for ch in 0..dst_channels {
                write_sample(
                    map_channel(frame, dst_channels, ch),
                    self.spec.encoding,
                    &mut self.encoded,
                );
            }
        }
        self.staged.extend(self.encoded.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::source::{DecoderRegistry, Source};
    use crossbeam_channel::unbounded;
    use sonan_types::OutputFormat;
    use std::time::{Duration, Instant};

    fn unit(id: UnitId, location: &str) -> Arc<InputUnit> {
        let (tx, _rx) = unbounded();
        let unit = InputUnit::new(id, Source::new(location), &EngineConfig::default(), tx);
        unit.open(&DecoderRegistry).unwrap();
        Arc::new(unit)
    }

    fn spec(rate: u32, channels: u16) -> OutputSpec {
        OutputSpec {
            sample_rate: rate,
            channels,
            encoding: OutputFormat::F32,
        }
    }

    /// Pull until end of input; returns total bytes and every switch seen (with absolute
    /// byte offsets).
    fn drain(conv: &mut Converter) -> (usize, Vec<Switch>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut dest = vec![0u8; 1000];
        let mut total = 0;
        let mut switches = Vec::new();
        while Instant::now() < deadline {
            let pull = conv.pull(&mut dest).unwrap();
            if let Some(mut sw) = pull.switched {
                sw.offset += total;
                switches.push(sw);
            }
            total += pull.bytes;
            if pull.end_of_input {
                return (total, switches);
            }
            if pull.bytes == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        panic!("converter never reached end of input");
    }

    #[test]
    fn maps_mono_to_stereo_and_encodes() {
        let a = unit(1, "tone:440?seconds=0.25&rate=8000&channels=1");
        let mut conv = Converter::new(a, spec(8_000, 2), 256).unwrap();
        assert!(!conv.is_resampling());
        let (total, switches) = drain(&mut conv);
        assert_eq!(total, 2_000 * 2 * 4);
        assert!(switches.is_empty());
    }

    #[test]
    fn continues_into_next_input_without_gap() {
        let a = unit(1, "tone:440?seconds=0.1&rate=8000&channels=2");
        let b = unit(2, "tone:660?seconds=0.2&rate=8000&channels=2");
        let mut conv = Converter::new(a, spec(8_000, 2), 128).unwrap();
        conv.attach_next(Some(b));
        let (total, switches) = drain(&mut conv);
        assert_eq!(total, (800 + 1_600) * 2 * 4);
        assert_eq!(
            switches,
            vec![Switch {
                offset: 800 * 2 * 4,
                from: 1,
                to: 2
            }]
        );
        assert_eq!(conv.input().id(), 2);
    }

    #[test]
    fn resamples_when_rates_differ() {
        let a = unit(1, "tone:440?seconds=0.5&rate=24000&channels=1");
        let mut conv = Converter::new(a, spec(48_000, 1), 512).unwrap();
        assert!(conv.is_resampling());
        let (total, _) = drain(&mut conv);
        let frames = total / 4;
        assert!(frames > 23_000 && frames <= 24_200, "got {frames} frames");
    }

    #[test]
    fn renegotiate_mid_stream_is_a_configuration_error() {
        let a = unit(1, "tone:440?seconds=10&rate=8000&channels=1");
        let mut conv = Converter::new(a, spec(8_000, 1), 256).unwrap();
        let other = AudioFormat::new(
            44_100,
            2,
            crate::format::SampleEncoding::Int16,
            crate::format::ByteOrder::Little,
        );
        assert!(matches!(
            conv.renegotiate(other),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn switch_input_discards_staged_output() {
        let a = unit(1, "tone:440?seconds=10&rate=8000&channels=1");
        let b = unit(2, "tone:880?seconds=10&rate=8000&channels=1");
        let mut conv = Converter::new(a, spec(8_000, 1), 256).unwrap();
        let mut dest = vec![0u8; 10];
        let deadline = Instant::now() + Duration::from_secs(5);
        while conv.staged_len() == 0 && Instant::now() < deadline {
            conv.pull(&mut dest).unwrap();
        }
        assert!(conv.staged_len() > 0);
        assert_eq!(conv.switch_input(b).unwrap(), 1);
        assert_eq!(conv.staged_len(), 0);
        assert_eq!(conv.input().id(), 2);
    }
}
