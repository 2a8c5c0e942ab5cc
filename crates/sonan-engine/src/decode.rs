//! Symphonia-backed decoder adapter.
//!
//! Probes the container, picks the default track and decodes packets into interleaved
//! little-endian `f32` bytes, one packet per [`Decoder::decode_next`] call.

use std::fs::File;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::error::{EngineError, EngineResult};
use crate::format::{AudioFormat, ByteOrder, SampleEncoding};
use crate::metadata::ItemMetadata;
use crate::source::{DecodeStep, Decoder, Source};

/// Consecutive corrupt packets tolerated before the source is declared broken.
const MAX_CONSECUTIVE_DECODE_ERRORS: usize = 16;

pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    codec_params: CodecParameters,
    track_id: u32,
    format: AudioFormat,
    metadata: ItemMetadata,
    sample_buf: Option<SampleBuffer<f32>>,
    consecutive_errors: usize,
}

impl SymphoniaDecoder {
    /// Open a local file source (plain path or `file://` URL).
    pub fn open(source: &Source) -> EngineResult<Self> {
        let path = source
            .file_path()
            .ok_or_else(|| EngineError::source_open(source.location(), "unsupported scheme"))?;
        let file = File::open(&path).map_err(|e| EngineError::source_open(source.location(), e))?;

        let mut hint = Hint::new();
        if let Some(ext) = source.extension() {
            hint.with_extension(&ext);
        }

        Self::from_media_source(Box::new(file), hint)
            .map_err(|e| EngineError::source_open(source.location(), e))
    }

    /// Probe an arbitrary Symphonia [`MediaSource`] (seekable or not).
    pub fn from_media_source(source: Box<dyn MediaSource>, hint: Hint) -> EngineResult<Self> {
        let mss = MediaSourceStream::new(source, Default::default());
        let mut probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let mut metadata = probed
            .format
            .metadata()
            .current()
            .map(ItemMetadata::from_revision)
            .unwrap_or_default();
        if metadata.is_empty() {
            if let Some(meta) = probed.metadata.get() {
                if let Some(rev) = meta.current() {
                    metadata = ItemMetadata::from_revision(rev);
                }
            }
        }

        let reader = probed.format;
        let track = reader
            .default_track()
            .ok_or_else(|| EngineError::decode("no default audio track"))?;
        let codec_params = track.codec_params.clone();
        let track_id = track.id;

        let channels = codec_params
            .channels
            .ok_or_else(|| EngineError::decode("unknown channel layout"))?
            .count();
        let rate = codec_params
            .sample_rate
            .ok_or_else(|| EngineError::decode("unknown sample rate"))?;
        let channels = u16::try_from(channels)
            .map_err(|_| EngineError::decode(format!("unsupported channel count {channels}")))?;

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        tracing::debug!(
            rate_hz = rate,
            channels,
            codec = ?codec_params.codec,
            frames = ?codec_params.n_frames,
            "symphonia source probed"
        );

        Ok(Self {
            reader,
            decoder,
            codec_params,
            track_id,
            format: AudioFormat::new(rate, channels, SampleEncoding::Float32, ByteOrder::Little),
            metadata,
            sample_buf: None,
            consecutive_errors: 0,
        })
    }
}

impl Decoder for SymphoniaDecoder {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn decode_next(&mut self) -> EngineResult<DecodeStep> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(DecodeStep::EndOfInput);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(DecodeStep::EndOfInput),
                Err(e) => return Err(EngineError::decode(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(msg)) => {
                    self.consecutive_errors += 1;
                    tracing::warn!(error = msg, "skipping corrupt packet");
                    if self.consecutive_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(EngineError::decode(format!(
                            "too many corrupt packets: {msg}"
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(EngineError::decode(e)),
            };
            self.consecutive_errors = 0;

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let spec = *decoded.spec();
            let needs_new = self
                .sample_buf
                .as_ref()
                .map(|b| b.capacity() < frames * spec.channels.count())
                .unwrap_or(true);
            if needs_new {
                self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let Some(buf) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let mut bytes = Vec::with_capacity(buf.samples().len() * 4);
            for sample in buf.samples() {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            return Ok(DecodeStep::Data(bytes));
        }
    }

    fn seek(&mut self, seconds: f64) -> EngineResult<f64> {
        let secs = seconds.max(0.0);
        let whole = secs.trunc() as u64;
        let time = Time::new(whole, secs - whole as f64);
        let seeked = self
            .reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(EngineError::seek)?;
        self.decoder.reset();

        let reached = match self.codec_params.time_base {
            Some(tb) => {
                let t = tb.calc_time(seeked.actual_ts);
                t.seconds as f64 + t.frac
            }
            None => secs,
        };
        Ok(reached)
    }

    fn metadata(&self) -> ItemMetadata {
        self.metadata.clone()
    }

    fn frames_count(&self) -> Option<f64> {
        self.codec_params.n_frames.map(|n| n as f64)
    }
}
