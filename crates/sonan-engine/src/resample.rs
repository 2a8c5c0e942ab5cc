//! Streaming sample-rate conversion.
//!
//! Wraps Rubato's asynchronous sinc resampler behind a push interface: callers feed any
//! number of interleaved `f32` samples and receive whatever output whole input chunks
//! produce. The remainder is held back until more input arrives or [`StreamResampler::finish`]
//! flushes it as a partial chunk at end of track.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    calculate_cutoff, Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::error::{EngineError, EngineResult};

pub struct StreamResampler {
    resampler: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    pending: Vec<f32>,
    scratch: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> EngineResult<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(EngineError::configuration(format!(
                "invalid resampler setup {src_rate} Hz -> {dst_rate} Hz, {channels} channels"
            )));
        }
        let f_ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| EngineError::configuration(format!("resampler init error: {e}")))?;

        let scratch = vec![0.0f32; resampler.output_frames_max() * channels];
        tracing::debug!(src_rate, dst_rate, channels, chunk_frames, "resampler created");

        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            pending: Vec::with_capacity(chunk_frames * channels),
            scratch,
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Queue `samples` and append the output of every completed input chunk to `out`.
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) -> EngineResult<()> {
        self.pending.extend_from_slice(samples);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk = consumed..consumed + chunk_samples;
            let produced = Self::run(
                &mut self.resampler,
                &mut self.indexing,
                &self.pending[chunk],
                self.channels,
                self.chunk_frames,
                None,
                &mut self.scratch,
            )?;
            out.extend_from_slice(&self.scratch[..produced * self.channels]);
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Flush held-back input as a final partial chunk.
    pub fn finish(&mut self, out: &mut Vec<f32>) -> EngineResult<()> {
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            self.pending.clear();
            return Ok(());
        }
        let produced = Self::run(
            &mut self.resampler,
            &mut self.indexing,
            &self.pending[..frames * self.channels],
            self.channels,
            frames,
            Some(frames),
            &mut self.scratch,
        )?;
        out.extend_from_slice(&self.scratch[..produced * self.channels]);
        self.pending.clear();
        Ok(())
    }

    /// Drop held-back input and the filter state (after a seek or flush).
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
    }

    fn run(
        resampler: &mut Async<f32>,
        indexing: &mut Indexing,
        input: &[f32],
        channels: usize,
        frames: usize,
        partial_len: Option<usize>,
        scratch: &mut [f32],
    ) -> EngineResult<usize> {
        let input_adapter = InterleavedSlice::new(input, channels, frames)
            .map_err(|e| EngineError::decode(format!("interleaved slice (input) error: {e}")))?;
        let out_frames = scratch.len() / channels;
        let mut output_adapter = InterleavedSlice::new_mut(scratch, channels, out_frames)
            .map_err(|e| EngineError::decode(format!("interleaved slice (output) error: {e}")))?;

        indexing.input_offset = 0;
        indexing.output_offset = 0;
        indexing.partial_len = partial_len;

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&*indexing))
            .map_err(|e| EngineError::decode(format!("resampler process error: {e}")))?;
        Ok(nbr_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_rates() {
        assert!(StreamResampler::new(0, 48_000, 2, 1024).is_err());
        assert!(StreamResampler::new(44_100, 48_000, 0, 1024).is_err());
    }

    #[test]
    fn holds_back_partial_chunks_until_finish() {
        let mut rs = StreamResampler::new(44_100, 48_000, 2, 256).unwrap();
        let mut out = Vec::new();
        rs.process(&vec![0.0; 100 * 2], &mut out).unwrap();
        assert!(out.is_empty());
        rs.finish(&mut out).unwrap();
        assert_eq!(out.len() % 2, 0);
    }

    #[test]
    fn output_length_tracks_ratio() {
        let mut rs = StreamResampler::new(24_000, 48_000, 1, 512).unwrap();
        let mut out = Vec::new();
        let input: Vec<f32> = (0..24_000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        rs.process(&input, &mut out).unwrap();
        rs.finish(&mut out).unwrap();
        // Filter delay trims the head; the length is still close to 2x.
        assert!(out.len() > 46_000 && out.len() <= 48_200, "got {}", out.len());
    }
}
