//! Input unit: one opened source, its decode worker and its decode buffer.
//!
//! The worker thread owns the [`Decoder`] and is the only writer of the unit's
//! [`DecodeBuffer`]. Everything else talks to it through shared flags and a one-slot seek
//! mailbox, so decode ordering stays strictly sequential per source.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use crate::buffer::{calc_buffer_bytes, DecodeBuffer};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{UnitEvent, UnitId};
use crate::format::AudioFormat;
use crate::metadata::ItemMetadata;
use crate::source::{DecodeStep, Decoder, DecoderFactory, Source};
use crate::unit::AudioUnit;

/// How long a parked worker sleeps before re-checking cancellation and the seek mailbox.
const PARK_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on waiting for the worker to apply a seek.
const SEEK_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of an input unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputState {
    Idle,
    Opening,
    Processing,
    EndOfInput,
    Closed,
    Error,
}

/// Coarse fill state of the unit's decode buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    Active,
    Error,
}

struct SeekRequest {
    seconds: f64,
    flush: bool,
    reply: Sender<EngineResult<f64>>,
}

type SeekSlot = Arc<Mutex<Option<SeekRequest>>>;

/// Flags shared between the unit handle and its worker.
struct UnitShared {
    state: Mutex<InputState>,
    cancel: AtomicBool,
    processing: AtomicBool,
    last_progress: AtomicU32,
}

impl UnitShared {
    fn state(&self) -> InputState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to` unless the unit was already closed.
    fn transition(&self, to: InputState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != InputState::Closed {
            *state = to;
        }
    }

    /// Emit a progress notification when `progress` moved by at least `step` since the
    /// last one, or hit either end of the range.
    fn notify_progress(
        &self,
        unit: UnitId,
        progress: f32,
        step: f32,
        events: &Sender<UnitEvent>,
    ) {
        let last_bits = self.last_progress.load(Ordering::Relaxed);
        let last = f32::from_bits(last_bits);
        let crossed = (progress - last).abs() >= step
            || (progress >= 1.0 && last < 1.0)
            || (progress <= 0.0 && last > 0.0);
        if !crossed {
            return;
        }
        if self
            .last_progress
            .compare_exchange(
                last_bits,
                progress.to_bits(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let _ = events.send(UnitEvent::PreloadProgress { unit, progress });
        }
    }
}

/// Everything that exists only once the source is open.
struct OpenedStream {
    buffer: Arc<DecodeBuffer>,
    format: AudioFormat,
    metadata: ItemMetadata,
    frames_count: Option<f64>,
    seeks: SeekSlot,
}

/// A source being decoded into a bounded buffer on a private worker thread.
pub struct InputUnit {
    id: UnitId,
    source: Source,
    buffer_seconds: f64,
    preload_seconds: f64,
    progress_step: f32,
    events: Sender<UnitEvent>,
    shared: Arc<UnitShared>,
    stream: OnceLock<OpenedStream>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InputUnit {
    pub fn new(id: UnitId, source: Source, config: &EngineConfig, events: Sender<UnitEvent>) -> Self {
        Self {
            id,
            source,
            buffer_seconds: config.effective_buffer_seconds(),
            preload_seconds: config.effective_preload_seconds(),
            progress_step: config.progress_step.max(0.0),
            events,
            shared: Arc::new(UnitShared {
                state: Mutex::new(InputState::Idle),
                cancel: AtomicBool::new(false),
                processing: AtomicBool::new(false),
                last_progress: AtomicU32::new(0.0f32.to_bits()),
            }),
            stream: OnceLock::new(),
            worker: Mutex::new(None),
        }
    }

    /// Open the source and start the decode worker.
    ///
    /// Idle → Opening → Processing on success, → Error on failure. Only valid once.
    pub fn open(&self, factory: &dyn DecoderFactory) -> EngineResult<()> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != InputState::Idle {
                return Err(EngineError::configuration(format!(
                    "input unit {} cannot be opened from {:?}",
                    self.id, *state
                )));
            }
            *state = InputState::Opening;
        }

        match self.start(factory) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.transition(InputState::Error);
                tracing::warn!(unit = self.id, url = %self.source, error = %err, "input unit open failed");
                Err(err)
            }
        }
    }

    fn start(&self, factory: &dyn DecoderFactory) -> EngineResult<()> {
        let decoder = factory.open(&self.source)?;
        let format = decoder.format();
        if format.sample_rate == 0 || format.channels == 0 {
            return Err(EngineError::source_open(
                self.source.location(),
                "decoder reported an empty format",
            ));
        }

        let frame = format.bytes_per_frame();
        let bytes_per_second = frame * format.sample_rate as usize;
        let capacity = calc_buffer_bytes(bytes_per_second, frame, self.buffer_seconds);
        let threshold = calc_buffer_bytes(bytes_per_second, frame, self.preload_seconds);
        let buffer = Arc::new(DecodeBuffer::new(capacity, frame, threshold));
        let seeks: SeekSlot = Arc::new(Mutex::new(None));
        let frames_count = decoder.frames_count().filter(|f| f.is_finite() && *f >= 0.0);

        let stream = OpenedStream {
            buffer: buffer.clone(),
            format,
            metadata: decoder.metadata(),
            frames_count,
            seeks: seeks.clone(),
        };
        if self.stream.set(stream).is_err() {
            return Err(EngineError::configuration("input unit already opened"));
        }

        let worker = DecodeWorker {
            unit: self.id,
            decoder,
            buffer,
            seeks,
            shared: self.shared.clone(),
            events: self.events.clone(),
            progress_step: self.progress_step,
        };
        self.shared.transition(InputState::Processing);
        let handle = thread::Builder::new()
            .name(format!("sonan-decode-{}", self.id))
            .spawn(move || worker.run())
            .map_err(|e| EngineError::source_open(self.source.location(), e))?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            unit = self.id,
            url = %self.source,
            rate_hz = format.sample_rate,
            channels = format.channels,
            bits = format.bits_per_sample(),
            buffer_bytes = capacity,
            "input unit opened"
        );
        Ok(())
    }

    /// Reposition the decoder to `seconds`.
    ///
    /// With `flush`, buffered audio is discarded before decoding resumes. Without it, the
    /// buffered audio plays out first and the new position is reported through
    /// [`InputUnit::take_reached_seek`] once the reader gets there. Returns the position
    /// the decoder actually reached.
    pub fn seek(&self, seconds: f64, flush: bool) -> EngineResult<f64> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineError::seek(format!("invalid offset {seconds}")));
        }
        if let Some(duration) = self.duration() {
            if seconds > duration {
                return Err(EngineError::seek(format!(
                    "offset {seconds:.3}s beyond duration {duration:.3}s"
                )));
            }
        }
        let Some(stream) = self.stream.get() else {
            return Err(EngineError::seek("input unit is not open"));
        };
        match self.shared.state() {
            InputState::Processing | InputState::EndOfInput => {}
            other => return Err(EngineError::seek(format!("input unit is {other:?}"))),
        }

        let (reply, answer) = bounded(1);
        {
            let mut slot = stream.seeks.lock().unwrap_or_else(PoisonError::into_inner);
            *slot = Some(SeekRequest {
                seconds,
                flush,
                reply,
            });
        }
        stream.buffer.notify();
        match answer.recv_timeout(SEEK_REPLY_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(EngineError::seek("decoder did not respond to seek")),
        }
    }

    /// Move up to `amount` decoded bytes into `dest`. Sole read path for consumers.
    pub fn shift_bytes(&self, amount: usize, dest: &mut [u8]) -> usize {
        let Some(stream) = self.stream.get() else {
            return 0;
        };
        let n = stream.buffer.shift_bytes(amount, dest);
        self.shared.notify_progress(
            self.id,
            stream.buffer.preload_progress(),
            self.progress_step,
            &self.events,
        );
        n
    }

    /// Source position of the last non-flush seek whose data the reader has reached.
    pub fn take_reached_seek(&self) -> Option<f64> {
        self.stream.get()?.buffer.take_reached_marker()
    }

    /// Stop the worker, wait for it and release the buffer. Idempotent.
    pub fn close(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(stream) = self.stream.get() {
            stream.buffer.close();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(unit = self.id, "decode worker panicked");
            }
            tracing::debug!(unit = self.id, url = %self.source, "input unit closed");
        }
        self.shared.processing.store(false, Ordering::Release);
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = InputState::Closed;
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn state(&self) -> InputState {
        self.shared.state()
    }

    pub fn buffer_state(&self) -> BufferState {
        match self.shared.state() {
            InputState::Error => BufferState::Error,
            _ if self.fill_level() > 0 => BufferState::Active,
            _ => BufferState::Empty,
        }
    }

    /// The decoder signalled end of input and the consumer has drained the buffer.
    pub fn end_of_input(&self) -> bool {
        self.stream
            .get()
            .is_some_and(|stream| stream.buffer.is_drained())
    }

    /// The decoder has finished, whether or not the buffer is drained yet.
    pub fn decoder_finished(&self) -> bool {
        self.stream
            .get()
            .is_some_and(|stream| stream.buffer.is_end_of_input())
    }

    pub fn preload_progress(&self) -> f32 {
        self.stream
            .get()
            .map_or(0.0, |stream| stream.buffer.preload_progress())
    }

    pub fn fill_level(&self) -> usize {
        self.stream.get().map_or(0, |stream| stream.buffer.fill_level())
    }

    pub fn buffer_capacity(&self) -> usize {
        self.stream.get().map_or(0, |stream| stream.buffer.capacity())
    }

    pub fn metadata(&self) -> ItemMetadata {
        self.stream
            .get()
            .map(|stream| stream.metadata.clone())
            .unwrap_or_default()
    }

    /// Total frames of the source, `None` when unknown.
    pub fn frames_count(&self) -> Option<f64> {
        self.stream.get().and_then(|stream| stream.frames_count)
    }

    /// Source length in seconds, `None` when unknown.
    pub fn duration(&self) -> Option<f64> {
        let stream = self.stream.get()?;
        let frames = stream.frames_count?;
        Some(stream.format.frames_to_seconds(frames))
    }
}

impl AudioUnit for InputUnit {
    fn format(&self) -> Option<AudioFormat> {
        self.stream.get().map(|stream| stream.format)
    }

    fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::Acquire)
    }

    fn close(&self) {
        InputUnit::close(self);
    }
}

impl Drop for InputUnit {
    fn drop(&mut self) {
        self.close();
    }
}

struct DecodeWorker {
    unit: UnitId,
    decoder: Box<dyn Decoder>,
    buffer: Arc<DecodeBuffer>,
    seeks: SeekSlot,
    shared: Arc<UnitShared>,
    events: Sender<UnitEvent>,
    progress_step: f32,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0usize;
        let mut finished = false;

        loop {
            if self.shared.cancel.load(Ordering::Acquire) {
                break;
            }

            let request = self
                .seeks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(request) = request {
                let result = self.apply_seek(request.seconds, request.flush);
                if result.is_ok() {
                    pending.clear();
                    offset = 0;
                    finished = false;
                }
                let _ = request.reply.send(result);
                continue;
            }

            if offset < pending.len() {
                offset += self.buffer.write(&pending[offset..]);
                self.report_progress();
                if offset < pending.len() {
                    self.shared.processing.store(false, Ordering::Release);
                    self.buffer.wait_for_space(PARK_INTERVAL);
                }
                continue;
            }

            if finished {
                self.shared.processing.store(false, Ordering::Release);
                self.buffer.wait_for_change(PARK_INTERVAL);
                continue;
            }

            self.shared.processing.store(true, Ordering::Release);
            match self.decoder.decode_next() {
                Ok(DecodeStep::Data(bytes)) => {
                    pending = bytes;
                    offset = 0;
                }
                Ok(DecodeStep::EndOfInput) => {
                    finished = true;
                    self.buffer.mark_end_of_input();
                    self.shared.transition(InputState::EndOfInput);
                    self.report_progress();
                    tracing::debug!(unit = self.unit, "decoder reached end of input");
                    let _ = self.events.send(UnitEvent::EndOfInput { unit: self.unit });
                }
                Err(error) => {
                    self.shared.transition(InputState::Error);
                    tracing::warn!(unit = self.unit, error = %error, "decode failed");
                    let _ = self.events.send(UnitEvent::DecodeFailed {
                        unit: self.unit,
                        error,
                    });
                    break;
                }
            }
        }

        self.shared.processing.store(false, Ordering::Release);
        // Fail any seek that raced with shutdown instead of leaving it to time out.
        self.seeks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn apply_seek(&mut self, seconds: f64, flush: bool) -> EngineResult<f64> {
        let reached = self.decoder.seek(seconds)?;
        if flush {
            self.buffer.reset();
        } else {
            self.buffer.clear_end_of_input();
            self.buffer.push_seek_marker(reached);
        }
        self.shared.transition(InputState::Processing);
        self.report_progress();
        tracing::debug!(unit = self.unit, requested = seconds, reached, flush, "seek applied");
        Ok(reached)
    }

    fn report_progress(&self) {
        self.shared.notify_progress(
            self.unit,
            self.buffer.preload_progress(),
            self.progress_step,
            &self.events,
        );
    }
}
