//! Output unit: the render side of a playback session.
//!
//! The [`Renderer`] is what the sink's real-time callback drives. It:
//! - pulls converted bytes from the [`Converter`] without blocking
//! - fills any shortfall with silence and counts it as an underrun
//! - applies volume
//! - keeps the played-frames counter (frozen while paused)
//!
//! It reports ready-to-play flips, gapless track advances and render exhaustion to the
//! control thread as [`UnitEvent`]s. The [`OutputUnit`] owns the sink and exposes the
//! transport operations the engine needs.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;

use crate::config::EngineConfig;
use crate::converter::Converter;
use crate::error::{EngineError, EngineResult};
use crate::events::{SessionId, UnitEvent, UnitId};
use crate::format::{fill_silence, scale_samples, AudioFormat, OutputSpec};
use crate::input::InputUnit;
use crate::sink::{open_sink, OutputKind, RenderSink};
use crate::unit::AudioUnit;

/// Transport state of an output unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputState {
    Stopped,
    Paused,
    Playing,
}

/// What one render tick produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Frames filled with converted audio.
    pub frames: usize,
    /// Frames filled with silence because data was late.
    pub underrun_frames: usize,
}

/// Render-callback state shared between the sink and the control thread.
pub struct Renderer {
    session: SessionId,
    spec: OutputSpec,
    converter: Mutex<Converter>,
    paused: AtomicBool,
    stopped: AtomicBool,
    gain_bits: AtomicU32,
    played_frames: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
    ready: AtomicBool,
    exhausted: AtomicBool,
    failed: AtomicBool,
    events: Sender<UnitEvent>,
}

impl Renderer {
    fn new(session: SessionId, converter: Converter, gain: f32, events: Sender<UnitEvent>) -> Self {
        Self {
            session,
            spec: converter.spec(),
            converter: Mutex::new(converter),
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            gain_bits: AtomicU32::new(gain.to_bits()),
            played_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            events,
        }
    }

    fn converter(&self) -> MutexGuard<'_, Converter> {
        self.converter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    /// Fill `out` (interleaved bytes in the sink's [`OutputSpec`]) for one tick.
    ///
    /// Never waits for data: anything the converter cannot supply is rendered as silence.
    pub fn render(&self, out: &mut [u8]) -> TickReport {
        if self.paused.load(Ordering::Acquire)
            || self.stopped.load(Ordering::Acquire)
            || self.failed.load(Ordering::Acquire)
        {
            fill_silence(out);
            return TickReport::default();
        }

        let bpf = self.spec.bytes_per_frame();
        let mut conv = self.converter();
        let pull = match conv.pull(out) {
            Ok(pull) => pull,
            Err(error) => {
                drop(conv);
                fill_silence(out);
                if !self.failed.swap(true, Ordering::AcqRel) {
                    let _ = self.events.send(UnitEvent::ConvertFailed {
                        session: self.session,
                        error,
                    });
                }
                return TickReport::default();
            }
        };
        let reached_seek = conv.input().take_reached_seek();
        drop(conv);

        let frames = pull.bytes / bpf;
        match pull.switched {
            Some(switch) => {
                let after = pull.bytes.saturating_sub(switch.offset) / bpf;
                self.played_frames.store(after as u64, Ordering::Release);
                self.exhausted.store(false, Ordering::Release);
                let _ = self.events.send(UnitEvent::TrackAdvanced {
                    session: self.session,
                    from: switch.from,
                    to: switch.to,
                });
            }
            None => {
                self.played_frames
                    .fetch_add(frames as u64, Ordering::AcqRel);
            }
        }
        if let Some(seconds) = reached_seek {
            self.played_frames
                .store(self.seconds_to_frames(seconds), Ordering::Release);
        }

        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        if gain == 0.0 {
            fill_silence(&mut out[..pull.bytes]);
        } else if gain != 1.0 {
            scale_samples(&mut out[..pull.bytes], self.spec.encoding, gain);
        }
        fill_silence(&mut out[pull.bytes..]);

        let total_frames = out.len() / bpf;
        let mut report = TickReport {
            frames,
            underrun_frames: 0,
        };
        if frames < total_frames && !pull.end_of_input {
            report.underrun_frames = total_frames - frames;
            self.underrun_events.fetch_add(1, Ordering::Relaxed);
            self.underrun_frames
                .fetch_add(report.underrun_frames as u64, Ordering::Relaxed);
            self.set_ready(false);
        } else if frames == total_frames && total_frames > 0 {
            self.set_ready(true);
        }

        if pull.end_of_input && !self.exhausted.swap(true, Ordering::AcqRel) {
            let _ = self.events.send(UnitEvent::RenderExhausted {
                session: self.session,
            });
        }
        report
    }

    fn set_ready(&self, ready: bool) {
        if self.ready.swap(ready, Ordering::AcqRel) != ready {
            let _ = self.events.send(UnitEvent::ReadyToPlay {
                session: self.session,
                ready,
            });
        }
    }

    fn seconds_to_frames(&self, seconds: f64) -> u64 {
        if !seconds.is_finite() || seconds <= 0.0 {
            return 0;
        }
        (seconds * f64::from(self.spec.sample_rate)).round() as u64
    }
}

/// Owns the render sink and the converter of one playback session.
pub struct OutputUnit {
    renderer: Arc<Renderer>,
    sink: Mutex<Box<dyn RenderSink>>,
    state: Mutex<OutputState>,
}

impl OutputUnit {
    /// Open the sink selected by `kind`, build the converter for `input` and start the sink.
    ///
    /// The unit starts paused; call [`OutputUnit::resume`] to begin rendering.
    pub fn open(
        session: SessionId,
        kind: &OutputKind,
        input: Arc<InputUnit>,
        config: &EngineConfig,
        gain: f32,
        events: Sender<UnitEvent>,
    ) -> EngineResult<Self> {
        let source_format = input.format().ok_or_else(|| {
            EngineError::configuration("output unit needs an opened input")
        })?;
        let mut sink = open_sink(kind, &source_format, config.output_format)?;
        let spec = sink.spec();
        let converter = Converter::new(input, spec, config.chunk_frames)?;
        let renderer = Arc::new(Renderer::new(session, converter, gain, events));
        sink.start(renderer.clone())?;

        tracing::info!(
            session,
            rate_hz = spec.sample_rate,
            channels = spec.channels,
            format = ?spec.encoding,
            resampling = source_format.sample_rate != spec.sample_rate,
            "output unit opened"
        );
        Ok(Self {
            renderer,
            sink: Mutex::new(sink),
            state: Mutex::new(OutputState::Paused),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sink(&self) -> MutexGuard<'_, Box<dyn RenderSink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> SessionId {
        self.renderer.session
    }

    pub fn state(&self) -> OutputState {
        *self.lock_state()
    }

    pub fn spec(&self) -> OutputSpec {
        self.renderer.spec
    }

    /// Start or continue issuing render ticks. No-op unless paused.
    pub fn resume(&self) -> EngineResult<()> {
        let mut state = self.lock_state();
        if *state != OutputState::Paused {
            return Ok(());
        }
        self.lock_sink().resume()?;
        self.renderer.paused.store(false, Ordering::Release);
        *state = OutputState::Playing;
        Ok(())
    }

    /// Stop issuing render ticks, keeping all resources. No-op unless playing.
    pub fn pause(&self) -> EngineResult<()> {
        let mut state = self.lock_state();
        if *state != OutputState::Playing {
            return Ok(());
        }
        self.renderer.paused.store(true, Ordering::Release);
        self.lock_sink().pause()?;
        *state = OutputState::Paused;
        Ok(())
    }

    /// Halt rendering and release the sink. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        if *state == OutputState::Stopped {
            return;
        }
        self.renderer.stopped.store(true, Ordering::Release);
        self.lock_sink().stop();
        *state = OutputState::Stopped;
        tracing::debug!(session = self.renderer.session, "output unit stopped");
    }

    /// Set the played-time counter to `seconds` without touching converter or input.
    pub fn seek(&self, seconds: f64) {
        self.renderer
            .played_frames
            .store(self.renderer.seconds_to_frames(seconds), Ordering::Release);
    }

    /// Drop staged converter output and restart the played-time counter at `seconds`.
    pub fn flush_to(&self, seconds: f64) {
        let mut conv = self.renderer.converter();
        conv.flush();
        self.seek(seconds);
        self.renderer.exhausted.store(false, Ordering::Release);
    }

    /// Replace the converter's input now, discarding staged audio and any armed next
    /// input. Returns the old input id.
    pub fn switch_input(&self, input: Arc<InputUnit>) -> EngineResult<UnitId> {
        let mut conv = self.renderer.converter();
        conv.attach_next(None);
        let previous = conv.switch_input(input)?;
        self.renderer.played_frames.store(0, Ordering::Release);
        self.renderer.exhausted.store(false, Ordering::Release);
        Ok(previous)
    }

    /// Arm (or clear) the input the converter continues into after the current one.
    ///
    /// Returns the input that was armed before, `None` if the converter already moved into it.
    pub fn attach_next(&self, next: Option<Arc<InputUnit>>) -> Option<Arc<InputUnit>> {
        self.renderer.converter().attach_next(next)
    }

    /// Id of the input the converter is reading from right now.
    pub fn current_input(&self) -> UnitId {
        self.renderer.converter().input().id()
    }

    pub fn is_resampling(&self) -> bool {
        self.renderer.converter().is_resampling()
    }

    /// Set the linear gain (1.0 = unity). Negative values are treated as 0.
    pub fn set_gain(&self, gain: f32) {
        let gain = if gain.is_finite() { gain.max(0.0) } else { 0.0 };
        self.renderer.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.renderer.gain_bits.load(Ordering::Relaxed))
    }

    pub fn played_frames(&self) -> u64 {
        self.renderer.played_frames.load(Ordering::Acquire)
    }

    /// Seconds played on the current track.
    pub fn amount_played(&self) -> f64 {
        self.frames_to_seconds(self.played_frames() as f64)
    }

    pub fn frames_to_seconds(&self, frames: f64) -> f64 {
        self.renderer.spec.format().frames_to_seconds(frames)
    }

    /// The converter satisfied the last full render tick without underrun.
    pub fn ready_to_play(&self) -> bool {
        self.renderer.ready.load(Ordering::Acquire)
    }

    pub fn underrun_frames(&self) -> u64 {
        self.renderer.underrun_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.renderer.underrun_events.load(Ordering::Relaxed)
    }
}

impl AudioUnit for OutputUnit {
    fn format(&self) -> Option<AudioFormat> {
        Some(self.renderer.spec.format())
    }

    fn is_processing(&self) -> bool {
        self.state() == OutputState::Playing
    }

    fn close(&self) {
        self.stop();
    }
}

impl Drop for OutputUnit {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ManualClock;
    use crate::source::{DecoderRegistry, Source};
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::{Duration, Instant};

    fn session(location: &str, clock: &ManualClock) -> (OutputUnit, Arc<InputUnit>, Receiver<UnitEvent>) {
        let (tx, rx) = unbounded();
        let config = EngineConfig::default();
        let input = Arc::new(InputUnit::new(1, Source::new(location), &config, tx.clone()));
        input.open(&DecoderRegistry).unwrap();
        let output = OutputUnit::open(
            9,
            &OutputKind::Manual(clock.clone()),
            input.clone(),
            &config,
            1.0,
            tx,
        )
        .unwrap();
        (output, input, rx)
    }

    fn tick_until_ready(output: &OutputUnit, clock: &ManualClock) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !output.ready_to_play() {
            assert!(Instant::now() < deadline, "never became ready");
            clock.tick();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn starts_paused_and_renders_nothing_until_resumed() {
        let clock = ManualClock::new(256);
        let (output, _input, _rx) = session("tone:440?seconds=5&rate=8000&channels=1", &clock);
        assert_eq!(output.state(), OutputState::Paused);
        assert_eq!(clock.tick(), Some(TickReport::default()));
        assert_eq!(output.played_frames(), 0);

        output.resume().unwrap();
        assert!(output.is_processing());
        tick_until_ready(&output, &clock);
        assert!(output.played_frames() > 0);
    }

    #[test]
    fn pause_freezes_played_frames() {
        let clock = ManualClock::new(256);
        let (output, _input, _rx) = session("tone:440?seconds=5&rate=8000&channels=1", &clock);
        output.resume().unwrap();
        tick_until_ready(&output, &clock);

        output.pause().unwrap();
        output.pause().unwrap();
        let frozen = output.played_frames();
        for _ in 0..10 {
            clock.tick();
        }
        assert_eq!(output.played_frames(), frozen);
        output.resume().unwrap();
        assert_eq!(output.played_frames(), frozen);
        clock.tick();
        assert_eq!(output.played_frames(), frozen + 256);
    }

    #[test]
    fn volume_scales_rendered_samples() {
        let clock = ManualClock::new(64);
        let (output, _input, _rx) = session("tone:440?seconds=5&rate=8000&channels=1", &clock);
        output.set_gain(0.0);
        output.resume().unwrap();
        tick_until_ready(&output, &clock);
        let bytes = clock.tick_bytes().unwrap();
        assert!(bytes.iter().all(|b| *b == 0));
        output.set_gain(-2.0);
        assert_eq!(output.gain(), 0.0);
    }

    #[test]
    fn exhaustion_is_reported_once() {
        let clock = ManualClock::new(512);
        let (output, _input, rx) = session("tone:440?seconds=0.2&rate=8000&channels=1", &clock);
        output.resume().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exhausted = 0;
        while Instant::now() < deadline && exhausted == 0 {
            clock.tick();
            exhausted += rx
                .try_iter()
                .filter(|e| matches!(e, UnitEvent::RenderExhausted { session: 9 }))
                .count();
            std::thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..5 {
            clock.tick();
        }
        exhausted += rx
            .try_iter()
            .filter(|e| matches!(e, UnitEvent::RenderExhausted { .. }))
            .count();
        assert_eq!(exhausted, 1);
        assert_eq!(output.played_frames(), 1_600);
    }

    #[test]
    fn stop_is_idempotent_and_silences_ticks() {
        let clock = ManualClock::new(128);
        let (output, _input, _rx) = session("tone:440?seconds=5&rate=8000&channels=1", &clock);
        output.resume().unwrap();
        output.stop();
        output.stop();
        assert_eq!(output.state(), OutputState::Stopped);
        assert_eq!(clock.tick(), None);
        assert!(output.resume().is_ok());
        assert_eq!(output.state(), OutputState::Stopped);
    }

    #[test]
    fn seek_sets_played_time() {
        let clock = ManualClock::new(128);
        let (output, _input, _rx) = session("tone:440?seconds=5&rate=8000&channels=1", &clock);
        output.seek(2.5);
        assert_eq!(output.played_frames(), 20_000);
        assert_eq!(output.amount_played(), 2.5);
    }
}
