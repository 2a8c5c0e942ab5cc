//! Top-level playback state machine.
//!
//! All transitions run on one control thread ("sonan-engine"). Public calls are queued as
//! commands and wait for their reply, so a call returns once its transition is applied.
//! Units report back over a channel; the control thread consumes both queues with
//! `select!`, which keeps it the single writer of engine state.
//!
//! Observers subscribe to [`EngineEvent`]s. The one synchronous observer hook is the
//! [`NextSourceProvider`], asked on the control thread when the current source nears its
//! end and nothing is armed behind it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use sonan_types::{EngineStatus, OutputFormat, PlaybackEndReason, PlaybackState};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventHub, SessionId, UnitEvent, UnitId};
use crate::input::InputUnit;
use crate::metadata::ItemMetadata;
use crate::output::OutputUnit;
use crate::sink::OutputKind;
use crate::source::{DecoderFactory, DecoderRegistry, Source};
use crate::status::EngineShared;

/// Supplies the source to continue with when the current one is about to end.
///
/// Runs on the engine's control thread; it must not call back into the [`Engine`].
pub trait NextSourceProvider: Send {
    fn next_source(&mut self, finished: Option<&Source>) -> Option<Source>;
}

impl<F> NextSourceProvider for F
where
    F: FnMut(Option<&Source>) -> Option<Source> + Send,
{
    fn next_source(&mut self, finished: Option<&Source>) -> Option<Source> {
        self(finished)
    }
}

type Reply<T> = Sender<EngineResult<T>>;

enum Command {
    Play {
        source: Source,
        output: Option<OutputKind>,
        reply: Reply<()>,
    },
    Pause(Reply<()>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    Seek {
        seconds: f64,
        flush: bool,
        reply: Reply<()>,
    },
    SetNext {
        source: Source,
        flush: bool,
        reply: Reply<()>,
    },
    SetVolume(f32, Reply<()>),
    SetOutputFormat(OutputFormat, Reply<()>),
    SetProvider(Option<Box<dyn NextSourceProvider>>, Reply<()>),
    Shutdown,
}

/// Streaming playback engine.
///
/// Owns at most one playing session: the current input unit, an optional pre-armed next
/// input unit for gapless continuation, and the output unit rendering them.
pub struct Engine {
    cmd_tx: Sender<Command>,
    shared: Arc<EngineShared>,
    hub: Arc<EventHub>,
    join: Option<JoinHandle<()>>,
}

impl Engine {
    /// Engine using the built-in decoder registry (symphonia formats and `tone:` sources).
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_factory(config, Arc::new(DecoderRegistry))
    }

    pub fn with_factory(config: EngineConfig, factory: Arc<dyn DecoderFactory>) -> EngineResult<Self> {
        let volume = sanitize_volume(config.volume_percent);
        let shared = Arc::new(EngineShared::new(volume, config.output_format));
        let hub = Arc::new(EventHub::new());
        let (cmd_tx, cmd_rx) = unbounded();
        let (unit_tx, unit_rx) = unbounded();

        let control = Control {
            config,
            factory,
            shared: shared.clone(),
            hub: hub.clone(),
            unit_tx,
            provider: None,
            session: None,
            next_unit_id: 1,
            next_session_id: 1,
        };
        let join = thread::Builder::new()
            .name("sonan-engine".to_string())
            .spawn(move || control.run(cmd_rx, unit_rx))
            .map_err(|e| EngineError::configuration(format!("engine thread: {e}")))?;

        Ok(Self {
            cmd_tx,
            shared,
            hub,
            join: Some(join),
        })
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> EngineResult<T> {
        let (tx, rx) = bounded(1);
        self.cmd_tx.send(make(tx)).map_err(|_| EngineError::Closed)?;
        rx.recv().map_err(|_| EngineError::Closed)?
    }

    /// Start playing `source` on the configured output, replacing whatever plays now.
    ///
    /// Accepted from every state, including `Error`.
    pub fn play_url(&self, source: impl Into<Source>) -> EngineResult<()> {
        let source = source.into();
        self.call(|reply| Command::Play {
            source,
            output: None,
            reply,
        })
    }

    /// Like [`Engine::play_url`] with an explicit render sink for this session.
    pub fn play_url_with_output(&self, source: impl Into<Source>, output: OutputKind) -> EngineResult<()> {
        let source = source.into();
        self.call(|reply| Command::Play {
            source,
            output: Some(output),
            reply,
        })
    }

    /// Playing → Paused. No-op in any other state.
    pub fn pause(&self) -> EngineResult<()> {
        self.call(Command::Pause)
    }

    /// Paused → Playing. No-op in any other state.
    pub fn resume(&self) -> EngineResult<()> {
        self.call(Command::Resume)
    }

    /// Close every unit and go to Stopped. No-op unless playing or paused.
    pub fn stop(&self) -> EngineResult<()> {
        self.call(Command::Stop)
    }

    /// Reposition the current source.
    ///
    /// With `flush`, buffered audio is dropped and the played time jumps to the new
    /// position right away. Without it, buffered audio plays out first and the played time
    /// follows once playback reaches the new position.
    pub fn seek_to_time(&self, seconds: f64, flush: bool) -> EngineResult<()> {
        self.call(|reply| Command::Seek {
            seconds,
            flush,
            reply,
        })
    }

    /// Arm `source` to follow the current one. The last call wins.
    ///
    /// With `flush`, playback switches to it right away instead of at the end of the
    /// current source.
    pub fn set_next_url(&self, source: impl Into<Source>, flush: bool) -> EngineResult<()> {
        let source = source.into();
        self.call(|reply| Command::SetNext {
            source,
            flush,
            reply,
        })
    }

    /// Volume in percent: 100 is unity gain, larger values amplify, negative ones clamp to 0.
    pub fn set_volume(&self, percent: f32) -> EngineResult<()> {
        self.call(|reply| Command::SetVolume(percent, reply))
    }

    pub fn volume(&self) -> f32 {
        self.shared.lock().volume_percent
    }

    /// Sample encoding for sessions started after this call.
    pub fn set_output_format(&self, format: OutputFormat) -> EngineResult<()> {
        self.call(|reply| Command::SetOutputFormat(format, reply))
    }

    pub fn output_format(&self) -> OutputFormat {
        self.shared.lock().output_format
    }

    pub fn set_next_source_provider(&self, provider: impl NextSourceProvider + 'static) -> EngineResult<()> {
        let provider: Box<dyn NextSourceProvider> = Box::new(provider);
        self.call(|reply| Command::SetProvider(Some(provider), reply))
    }

    pub fn clear_next_source_provider(&self) -> EngineResult<()> {
        self.call(|reply| Command::SetProvider(None, reply))
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.hub.subscribe()
    }

    pub fn current_state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    /// The captured error; present only in the `Error` state.
    pub fn current_error(&self) -> Option<EngineError> {
        self.shared.lock().error.clone()
    }

    /// Seconds played on the current track, 0 when idle.
    pub fn amount_played(&self) -> f64 {
        self.shared
            .lock()
            .output
            .as_ref()
            .map_or(0.0, |o| o.amount_played())
    }

    /// Duration of the current track, `None` when idle or unknown.
    pub fn track_time(&self) -> Option<f64> {
        self.shared.lock().current.as_ref().and_then(|c| c.duration())
    }

    pub fn metadata(&self) -> ItemMetadata {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|c| c.metadata())
            .unwrap_or_default()
    }

    pub fn current_source(&self) -> Option<Source> {
        self.shared.lock().current.as_ref().map(|c| c.source().clone())
    }

    pub fn next_source(&self) -> Option<Source> {
        self.shared.lock().next.as_ref().map(|n| n.source().clone())
    }

    pub fn preload_progress(&self) -> f32 {
        self.shared
            .lock()
            .current
            .as_ref()
            .map_or(0.0, |c| c.preload_progress())
    }

    pub fn is_ready_to_play(&self) -> bool {
        self.shared
            .lock()
            .output
            .as_ref()
            .is_some_and(|o| o.ready_to_play())
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::warn!("engine control thread panicked");
            }
        }
    }
}

fn sanitize_volume(percent: f32) -> f32 {
    if percent.is_finite() { percent.max(0.0) } else { 0.0 }
}

struct Session {
    id: SessionId,
    output: Arc<OutputUnit>,
    current: Arc<InputUnit>,
    next: Option<Arc<InputUnit>>,
    /// The provider was already asked for a follower of `current`.
    asked_for_next: bool,
}

struct Control {
    config: EngineConfig,
    factory: Arc<dyn DecoderFactory>,
    shared: Arc<EngineShared>,
    hub: Arc<EventHub>,
    unit_tx: Sender<UnitEvent>,
    provider: Option<Box<dyn NextSourceProvider>>,
    session: Option<Session>,
    next_unit_id: UnitId,
    next_session_id: SessionId,
}

impl Control {
    fn run(mut self, commands: Receiver<Command>, units: Receiver<UnitEvent>) {
        loop {
            select! {
                recv(commands) -> command => match command {
                    Ok(Command::Shutdown) | Err(_) => break,
                    Ok(command) => self.handle_command(command),
                },
                recv(units) -> event => {
                    if let Ok(event) = event {
                        self.handle_unit_event(event);
                    }
                }
            }
        }
        self.teardown(PlaybackEndReason::Stopped);
        tracing::debug!("engine control thread exiting");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Play {
                source,
                output,
                reply,
            } => {
                let _ = reply.send(self.play(source, output));
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            Command::Stop(reply) => {
                self.stop(PlaybackEndReason::Stopped);
                let _ = reply.send(Ok(()));
            }
            Command::Seek {
                seconds,
                flush,
                reply,
            } => {
                let _ = reply.send(self.seek(seconds, flush));
            }
            Command::SetNext {
                source,
                flush,
                reply,
            } => {
                let _ = reply.send(self.set_next(source, flush));
            }
            Command::SetVolume(percent, reply) => {
                self.set_volume(percent);
                let _ = reply.send(Ok(()));
            }
            Command::SetOutputFormat(format, reply) => {
                self.config.output_format = format;
                self.shared.lock().output_format = format;
                tracing::info!(format = ?format, "output format set");
                let _ = reply.send(Ok(()));
            }
            Command::SetProvider(provider, reply) => {
                self.provider = provider;
                let _ = reply.send(Ok(()));
            }
            Command::Shutdown => {}
        }
    }

    fn handle_unit_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::PreloadProgress { unit, progress } => {
                if self.current_id() == Some(unit) {
                    self.shared.lock().preload_progress = progress;
                    self.hub.publish(EngineEvent::PreloadProgress { progress });
                }
            }
            UnitEvent::EndOfInput { unit } => {
                if self.current_id() == Some(unit) {
                    tracing::debug!(unit, "current input finished decoding");
                    self.request_next();
                }
            }
            UnitEvent::DecodeFailed { unit, error } => self.on_decode_failed(unit, error),
            UnitEvent::ReadyToPlay { session, ready } => {
                if self.session_id() == Some(session) {
                    self.shared.lock().ready_to_play = ready;
                    tracing::info!(session, ready, "ready to play changed");
                    self.hub.publish(EngineEvent::ReadyToPlayChanged { ready });
                }
            }
            UnitEvent::RenderExhausted { session } => {
                if self.session_id() == Some(session) {
                    self.on_render_exhausted();
                }
            }
            UnitEvent::TrackAdvanced { session, from, to } => {
                let Some(s) = self.session.as_ref().filter(|s| s.id == session) else {
                    return;
                };
                if s.current.id() == from && s.next.as_ref().is_some_and(|n| n.id() == to) {
                    self.promote_next();
                    self.request_next_if_finished();
                }
            }
            UnitEvent::ConvertFailed { session, error } => {
                if self.session_id() == Some(session) {
                    self.fail(error);
                }
            }
        }
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    fn current_id(&self) -> Option<UnitId> {
        self.session.as_ref().map(|s| s.current.id())
    }

    fn state(&self) -> PlaybackState {
        self.shared.lock().state
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
            && matches!(self.state(), PlaybackState::Playing | PlaybackState::Paused)
    }

    fn open_input(&mut self, source: Source) -> EngineResult<Arc<InputUnit>> {
        let id = self.next_unit_id;
        self.next_unit_id += 1;
        let unit = InputUnit::new(id, source, &self.config, self.unit_tx.clone());
        unit.open(self.factory.as_ref())?;
        Ok(Arc::new(unit))
    }

    fn play(&mut self, source: Source, output: Option<OutputKind>) -> EngineResult<()> {
        let previous = self.teardown(PlaybackEndReason::Switched);
        self.shared.lock().end_reason = None;

        let input = match self.open_input(source.clone()) {
            Ok(input) => input,
            Err(error) => {
                self.fail(error.clone());
                return Err(error);
            }
        };

        let id = self.next_session_id;
        self.next_session_id += 1;
        let kind = output.unwrap_or_else(|| self.config.output.clone());
        let gain = self.shared.lock().volume_percent / 100.0;
        let opened = OutputUnit::open(id, &kind, input.clone(), &self.config, gain, self.unit_tx.clone())
            .and_then(|output| output.resume().map(|()| output));
        let output = match opened {
            Ok(output) => Arc::new(output),
            Err(error) => {
                input.close();
                self.fail(error.clone());
                return Err(error);
            }
        };

        {
            let mut s = self.shared.lock();
            s.current = Some(input.clone());
            s.next = None;
            s.output = Some(output.clone());
            s.preload_progress = input.preload_progress();
            s.ready_to_play = false;
        }
        self.session = Some(Session {
            id,
            output,
            current: input,
            next: None,
            asked_for_next: false,
        });
        tracing::info!(session = id, url = %source, "playback started");
        self.set_state(PlaybackState::Playing);
        self.hub.publish(EngineEvent::CurrentSourceChanged {
            previous,
            current: Some(source.clone()),
        });
        self.hub.publish(EngineEvent::PlaybackStarted { source });
        Ok(())
    }

    fn pause(&mut self) -> EngineResult<()> {
        if self.state() != PlaybackState::Playing {
            return Ok(());
        }
        if let Some(session) = &self.session {
            session.output.pause()?;
        }
        self.set_state(PlaybackState::Paused);
        Ok(())
    }

    fn resume(&mut self) -> EngineResult<()> {
        if self.state() != PlaybackState::Paused {
            return Ok(());
        }
        if let Some(session) = &self.session {
            session.output.resume()?;
        }
        self.set_state(PlaybackState::Playing);
        Ok(())
    }

    fn stop(&mut self, reason: PlaybackEndReason) {
        if !self.is_active() {
            return;
        }
        let previous = self.teardown(reason);
        self.set_state(PlaybackState::Stopped);
        self.hub.publish(EngineEvent::CurrentSourceChanged {
            previous,
            current: None,
        });
    }

    fn seek(&mut self, seconds: f64, flush: bool) -> EngineResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.sync_advance();
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let reached = session.current.seek(seconds, flush)?;
        if flush {
            session.output.flush_to(reached);
        }
        if session.next.is_none() {
            session.asked_for_next = false;
        }
        tracing::info!(
            session = session.id,
            requested = seconds,
            reached,
            flush,
            "seek applied"
        );
        Ok(())
    }

    fn set_next(&mut self, source: Source, flush: bool) -> EngineResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        let unit = match self.open_input(source.clone()) {
            Ok(unit) => unit,
            Err(error) => {
                self.hub.publish(EngineEvent::ItemFailed {
                    source,
                    error: error.clone(),
                });
                return Err(error);
            }
        };

        if !flush {
            self.arm_next(unit);
            return Ok(());
        }

        self.sync_advance();
        let Some(session) = self.session.as_mut() else {
            unit.close();
            return Ok(());
        };
        if let Some(old) = session.next.take() {
            old.close();
        }
        if let Err(error) = session.output.switch_input(unit.clone()) {
            unit.close();
            self.fail(error.clone());
            return Err(error);
        }
        session.next = Some(unit);
        self.promote_next();
        self.request_next_if_finished();
        Ok(())
    }

    fn set_volume(&mut self, percent: f32) {
        let percent = sanitize_volume(percent);
        self.shared.lock().volume_percent = percent;
        if let Some(session) = &self.session {
            session.output.set_gain(percent / 100.0);
        }
        tracing::debug!(percent, "volume set");
    }

    /// Put `unit` in the gapless slot, closing whatever it replaces.
    fn arm_next(&mut self, unit: Arc<InputUnit>) {
        self.sync_advance();
        let Some(session) = self.session.as_mut() else {
            unit.close();
            return;
        };
        let displaced = session.output.attach_next(Some(unit.clone()));
        let replaced = session.next.replace(unit.clone());
        match replaced {
            Some(old) if displaced.as_ref().is_some_and(|d| d.id() == old.id()) => {
                tracing::debug!(unit = old.id(), "armed input replaced");
                old.close();
            }
            Some(old) => {
                // The converter moved into `old` after the last check; it is current now.
                session.next = Some(old);
                self.promote_next();
                if let Some(session) = self.session.as_mut() {
                    session.next = Some(unit.clone());
                }
            }
            None => {}
        }
        tracing::info!(unit = unit.id(), url = %unit.source(), "next input armed");
        self.shared.lock().next = Some(unit);
    }

    /// Ask the provider for a follower of the current source, once per track.
    fn request_next(&mut self) {
        let finished = match self.session.as_mut() {
            Some(s) if s.next.is_none() && !s.asked_for_next => {
                s.asked_for_next = true;
                s.current.source().clone()
            }
            _ => return,
        };
        let Some(provider) = self.provider.as_mut() else {
            return;
        };
        let Some(source) = provider.next_source(Some(&finished)) else {
            tracing::debug!(finished = %finished, "no next source provided");
            return;
        };
        match self.open_input(source.clone()) {
            Ok(unit) => self.arm_next(unit),
            Err(error) => {
                tracing::warn!(url = %source, error = %error, "next source failed to open");
                self.hub.publish(EngineEvent::ItemFailed { source, error });
            }
        }
    }

    fn request_next_if_finished(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.current.decoder_finished())
        {
            self.request_next();
        }
    }

    /// Promote the session's next input if the converter already moved into it.
    fn sync_advance(&mut self) {
        let moved = self.session.as_ref().is_some_and(|s| {
            s.next
                .as_ref()
                .is_some_and(|n| s.output.current_input() == n.id())
        });
        if moved {
            self.promote_next();
        }
    }

    /// The armed next input becomes current; the previous current is closed.
    fn promote_next(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(next) = session.next.take() else {
            return;
        };
        let previous = std::mem::replace(&mut session.current, next);
        previous.close();
        session.asked_for_next = false;
        let current = session.current.clone();
        let id = session.id;
        {
            let mut s = self.shared.lock();
            s.current = Some(current.clone());
            s.next = None;
            s.preload_progress = current.preload_progress();
        }
        tracing::info!(
            session = id,
            from = previous.id(),
            to = current.id(),
            url = %current.source(),
            "track advanced"
        );
        self.hub.publish(EngineEvent::CurrentSourceChanged {
            previous: Some(previous.source().clone()),
            current: Some(current.source().clone()),
        });
        self.hub.publish(EngineEvent::PlaybackStarted {
            source: current.source().clone(),
        });
    }

    fn on_decode_failed(&mut self, unit: UnitId, error: EngineError) {
        self.sync_advance();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.current.id() == unit {
            self.fail(error);
            return;
        }
        if session.next.as_ref().is_some_and(|n| n.id() == unit) {
            session.output.attach_next(None);
            if let Some(next) = session.next.take() {
                next.close();
                tracing::warn!(unit, url = %next.source(), error = %error, "armed input failed");
                self.shared.lock().next = None;
                self.hub.publish(EngineEvent::ItemFailed {
                    source: next.source().clone(),
                    error,
                });
            }
        }
    }

    fn on_render_exhausted(&mut self) {
        let before = self.current_id();
        self.sync_advance();
        if self.current_id() != before {
            return;
        }
        // A flushed seek after the report refills the buffer.
        if !self.session.as_ref().is_some_and(|s| s.current.end_of_input()) {
            return;
        }

        self.request_next();
        let next = self.session.as_ref().and_then(|s| s.next.clone());
        if let Some(next) = next {
            let switched = self
                .session
                .as_ref()
                .map(|s| s.output.switch_input(next));
            match switched {
                Some(Err(error)) => self.fail(error),
                _ => {
                    self.promote_next();
                    self.request_next_if_finished();
                }
            }
            return;
        }
        tracing::info!(session = ?self.session_id(), "end of playlist");
        self.stop(PlaybackEndReason::Eof);
    }

    /// Capture `error`, close every unit and enter the `Error` state.
    fn fail(&mut self, error: EngineError) {
        tracing::error!(error = %error, "playback failed");
        let previous = self.teardown(PlaybackEndReason::Error);
        {
            let mut s = self.shared.lock();
            s.state = PlaybackState::Error;
            s.error = Some(error.clone());
        }
        self.hub.publish(EngineEvent::StateChanged {
            state: PlaybackState::Error,
            error: Some(error),
        });
        if previous.is_some() {
            self.hub.publish(EngineEvent::CurrentSourceChanged {
                previous,
                current: None,
            });
        }
    }

    fn set_state(&mut self, state: PlaybackState) {
        {
            let mut s = self.shared.lock();
            if s.state == state {
                return;
            }
            s.state = state;
            s.error = None;
        }
        tracing::info!(state = ?state, "engine state changed");
        self.hub.publish(EngineEvent::StateChanged { state, error: None });
    }

    /// Close the session's units. Returns the source that was current.
    fn teardown(&mut self, reason: PlaybackEndReason) -> Option<Source> {
        let session = self.session.take()?;
        session.output.stop();
        session.output.attach_next(None);
        if let Some(next) = &session.next {
            next.close();
        }
        session.current.close();
        {
            let mut s = self.shared.lock();
            s.clear_playback();
            s.end_reason = Some(reason);
        }
        tracing::info!(session = session.id, reason = ?reason, "playback session closed");
        Some(session.current.source().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ManualClock;

    fn manual_engine(clock: &ManualClock) -> Engine {
        let config = EngineConfig {
            output: OutputKind::Manual(clock.clone()),
            ..EngineConfig::default()
        };
        Engine::new(config).unwrap()
    }

    #[test]
    fn idle_commands_are_noops() {
        let engine = manual_engine(&ManualClock::new(256));
        engine.pause().unwrap();
        engine.resume().unwrap();
        engine.stop().unwrap();
        engine.seek_to_time(1.0, true).unwrap();
        engine.set_next_url("tone:440", false).unwrap();
        assert_eq!(engine.current_state(), PlaybackState::Stopped);
        assert!(engine.next_source().is_none());
        assert_eq!(engine.amount_played(), 0.0);
    }

    #[test]
    fn volume_clamps_negative_values() {
        let engine = manual_engine(&ManualClock::new(256));
        engine.set_volume(-20.0).unwrap();
        assert_eq!(engine.volume(), 0.0);
        engine.set_volume(150.0).unwrap();
        assert_eq!(engine.volume(), 150.0);
    }

    #[test]
    fn play_and_stop_publish_source_changes() {
        let clock = ManualClock::new(256);
        let engine = manual_engine(&clock);
        let events = engine.subscribe();
        engine.play_url("tone:440?seconds=2&rate=8000&channels=1").unwrap();
        assert_eq!(engine.current_state(), PlaybackState::Playing);
        assert!(clock.is_attached());
        assert_eq!(engine.track_time(), Some(2.0));
        engine.stop().unwrap();
        assert_eq!(engine.current_state(), PlaybackState::Stopped);
        assert!(!clock.is_attached());

        let seen: Vec<_> = events.try_iter().collect();
        let a = Source::new("tone:440?seconds=2&rate=8000&channels=1");
        assert!(seen.contains(&EngineEvent::CurrentSourceChanged {
            previous: None,
            current: Some(a.clone()),
        }));
        assert!(seen.contains(&EngineEvent::PlaybackStarted { source: a.clone() }));
        assert!(seen.contains(&EngineEvent::CurrentSourceChanged {
            previous: Some(a),
            current: None,
        }));
        assert_eq!(engine.status().end_reason, Some(PlaybackEndReason::Stopped));
    }

    #[test]
    fn output_format_applies_to_next_session() {
        let clock = ManualClock::new(256);
        let engine = manual_engine(&clock);
        engine.set_output_format(OutputFormat::I16).unwrap();
        assert_eq!(engine.output_format(), OutputFormat::I16);
        engine.play_url("tone:440?seconds=1&rate=8000&channels=2").unwrap();
        assert_eq!(engine.status().output_format, Some(OutputFormat::I16));
        let bytes = clock.tick_bytes().unwrap();
        assert_eq!(bytes.len(), 256 * 2 * 2);
    }
}
