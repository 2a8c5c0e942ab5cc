use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use sonan_engine::format::AudioFormat;
use sonan_engine::source::DecodeStep;
use sonan_engine::{
    Decoder, DecoderFactory, DecoderRegistry, Engine, EngineConfig, EngineError, EngineEvent,
    EngineResult, ItemMetadata, ManualClock, OutputKind, PlaybackEndReason, PlaybackState, Source,
};

const TEN_SECONDS: &str = "tone:440?seconds=10&rate=8000&channels=2";
const SHORT_A: &str = "tone:440?seconds=0.5&rate=8000&channels=1";
const SHORT_B: &str = "tone:660?seconds=0.5&rate=8000&channels=1";
const SHORT_C: &str = "tone:880?seconds=0.5&rate=8000&channels=1";

/// Locations with this prefix decode a few chunks of the rest, then fail.
const BROKEN: &str = "broken+";
const CHUNKS_BEFORE_FAILURE: usize = 4;

struct BreakingFactory;

impl DecoderFactory for BreakingFactory {
    fn open(&self, source: &Source) -> EngineResult<Box<dyn Decoder>> {
        match source.location().strip_prefix(BROKEN) {
            Some(inner) => Ok(Box::new(BreakingDecoder {
                inner: DecoderRegistry.open(&Source::new(inner))?,
                remaining: CHUNKS_BEFORE_FAILURE,
            })),
            None => DecoderRegistry.open(source),
        }
    }
}

struct BreakingDecoder {
    inner: Box<dyn Decoder>,
    remaining: usize,
}

impl Decoder for BreakingDecoder {
    fn format(&self) -> AudioFormat {
        self.inner.format()
    }

    fn decode_next(&mut self) -> EngineResult<DecodeStep> {
        if self.remaining == 0 {
            return Err(EngineError::decode("corrupt frame"));
        }
        self.remaining -= 1;
        self.inner.decode_next()
    }

    fn seek(&mut self, seconds: f64) -> EngineResult<f64> {
        self.inner.seek(seconds)
    }

    fn metadata(&self) -> ItemMetadata {
        self.inner.metadata()
    }

    fn frames_count(&self) -> Option<f64> {
        self.inner.frames_count()
    }
}

fn manual_engine(clock: &ManualClock) -> Engine {
    let config = EngineConfig {
        output: OutputKind::Manual(clock.clone()),
        ..EngineConfig::default()
    };
    Engine::new(config).unwrap()
}

fn breaking_engine(clock: &ManualClock) -> Engine {
    let config = EngineConfig {
        output: OutputKind::Manual(clock.clone()),
        ..EngineConfig::default()
    };
    Engine::with_factory(config, Arc::new(BreakingFactory)).unwrap()
}

/// Poll `done` without rendering.
fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Tick the clock until `done` holds, giving decode workers time to run in between.
fn drive_until(clock: &ManualClock, what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        clock.tick();
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_event(events: &Receiver<EngineEvent>, wanted: &EngineEvent) -> Vec<EngineEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        if let Ok(event) = events.recv_timeout(Duration::from_millis(50)) {
            let hit = &event == wanted;
            seen.push(event);
            if hit {
                return seen;
            }
        }
    }
    panic!("never saw {wanted:?}; got {seen:?}");
}

#[test]
fn pause_freezes_and_resume_continues_amount_played() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url(TEN_SECONDS).unwrap();
    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert_eq!(engine.track_time(), Some(10.0));

    drive_until(&clock, "ready to play", || engine.is_ready_to_play());
    assert!(engine.amount_played() > 0.0);

    engine.pause().unwrap();
    assert_eq!(engine.current_state(), PlaybackState::Paused);
    let frozen = engine.amount_played();
    clock.tick_n(20);
    assert_eq!(engine.amount_played(), frozen);

    engine.resume().unwrap();
    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert_eq!(engine.amount_played(), frozen);
    drive_until(&clock, "played time to advance", || engine.amount_played() > frozen);
}

#[test]
fn armed_next_source_plays_without_stopping() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let events = engine.subscribe();
    engine.play_url(SHORT_A).unwrap();
    engine.set_next_url(SHORT_B, false).unwrap();
    assert_eq!(engine.next_source(), Some(Source::new(SHORT_B)));

    let b = Source::new(SHORT_B);
    drive_until(&clock, "switch to B", || engine.current_source().as_ref() == Some(&b));

    let seen = wait_for_event(
        &events,
        &EngineEvent::CurrentSourceChanged {
            previous: Some(Source::new(SHORT_A)),
            current: Some(b.clone()),
        },
    );
    assert!(!seen.iter().any(|e| matches!(
        e,
        EngineEvent::StateChanged {
            state: PlaybackState::Stopped,
            ..
        }
    )));
    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert!(engine.next_source().is_none());

    drive_until(&clock, "end of B", || engine.current_state() == PlaybackState::Stopped);
    assert_eq!(engine.status().end_reason, Some(PlaybackEndReason::Eof));
    wait_for_event(
        &events,
        &EngineEvent::CurrentSourceChanged {
            previous: Some(b),
            current: None,
        },
    );
}

#[test]
fn flushed_seek_snaps_played_time_and_restarts_preload() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url(TEN_SECONDS).unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());

    let events = engine.subscribe();
    engine.seek_to_time(5.0, true).unwrap();
    assert_eq!(engine.amount_played(), 5.0);
    wait_for_event(&events, &EngineEvent::PreloadProgress { progress: 0.0 });

    drive_until(&clock, "played time past 5s", || engine.amount_played() > 5.0);
    assert_eq!(engine.current_state(), PlaybackState::Playing);
}

#[test]
fn unflushed_seek_catches_up_after_buffered_audio() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url("tone:440?seconds=10&rate=8000&channels=1").unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());

    engine.seek_to_time(8.0, false).unwrap();
    assert!(engine.amount_played() < 8.0);
    drive_until(&clock, "played time to reach 8s", || engine.amount_played() >= 8.0);
}

#[test]
fn unflushed_seek_after_flushed_seek_lands_on_time() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url("tone:440?seconds=10&rate=8000&channels=1").unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());

    // Flush a full buffer so the dropped bytes would show up as delay.
    engine.pause().unwrap();
    wait_for("full buffer", || {
        let status = engine.status();
        status.buffered_bytes.is_some() && status.buffered_bytes == status.buffer_capacity_bytes
    });
    engine.seek_to_time(2.0, true).unwrap();
    assert_eq!(engine.amount_played(), 2.0);
    engine.resume().unwrap();
    drive_until(&clock, "ready after flush", || engine.is_ready_to_play());

    engine.seek_to_time(8.0, false).unwrap();
    let start = engine.amount_played();
    let mut before_jump = start;
    drive_until(&clock, "played time to reach 8s", || {
        let now = engine.amount_played();
        if now < 8.0 {
            before_jump = now;
        }
        now >= 8.0
    });
    // Only audio buffered at seek time (at most the 2s buffer) plays before the jump.
    assert!(
        before_jump - start <= 2.25,
        "played {:.2}s of old audio after the seek",
        before_jump - start
    );
    assert!(engine.amount_played() < 9.0);
}

#[test]
fn out_of_range_seek_keeps_position() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url(TEN_SECONDS).unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());
    engine.pause().unwrap();
    let before = engine.amount_played();

    let err = engine.seek_to_time(42.0, true).unwrap_err();
    assert!(matches!(err, EngineError::Seek(_)));
    assert!(engine.seek_to_time(-1.0, false).is_err());
    assert_eq!(engine.amount_played(), before);
    assert_eq!(engine.current_state(), PlaybackState::Paused);
}

#[test]
fn invalid_source_enters_error_until_next_play() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let events = engine.subscribe();

    let err = engine.play_url("/definitely/not/here.flac").unwrap_err();
    assert!(matches!(err, EngineError::SourceOpen { .. }));
    assert_eq!(engine.current_state(), PlaybackState::Error);
    assert_eq!(engine.current_error(), Some(err.clone()));

    engine.pause().unwrap();
    engine.resume().unwrap();
    engine.seek_to_time(1.0, true).unwrap();
    engine.stop().unwrap();
    assert_eq!(engine.current_state(), PlaybackState::Error);
    assert!(engine.current_error().is_some());

    engine.play_url(TEN_SECONDS).unwrap();
    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert!(engine.current_error().is_none());

    let seen: Vec<_> = events.try_iter().collect();
    assert!(seen.contains(&EngineEvent::StateChanged {
        state: PlaybackState::Error,
        error: Some(err),
    }));
}

#[test]
fn provider_supplies_follow_up_source() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let asked = Arc::new(Mutex::new(Vec::new()));
    let log = asked.clone();
    let mut queue = vec![Source::new(SHORT_B)];
    engine
        .set_next_source_provider(move |finished: Option<&Source>| {
            log.lock().unwrap().push(finished.cloned());
            queue.pop()
        })
        .unwrap();

    engine.play_url(SHORT_A).unwrap();
    let b = Source::new(SHORT_B);
    drive_until(&clock, "switch to B", || engine.current_source().as_ref() == Some(&b));
    drive_until(&clock, "end of playlist", || engine.current_state() == PlaybackState::Stopped);

    let asked = asked.lock().unwrap();
    assert_eq!(asked[0], Some(Source::new(SHORT_A)));
    assert_eq!(asked.last(), Some(&Some(b)));
}

#[test]
fn flushed_next_switches_immediately() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let events = engine.subscribe();
    engine.play_url(TEN_SECONDS).unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());

    engine.set_next_url(SHORT_B, true).unwrap();
    assert_eq!(engine.current_source(), Some(Source::new(SHORT_B)));
    assert_eq!(engine.amount_played(), 0.0);
    assert_eq!(engine.track_time(), Some(0.5));
    wait_for_event(
        &events,
        &EngineEvent::CurrentSourceChanged {
            previous: Some(Source::new(TEN_SECONDS)),
            current: Some(Source::new(SHORT_B)),
        },
    );
}

#[test]
fn failing_next_source_leaves_playback_alone() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let events = engine.subscribe();
    engine.play_url(TEN_SECONDS).unwrap();

    let bad = Source::new("tone:440?bogus=1");
    let err = engine.set_next_url(bad.clone(), false).unwrap_err();
    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert_eq!(engine.current_source(), Some(Source::new(TEN_SECONDS)));
    assert!(engine.next_source().is_none());
    wait_for_event(&events, &EngineEvent::ItemFailed { source: bad, error: err });
}

#[test]
fn zero_volume_renders_silence() {
    let clock = ManualClock::new(128);
    let engine = manual_engine(&clock);
    engine.set_volume(0.0).unwrap();
    engine.play_url(TEN_SECONDS).unwrap();
    drive_until(&clock, "ready to play", || engine.is_ready_to_play());
    let bytes = clock.tick_bytes().unwrap();
    assert!(bytes.iter().all(|b| *b == 0));

    engine.set_volume(100.0).unwrap();
    let bytes = clock.tick_bytes().unwrap();
    assert!(bytes.iter().any(|b| *b != 0));
}

#[test]
fn wav_file_plays_to_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for n in 0..2_000u32 {
        let t = n as f32 / 8_000.0;
        let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
        writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();

    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    engine.play_url(path.to_string_lossy().to_string()).unwrap();
    assert_eq!(engine.track_time(), Some(0.25));
    let status = engine.status();
    assert_eq!(status.source_rate_hz, Some(8_000));
    assert_eq!(status.output_channels, Some(1));

    drive_until(&clock, "end of file", || engine.current_state() == PlaybackState::Stopped);
    assert_eq!(engine.status().end_reason, Some(PlaybackEndReason::Eof));
    assert!(!clock.is_attached());
}

#[test]
fn decode_failure_on_current_source_enters_error() {
    let clock = ManualClock::new(256);
    let engine = breaking_engine(&clock);
    let events = engine.subscribe();
    let broken = Source::new(format!("{BROKEN}{TEN_SECONDS}"));
    engine.play_url(broken.clone()).unwrap();

    drive_until(&clock, "error state", || engine.current_state() == PlaybackState::Error);
    let error = engine.current_error();
    assert!(matches!(error, Some(EngineError::Decode(_))), "got {error:?}");
    assert!(engine.current_source().is_none());
    assert!(engine.next_source().is_none());
    assert!(!clock.is_attached());
    assert_eq!(engine.status().end_reason, Some(PlaybackEndReason::Error));

    wait_for_event(
        &events,
        &EngineEvent::CurrentSourceChanged {
            previous: Some(broken),
            current: None,
        },
    );
    assert_eq!(engine.current_error(), error);
}

#[test]
fn decode_failure_on_armed_source_keeps_playing() {
    let clock = ManualClock::new(256);
    let engine = breaking_engine(&clock);
    let events = engine.subscribe();
    engine.play_url(TEN_SECONDS).unwrap();

    let broken = Source::new(format!("{BROKEN}{SHORT_B}"));
    engine.set_next_url(broken.clone(), false).unwrap();
    wait_for_event(
        &events,
        &EngineEvent::ItemFailed {
            source: broken,
            error: EngineError::decode("corrupt frame"),
        },
    );

    assert_eq!(engine.current_state(), PlaybackState::Playing);
    assert_eq!(engine.current_source(), Some(Source::new(TEN_SECONDS)));
    assert!(engine.next_source().is_none());
    assert!(engine.current_error().is_none());

    let before = engine.amount_played();
    drive_until(&clock, "playback to continue", || engine.amount_played() > before);
}

#[test]
fn last_armed_source_wins() {
    let clock = ManualClock::new(256);
    let engine = manual_engine(&clock);
    let events = engine.subscribe();
    engine.play_url(SHORT_A).unwrap();
    engine.set_next_url(SHORT_B, false).unwrap();
    engine.set_next_url(SHORT_C, false).unwrap();
    assert_eq!(engine.next_source(), Some(Source::new(SHORT_C)));

    let c = Source::new(SHORT_C);
    drive_until(&clock, "switch to C", || engine.current_source().as_ref() == Some(&c));
    let seen = wait_for_event(
        &events,
        &EngineEvent::CurrentSourceChanged {
            previous: Some(Source::new(SHORT_A)),
            current: Some(c),
        },
    );
    let b = Source::new(SHORT_B);
    assert!(!seen.iter().any(|e| matches!(
        e,
        EngineEvent::CurrentSourceChanged { current: Some(s), .. } if *s == b
    )));
}
