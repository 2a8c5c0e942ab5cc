//! Player runtime: device listing and playlist playback on top of the engine.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select};
use sonan_engine::{device, Engine, EngineEvent, PlaybackState, Source};

use crate::config::PlayConfig;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    for name in device::list_devices(&host)? {
        println!("{name}");
    }
    Ok(())
}

/// Play every input in order, continuing gaplessly from one to the next.
///
/// Returns when the last input ends, on Ctrl-C, or with the engine's error.
pub fn run_play(config: PlayConfig) -> Result<()> {
    let mut queue: VecDeque<Source> = config.inputs.iter().map(Source::new).collect();
    let first = queue.pop_front().ok_or_else(|| anyhow!("nothing to play; pass files or tone: specs"))?;

    let engine = Engine::new(config.engine.clone()).context("start engine")?;
    let events = engine.subscribe();
    engine.set_next_source_provider(move |finished: Option<&Source>| {
        let next = queue.pop_front();
        tracing::debug!(
            finished = ?finished.map(Source::location),
            next = ?next.as_ref().map(Source::location),
            "next source requested"
        );
        next
    })?;

    let (stop_tx, stop_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install Ctrl-C handler")?;

    engine
        .play_url(first.clone())
        .with_context(|| format!("play {first}"))?;
    if let Some(at) = config.start_at {
        engine.seek_to_time(at, true).with_context(|| format!("seek to {at}s"))?;
    }

    let mut failure = None;
    loop {
        select! {
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                engine.stop()?;
                break;
            }
            recv(events) -> event => match event {
                Ok(EngineEvent::StateChanged { state: PlaybackState::Stopped, .. }) => break,
                Ok(EngineEvent::StateChanged { state: PlaybackState::Error, error }) => {
                    failure = error;
                    break;
                }
                Ok(EngineEvent::PlaybackStarted { source }) => {
                    let metadata = engine.metadata();
                    tracing::info!(
                        url = %source,
                        title = metadata.text("TrackTitle").unwrap_or("-"),
                        artist = metadata.text("Artist").unwrap_or("-"),
                        duration_s = ?engine.track_time(),
                        "now playing"
                    );
                }
                Ok(EngineEvent::ItemFailed { source, error }) => {
                    tracing::warn!(url = %source, error = %error, "skipping source");
                }
                Ok(EngineEvent::ReadyToPlayChanged { ready }) => {
                    tracing::debug!(ready, "ready to play");
                }
                Ok(_) => {}
                Err(_) => break,
            },
            default(STATUS_INTERVAL) => log_status(&engine),
        }
    }

    if config.status_json {
        println!("{}", serde_json::to_string_pretty(&engine.status())?);
    }
    match failure {
        Some(error) => Err(anyhow::Error::new(error).context("playback failed")),
        None => Ok(()),
    }
}

fn log_status(engine: &Engine) {
    let status = engine.status();
    tracing::info!(
        state = ?status.state,
        elapsed_ms = ?status.elapsed_ms,
        duration_ms = ?status.duration_ms,
        buffered_bytes = ?status.buffered_bytes,
        underrun_events = ?status.underrun_events,
        "status"
    );
}
