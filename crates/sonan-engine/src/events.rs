//! Typed notifications.
//!
//! Units report to the engine's control thread through [`UnitEvent`]s on a channel; the
//! engine republishes what observers care about as [`EngineEvent`]s through an
//! [`EventHub`]. Nothing ever calls back into the engine from a worker or render thread.

use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use sonan_types::PlaybackState;

use crate::error::EngineError;
use crate::source::Source;

/// Identifier of an input unit, unique for the engine's lifetime.
pub type UnitId = u64;

/// Identifier of a playback session (one output unit from `play_url` to stop).
pub type SessionId = u64;

/// Reports from units to the control thread.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    PreloadProgress { unit: UnitId, progress: f32 },
    /// The decoder finished; buffered data may still be playing.
    EndOfInput { unit: UnitId },
    DecodeFailed { unit: UnitId, error: EngineError },
    ReadyToPlay { session: SessionId, ready: bool },
    /// The converter ran dry after end of input with nothing armed behind it.
    RenderExhausted { session: SessionId },
    /// The converter moved from one input to the next without a gap.
    TrackAdvanced {
        session: SessionId,
        from: UnitId,
        to: UnitId,
    },
    ConvertFailed { session: SessionId, error: EngineError },
}

/// Notifications for engine observers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    StateChanged {
        state: PlaybackState,
        error: Option<EngineError>,
    },
    PreloadProgress { progress: f32 },
    ReadyToPlayChanged { ready: bool },
    CurrentSourceChanged {
        previous: Option<Source>,
        current: Option<Source>,
    },
    PlaybackStarted { source: Source },
    /// A source failed without taking down the current playback (e.g. the armed next item).
    ItemFailed { source: Source, error: EngineError },
}

/// Fan-out of [`EngineEvent`]s to any number of subscribers.
///
/// Subscribers that drop their receiver are pruned on the next publish.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.publish(EngineEvent::ReadyToPlayChanged { ready: true });
        assert_eq!(
            a.try_recv().unwrap(),
            EngineEvent::ReadyToPlayChanged { ready: true }
        );
        assert_eq!(
            b.try_recv().unwrap(),
            EngineEvent::ReadyToPlayChanged { ready: true }
        );
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let keep = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);
        hub.publish(EngineEvent::PreloadProgress { progress: 0.5 });
        assert_eq!(hub.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
