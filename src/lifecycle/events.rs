//! Lifecycle event bus.
//!
//! [`EventBus`] is a thin wrapper around [`tokio::sync::broadcast`]. The
//! bootstrapper, subsystem handles and the coordinator publish to it; tests
//! and diagnostics subscribe. Publishing never blocks and events are dropped
//! when nobody is listening.
//!
//! Every [`Event`] carries a process-wide sequence number, so subscribers can
//! assert happens-before relations between subsystems.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::broadcast;

use crate::lifecycle::coordinator::TriggerKind;
use crate::lifecycle::state::LifecycleState;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The lifecycle state moved forward.
    StateChanged(LifecycleState),
    /// A subsystem handle was recorded (its worker is live).
    SubsystemStarted(String),
    /// `stop` was called on a subsystem for the first time.
    StopRequested(String),
    /// A subsystem stopped cleanly.
    SubsystemStopped(String),
    /// A subsystem reported an error while stopping.
    StopFailed { name: String, reason: String },
    /// A subsystem did not stop before its deadline.
    StopTimedOut(String),
    /// The coordinator accepted a trigger and began shutting down.
    TriggerAccepted(TriggerKind),
    /// A trigger arrived while already shutting down.
    TriggerDiscarded(TriggerKind),
    /// A messenger close attempt finished.
    MessengerClosed { name: String, ok: bool },
}

/// A lifecycle event with ordering metadata.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic, process-wide sequence number.
    pub seq: u64,
    pub at: Instant,
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::SeqCst),
            at: Instant::now(),
            kind,
        }
    }
}

/// Broadcast channel for lifecycle events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, kind: EventKind) {
        let _ = self.tx.send(Event::new(kind));
    }

    /// Receives events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(ev) => events.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(EventKind::SubsystemStarted("a".into()));
        bus.publish(EventKind::SubsystemStarted("b".into()));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.publish(EventKind::StopRequested("x".into()));
    }
}
