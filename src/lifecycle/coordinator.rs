//! Reload/shutdown coordination.
//!
//! Signal sources (OS signals, the config watcher, tests) hold a cloneable
//! [`ReloadTrigger`]. Exactly one [`Coordinator`] task consumes the other end.
//! The first trigger moves the lifecycle to `ShuttingDown` and runs the
//! shutdown function once; anything arriving after that is discarded.
//! Duplicate collapsing relies on the lifecycle guard, not on the channel
//! capacity.
//!
//! A [`TriggerRelay`] spans the whole process run. Long-lived sources (OS
//! signals) fire into it; each generation attaches its own trigger while it
//! runs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};

use crate::lifecycle::events::EventKind;
use crate::lifecycle::shutdown::ShutdownReport;
use crate::lifecycle::state::{Lifecycle, LifecycleState};

/// What the trigger asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// Shut down, then boot a new generation.
    Reload,
    /// Shut down and exit.
    Terminate,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Reload => f.write_str("reload"),
            TriggerKind::Terminate => f.write_str("terminate"),
        }
    }
}

/// Sending side of the single-slot trigger channel.
#[derive(Debug, Clone)]
pub struct ReloadTrigger {
    tx: mpsc::Sender<TriggerKind>,
}

/// Receiving side, consumed by [`Coordinator::await_termination`].
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::Receiver<TriggerKind>,
}

impl ReloadTrigger {
    pub fn channel() -> (Self, TriggerReceiver) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, TriggerReceiver { rx })
    }

    /// Notify the coordinator without blocking. Returns `false` if the slot
    /// was already occupied or the coordinator is gone.
    pub fn fire(&self, kind: TriggerKind) -> bool {
        match self.tx.try_send(kind) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(trigger = %kind, "Trigger already pending, collapsing");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the coordinator has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Trigger entry point that outlives generations.
///
/// Triggers fired while no generation is attached are held and delivered on
/// the next [`attach`](Self::attach); a held terminate is never downgraded
/// to a reload. A terminate request is sticky for the rest of the run, even
/// when the coordinator discards it as a duplicate.
#[derive(Debug, Clone, Default)]
pub struct TriggerRelay {
    inner: Arc<RelayInner>,
}

#[derive(Debug, Default)]
struct RelayInner {
    slot: Mutex<RelaySlot>,
    terminate: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct RelaySlot {
    current: Option<ReloadTrigger>,
    pending: Option<TriggerKind>,
}

impl TriggerRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, RelaySlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forward `kind` to the attached generation, or hold it until one
    /// attaches. Returns `false` once the relay is closed or when the
    /// generation's slot was already occupied.
    pub fn fire(&self, kind: TriggerKind) -> bool {
        if self.is_closed() {
            return false;
        }
        if kind == TriggerKind::Terminate {
            self.inner.terminate.store(true, Ordering::SeqCst);
        }

        let mut slot = self.slot();
        if let Some(trigger) = slot.current.as_ref().filter(|t| !t.is_closed()) {
            return trigger.fire(kind);
        }
        let held = match (slot.pending, kind) {
            (Some(TriggerKind::Terminate), _) | (_, TriggerKind::Terminate) => TriggerKind::Terminate,
            _ => TriggerKind::Reload,
        };
        tracing::info!(trigger = %held, "No generation running, holding trigger");
        slot.pending = Some(held);
        true
    }

    /// Route triggers to `trigger` until [`detach`](Self::detach), first
    /// delivering whatever was held.
    pub fn attach(&self, trigger: ReloadTrigger) {
        let mut slot = self.slot();
        if let Some(kind) = slot.pending.take() {
            tracing::info!(trigger = %kind, "Delivering held trigger");
            trigger.fire(kind);
        }
        slot.current = Some(trigger);
    }

    pub fn detach(&self) {
        self.slot().current = None;
    }

    /// Whether a terminate was fired at any point of the run.
    pub fn terminate_requested(&self) -> bool {
        self.inner.terminate.load(Ordering::SeqCst)
    }

    /// Stop accepting triggers. Sources watching [`is_closed`](Self::is_closed)
    /// exit.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.detach();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Result handed to the supervisor once a generation has terminated.
#[derive(Debug)]
pub struct Completion {
    pub trigger: TriggerKind,
    pub report: ShutdownReport,
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    lifecycle: Lifecycle,
}

impl Coordinator {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    /// Spawn the coordinator task. The returned receiver resolves once the
    /// lifecycle is `Terminated`.
    pub fn await_termination<F, Fut>(
        self,
        triggers: TriggerReceiver,
        shutdown: F,
    ) -> oneshot::Receiver<Completion>
    where
        F: FnOnce(TriggerKind) -> Fut + Send + 'static,
        Fut: Future<Output = ShutdownReport> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let completion = self.coordinate(triggers, shutdown).await;
            if done_tx.send(completion).is_err() {
                tracing::warn!("Nobody is waiting for shutdown completion");
            }
        });
        done_rx
    }

    async fn coordinate<F, Fut>(self, mut triggers: TriggerReceiver, shutdown: F) -> Completion
    where
        F: FnOnce(TriggerKind) -> Fut,
        Fut: Future<Output = ShutdownReport>,
    {
        let bus = self.lifecycle.bus().clone();

        let trigger = match triggers.rx.recv().await {
            Some(kind) => kind,
            None => {
                tracing::warn!("Every trigger source is gone, terminating");
                TriggerKind::Terminate
            }
        };
        if !self.lifecycle.begin_shutdown() {
            // Shutdown was started elsewhere; nothing left to run.
            tracing::warn!(trigger = %trigger, "Trigger while already shutting down, discarding");
            bus.publish(EventKind::TriggerDiscarded(trigger));
            return Completion {
                trigger,
                report: ShutdownReport::default(),
            };
        }

        tracing::info!(trigger = %trigger, "Trigger accepted, shutting down");
        bus.publish(EventKind::TriggerAccepted(trigger));

        let sequence = shutdown(trigger);
        tokio::pin!(sequence);
        let report = loop {
            tokio::select! {
                report = &mut sequence => break report,
                Some(extra) = triggers.rx.recv() => {
                    tracing::warn!(trigger = %extra, "Trigger during shutdown, discarding");
                    bus.publish(EventKind::TriggerDiscarded(extra));
                }
            }
        };
        while let Ok(extra) = triggers.rx.try_recv() {
            tracing::warn!(trigger = %extra, "Trigger during shutdown, discarding");
            bus.publish(EventKind::TriggerDiscarded(extra));
        }

        if let Err(e) = self.lifecycle.advance(LifecycleState::Terminated) {
            tracing::error!(error = %e, "Could not mark lifecycle terminated");
        }
        Completion { trigger, report }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::events::{drain, EventBus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fire_collapses_into_single_slot() {
        let (trigger, _rx) = ReloadTrigger::channel();
        assert!(trigger.fire(TriggerKind::Terminate));
        assert!(!trigger.fire(TriggerKind::Terminate));
    }

    #[tokio::test]
    async fn test_first_trigger_wins() {
        let lifecycle = Lifecycle::new(EventBus::default());
        lifecycle.advance(LifecycleState::Running).unwrap();
        let mut events = lifecycle.bus().subscribe();

        let (trigger, rx) = ReloadTrigger::channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let done = Coordinator::new(lifecycle.clone()).await_termination(rx, move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            ShutdownReport::default()
        });

        trigger.fire(TriggerKind::Reload);
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            trigger.fire(TriggerKind::Terminate);
            tokio::task::yield_now().await;
        }

        let completion = done.await.unwrap();
        assert_eq!(completion.trigger, TriggerKind::Reload);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);

        let discarded = drain(&mut events)
            .iter()
            .filter(|e| matches!(e.kind, EventKind::TriggerDiscarded(_)))
            .count();
        assert!(discarded >= 1);
    }

    #[tokio::test]
    async fn test_dropped_sources_terminate() {
        let lifecycle = Lifecycle::new(EventBus::default());
        lifecycle.advance(LifecycleState::Running).unwrap();

        let (trigger, rx) = ReloadTrigger::channel();
        drop(trigger);
        let done = Coordinator::new(lifecycle.clone())
            .await_termination(rx, |_| async { ShutdownReport::default() });

        assert_eq!(done.await.unwrap().trigger, TriggerKind::Terminate);
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_relay_holds_triggers_between_generations() {
        let relay = TriggerRelay::new();
        assert!(relay.fire(TriggerKind::Reload));
        assert!(relay.fire(TriggerKind::Terminate));
        assert!(relay.fire(TriggerKind::Reload));

        let (trigger, mut rx) = ReloadTrigger::channel();
        relay.attach(trigger);
        assert_eq!(rx.rx.try_recv().ok(), Some(TriggerKind::Terminate));
        assert!(rx.rx.try_recv().is_err());
    }

    #[test]
    fn test_relay_terminate_is_sticky() {
        let relay = TriggerRelay::new();
        let (trigger, mut rx) = ReloadTrigger::channel();
        relay.attach(trigger);

        assert!(relay.fire(TriggerKind::Reload));
        // Slot occupied: the coordinator would discard this one.
        assert!(!relay.fire(TriggerKind::Terminate));
        assert!(relay.terminate_requested());
        assert_eq!(rx.rx.try_recv().ok(), Some(TriggerKind::Reload));

        relay.close();
        assert!(relay.is_closed());
        assert!(!relay.fire(TriggerKind::Reload));
    }
}

