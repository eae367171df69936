//! Process lifecycle state.
//!
//! Exactly one [`Lifecycle`] exists per server generation. It guards the
//! [`LifecycleState`] and the [`PendingUpdate`] descriptor with a single
//! mutex. The lock is held only for the read or write itself, never across an
//! `.await`, so unrelated subsystem shutdowns never queue behind it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::events::{EventBus, EventKind};

/// Lifecycle phases. Ordering follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// A newer release discovered by the update checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub version: String,
    pub url: String,
    pub checked_at: DateTime<Utc>,
}

/// Rejected state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid lifecycle transition from {from} to {to}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

#[derive(Debug)]
struct Shared {
    state: LifecycleState,
    pending_update: Option<PendingUpdate>,
}

/// Shared, lock-protected lifecycle state.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    shared: Arc<Mutex<Shared>>,
    bus: EventBus,
}

impl Lifecycle {
    /// A fresh lifecycle in `Starting`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: LifecycleState::Starting,
                pending_update: None,
            })),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bus lifecycle events are published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Move strictly forward to `to`. Skipping states is allowed.
    pub fn advance(&self, to: LifecycleState) -> Result<(), TransitionError> {
        {
            let mut shared = self.lock();
            if to <= shared.state {
                return Err(TransitionError {
                    from: shared.state,
                    to,
                });
            }
            shared.state = to;
        }
        tracing::info!(state = %to, "Lifecycle state changed");
        self.bus.publish(EventKind::StateChanged(to));
        Ok(())
    }

    /// Enter `ShuttingDown`. Returns `false` if shutdown already began, so
    /// exactly one caller wins.
    pub fn begin_shutdown(&self) -> bool {
        self.advance(LifecycleState::ShuttingDown).is_ok()
    }

    pub fn set_pending_update(&self, update: Option<PendingUpdate>) {
        self.lock().pending_update = update;
    }

    /// A copy of the pending update descriptor.
    pub fn pending_update(&self) -> Option<PendingUpdate> {
        self.lock().pending_update.clone()
    }

    /// State and pending update read under one lock acquisition.
    pub fn snapshot(&self) -> (LifecycleState, Option<PendingUpdate>) {
        let shared = self.lock();
        (shared.state, shared.pending_update.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let lifecycle = Lifecycle::new(EventBus::default());
        assert_eq!(lifecycle.state(), LifecycleState::Starting);

        lifecycle.advance(LifecycleState::Running).unwrap();
        assert_eq!(
            lifecycle.advance(LifecycleState::Starting),
            Err(TransitionError {
                from: LifecycleState::Running,
                to: LifecycleState::Starting
            })
        );
        assert!(lifecycle.advance(LifecycleState::Running).is_err());

        lifecycle.advance(LifecycleState::Terminated).unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn test_begin_shutdown_has_one_winner() {
        let lifecycle = Lifecycle::new(EventBus::default());
        lifecycle.advance(LifecycleState::Running).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = lifecycle.clone();
                std::thread::spawn(move || lifecycle.begin_shutdown())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
    }

    #[test]
    fn test_pending_update_is_copied_out() {
        let lifecycle = Lifecycle::new(EventBus::default());
        assert!(lifecycle.pending_update().is_none());

        let update = PendingUpdate {
            version: "1.2.0".into(),
            url: "https://example.com/releases/1.2.0".into(),
            checked_at: Utc::now(),
        };
        lifecycle.set_pending_update(Some(update.clone()));

        let (state, pending) = lifecycle.snapshot();
        assert_eq!(state, LifecycleState::Starting);
        assert_eq!(pending, Some(update));
    }
}
