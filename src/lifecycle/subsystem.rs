//! Uniform ownership record for long-lived background services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::lifecycle::events::EventKind;
use crate::lifecycle::state::{Lifecycle, LifecycleState};

/// Slack past a subsystem's own deadline before the handle gives up on it,
/// so a subsystem enforcing the same deadline gets to clean up first.
pub const STOP_GRACE: Duration = Duration::from_millis(100);

/// Error returned when stopping a subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("{0} cannot be stopped while the process is still starting")]
    StillStarting(String),

    #[error("{name} did not stop within {deadline:?}")]
    DeadlineExceeded { name: String, deadline: Duration },

    #[error("{name} failed to stop: {reason}")]
    Failed { name: String, reason: String },
}

/// A background service the lifecycle controller owns.
#[async_trait]
pub trait Subsystem: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Stop the service, giving it at most `deadline` to finish.
    async fn stop(&self, deadline: Duration) -> Result<(), StopError>;
}

/// Owned handle around a [`Subsystem`].
///
/// The first `stop` call reaches the subsystem; later calls return `Ok(())`
/// without touching it. `stop` refuses to run while the lifecycle is still
/// `Starting` and never outlives its deadline (plus [`STOP_GRACE`]), even if
/// the subsystem ignores it.
pub struct SubsystemHandle {
    name: String,
    inner: Arc<dyn Subsystem>,
    stopped: AtomicBool,
    lifecycle: Lifecycle,
}

impl SubsystemHandle {
    pub fn new(inner: Arc<dyn Subsystem>, lifecycle: &Lifecycle) -> Self {
        let name = inner.name().to_string();
        lifecycle
            .bus()
            .publish(EventKind::SubsystemStarted(name.clone()));
        tracing::debug!(subsystem = %name, "Subsystem handle recorded");
        Self {
            name,
            inner,
            stopped: AtomicBool::new(false),
            lifecycle: lifecycle.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn stop(&self, deadline: Duration) -> Result<(), StopError> {
        if self.lifecycle.state() == LifecycleState::Starting {
            return Err(StopError::StillStarting(self.name.clone()));
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bus = self.lifecycle.bus();
        bus.publish(EventKind::StopRequested(self.name.clone()));
        tracing::debug!(subsystem = %self.name, ?deadline, "Stopping subsystem");

        let stop = self.inner.stop(deadline);
        let result = match tokio::time::timeout(deadline + STOP_GRACE, stop).await {
            Ok(result) => result,
            Err(_) => Err(StopError::DeadlineExceeded {
                name: self.name.clone(),
                deadline,
            }),
        };

        match &result {
            Ok(()) => {
                tracing::info!(subsystem = %self.name, "Subsystem stopped");
                bus.publish(EventKind::SubsystemStopped(self.name.clone()));
            }
            Err(StopError::DeadlineExceeded { .. }) => {
                tracing::warn!(subsystem = %self.name, ?deadline, "Subsystem stop deadline exceeded, abandoning");
                bus.publish(EventKind::StopTimedOut(self.name.clone()));
            }
            Err(e) => {
                tracing::error!(subsystem = %self.name, error = %e, "Subsystem failed to stop");
                bus.publish(EventKind::StopFailed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }
}

impl std::fmt::Debug for SubsystemHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemHandle")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::events::EventBus;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Subsystem for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn stop(&self, _deadline: Duration) -> Result<(), StopError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait]
    impl Subsystem for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn stop(&self, _deadline: Duration) -> Result<(), StopError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stop_runs_once() {
        let lifecycle = Lifecycle::new(EventBus::default());
        let inner = Arc::new(Counting {
            stops: AtomicUsize::new(0),
        });
        let handle = SubsystemHandle::new(inner.clone(), &lifecycle);

        assert_eq!(
            handle.stop(Duration::from_secs(1)).await,
            Err(StopError::StillStarting("counting".into()))
        );
        assert!(!handle.is_stopped());

        lifecycle.advance(LifecycleState::ShuttingDown).unwrap();
        handle.stop(Duration::from_secs(1)).await.unwrap();
        handle.stop(Duration::from_secs(1)).await.unwrap();

        assert!(handle.is_stopped());
        assert_eq!(inner.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_bounded_by_deadline() {
        let lifecycle = Lifecycle::new(EventBus::default());
        lifecycle.advance(LifecycleState::ShuttingDown).unwrap();
        let handle = SubsystemHandle::new(Arc::new(Stuck), &lifecycle);

        let started = std::time::Instant::now();
        let result = handle.stop(Duration::from_millis(50)).await;

        assert!(matches!(result, Err(StopError::DeadlineExceeded { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
