//! Background workers running on their own task.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::subsystem::{StopError, Subsystem};

/// Error a worker loop exits with.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A long-lived loop. `run` returns only once `shutdown` is cancelled or on
/// an unrecoverable fault.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError>;
}

/// A spawned [`Worker`]. Stopping it cancels the worker's token and waits for
/// the loop to return; past the deadline the task is aborted.
pub struct WorkerTask {
    name: String,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<Result<(), WorkerError>>>>,
}

impl WorkerTask {
    /// Spawn `worker` on the current runtime.
    pub fn spawn<W: Worker>(worker: Arc<W>) -> Arc<Self> {
        let name = worker.name().to_string();
        let token = CancellationToken::new();

        let task_name = name.clone();
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            tracing::info!(worker = %task_name, "Worker started");
            let result = worker.run(task_token).await;
            match &result {
                Ok(()) => tracing::info!(worker = %task_name, "Worker exited"),
                Err(e) => tracing::error!(worker = %task_name, error = %e, "Worker exited with error"),
            }
            result
        });

        Arc::new(Self {
            name,
            token,
            join: Mutex::new(Some(join)),
        })
    }

    /// Whether the worker loop has returned.
    pub fn is_finished(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |join| join.is_finished())
    }
}

#[async_trait]
impl Subsystem for WorkerTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self, deadline: Duration) -> Result<(), StopError> {
        self.token.cancel();

        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut join) = join else {
            return Ok(());
        };

        match tokio::time::timeout(deadline, &mut join).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(StopError::Failed {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            Ok(Err(e)) => Err(StopError::Failed {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                join.abort();
                Err(StopError::DeadlineExceeded {
                    name: self.name.clone(),
                    deadline,
                })
            }
        }
    }
}
