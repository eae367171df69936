//! Bounded SQLite connection pool.
//!
//! # Responsibilities
//! - Open `db.max_open` connections up front (fail fast on a bad path)
//! - Hand out one connection per call, run the closure on the blocking pool
//! - A checked-out connection returns to the pool when the blocking call
//!   finishes, even if the caller stopped waiting or the closure panicked
//! - On close: stop admitting callers, wait for checked-out connections to
//!   come back (bounded), then close every connection

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DbConfig;
use crate::lifecycle::subsystem::{StopError, Subsystem};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage pool is closed")]
    Closed,

    #[error("database is not installed")]
    NotInstalled,

    #[error("database is already installed (schema v{0})")]
    AlreadyInstalled(i64),

    #[error("timed out waiting for {0} connection(s) to be returned")]
    Busy(usize),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct StoragePool {
    path: String,
    size: usize,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
}

/// One checked-out connection. Dropping it puts the connection back on the
/// idle list before the permit is released.
struct Checkout {
    conn: Option<Connection>,
    idle: Arc<Mutex<Vec<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(conn);
        }
    }
}

impl StoragePool {
    /// Open every connection of the pool.
    pub fn open(config: &DbConfig) -> Result<Self, StorageError> {
        let size = config.max_open.max(1);
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(&config.path)?;
            conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conns.push(conn);
        }
        if let Some(first) = conns.first() {
            let mode: String =
                first.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!(journal_mode = %mode, "Journal mode set");
        }

        tracing::info!(path = %config.path, connections = size, "Storage pool opened");

        Ok(Self {
            path: config.path.clone(),
            size,
            idle: Arc::new(Mutex::new(conns)),
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Closed)?;
        let conn = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(StorageError::Closed)?;
        let mut checkout = Checkout {
            conn: Some(conn),
            idle: self.idle.clone(),
            _permit: permit,
        };

        // The checkout moves into the blocking task, so the connection comes
        // back when the task ends, not when this future is dropped.
        tokio::task::spawn_blocking(move || match checkout.conn.as_mut() {
            Some(conn) => f(conn),
            None => Err(StorageError::Closed),
        })
        .await?
    }

    /// Close the pool. Connections still checked out after `deadline` are
    /// closed when their blocking call finishes and the pool is dropped.
    pub async fn close(&self, deadline: Duration) -> Result<(), StorageError> {
        if self.permits.is_closed() {
            return Ok(());
        }

        let drained = tokio::time::timeout(deadline, self.permits.acquire_many(self.size as u32))
            .await
            .ok()
            .and_then(Result::ok);
        self.permits.close();

        let conns = std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner));
        let outstanding = self.size.saturating_sub(conns.len());
        for conn in conns {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "Failed to close database connection");
            }
        }
        drop(drained);

        if outstanding > 0 {
            return Err(StorageError::Busy(outstanding));
        }
        tracing::info!(path = %self.path, "Storage pool closed");
        Ok(())
    }
}

#[async_trait]
impl Subsystem for StoragePool {
    fn name(&self) -> &str {
        "storage"
    }

    async fn stop(&self, deadline: Duration) -> Result<(), StopError> {
        match self.close(deadline).await {
            Ok(()) => Ok(()),
            Err(StorageError::Busy(_)) => Err(StopError::DeadlineExceeded {
                name: "storage".to_string(),
                deadline,
            }),
            Err(e) => Err(StopError::Failed {
                name: "storage".to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for StoragePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePool")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}
