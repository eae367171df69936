//! Bounce processor worker.
//!
//! Records each reported bounce and, once a subscriber reaches the configured
//! count for that bounce kind, applies the configured action.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{BounceAction, BounceConfig, BounceRule};
use crate::lifecycle::worker::{Worker, WorkerError};
use crate::storage::queries::{self, Queries, QueryError};
use crate::storage::StoragePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceKind {
    Soft,
    Hard,
    Complaint,
}

impl BounceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceKind::Soft => "soft",
            BounceKind::Hard => "hard",
            BounceKind::Complaint => "complaint",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bounce {
    pub email: String,
    pub kind: BounceKind,
    /// Where the bounce was reported from (mailbox, webhook name).
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BounceError {
    #[error("bounce queue is closed")]
    QueueClosed,

    #[error("bounce queue is full")]
    QueueFull,

    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone)]
pub struct BounceQueue {
    tx: mpsc::Sender<Bounce>,
}

impl BounceQueue {
    pub fn record(&self, bounce: Bounce) -> Result<(), BounceError> {
        self.tx.try_send(bounce).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BounceError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BounceError::QueueClosed,
        })
    }
}

pub struct BounceProcessor {
    rx: Mutex<mpsc::Receiver<Bounce>>,
    pool: Arc<StoragePool>,
    queries: Arc<Queries>,
    config: BounceConfig,
}

impl BounceProcessor {
    pub fn new(
        config: &BounceConfig,
        pool: Arc<StoragePool>,
        queries: Arc<Queries>,
    ) -> (Arc<Self>, BounceQueue) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let processor = Arc::new(Self {
            rx: Mutex::new(rx),
            pool,
            queries,
            config: config.clone(),
        });
        (processor, BounceQueue { tx })
    }

    fn rule(&self, kind: BounceKind) -> &BounceRule {
        match kind {
            BounceKind::Soft => &self.config.actions.soft,
            BounceKind::Hard => &self.config.actions.hard,
            BounceKind::Complaint => &self.config.actions.complaint,
        }
    }

    /// Record `bounce` and apply the threshold action. Returns the action
    /// taken, if any.
    pub async fn process(&self, bounce: &Bounce) -> Result<Option<BounceAction>, BounceError> {
        let rule = self.rule(bounce.kind).clone();
        let action_sql = match rule.action {
            BounceAction::None => None,
            BounceAction::Blocklist => Some(self.queries.get(queries::BLOCKLIST_SUBSCRIBER)?),
            BounceAction::Delete => Some(self.queries.get(queries::DELETE_SUBSCRIBER)?),
        }
        .map(str::to_string);
        let record_sql = self.queries.get(queries::RECORD_BOUNCE)?.to_string();
        let count_sql = self.queries.get(queries::COUNT_BOUNCES)?.to_string();
        let bounce = bounce.clone();

        let taken = self
            .pool
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let email = bounce.email.trim().to_lowercase();
                let kind = bounce.kind.as_str();
                tx.prepare_cached(&record_sql)?
                    .execute(rusqlite::params![email, kind, bounce.source])?;
                let count: u32 = tx
                    .prepare_cached(&count_sql)?
                    .query_row(rusqlite::params![email, kind], |row| row.get(0))?;

                let mut taken = None;
                if let Some(sql) = action_sql {
                    if count >= rule.count {
                        tx.prepare_cached(&sql)?.execute([&email])?;
                        taken = Some(rule.action);
                    }
                }
                tx.commit()?;
                Ok(taken)
            })
            .await
            .map_err(QueryError::from)?;
        Ok(taken)
    }
}

#[async_trait]
impl Worker for BounceProcessor {
    fn name(&self) -> &str {
        "bounce-processor"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut rx = self.rx.lock().await;
        loop {
            let bounce = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                bounce = rx.recv() => match bounce {
                    Some(bounce) => bounce,
                    None => break,
                },
            };

            match self.process(&bounce).await {
                Ok(Some(action)) => {
                    tracing::info!(email = %bounce.email, kind = bounce.kind.as_str(), ?action, "Bounce threshold reached")
                }
                Ok(None) => tracing::debug!(email = %bounce.email, kind = bounce.kind.as_str(), "Bounce recorded"),
                Err(e) => tracing::error!(email = %bounce.email, error = %e, "Failed to process bounce"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::storage::schema;

    async fn setup(dir: &tempfile::TempDir) -> (Arc<BounceProcessor>, Arc<StoragePool>) {
        let pool = StoragePool::open(&DbConfig {
            path: dir.path().join("bounce.db").display().to_string(),
            max_open: 1,
            ..DbConfig::default()
        })
        .unwrap();
        schema::install(&pool, false).await.unwrap();
        pool.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscribers (email, name) VALUES ('a@example.com', 'A'), ('b@example.com', 'B')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let pool = Arc::new(pool);
        let queries = Queries::load(None).unwrap().prepare(&pool).await.unwrap();

        let mut config = BounceConfig::default();
        config.actions.soft = BounceRule { count: 2, action: BounceAction::Blocklist };
        config.actions.hard = BounceRule { count: 1, action: BounceAction::Delete };
        let (processor, _queue) = BounceProcessor::new(&config, pool.clone(), queries);
        (processor, pool)
    }

    fn bounce(email: &str, kind: BounceKind) -> Bounce {
        Bounce {
            email: email.into(),
            kind,
            source: "test".into(),
        }
    }

    async fn status(pool: &StoragePool, email: &'static str) -> Option<String> {
        pool.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT status FROM subscribers WHERE email = ?1")?;
            let mut rows = stmt.query([email])?;
            Ok(match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            })
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_soft_bounces_blocklist_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, pool) = setup(&dir).await;

        let first = processor.process(&bounce("a@example.com", BounceKind::Soft)).await.unwrap();
        assert_eq!(first, None);
        assert_eq!(status(&pool, "a@example.com").await.as_deref(), Some("enabled"));

        let second = processor.process(&bounce("a@example.com", BounceKind::Soft)).await.unwrap();
        assert_eq!(second, Some(BounceAction::Blocklist));
        assert_eq!(status(&pool, "a@example.com").await.as_deref(), Some("blocklisted"));
    }

    #[tokio::test]
    async fn test_hard_bounce_deletes_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, pool) = setup(&dir).await;

        let taken = processor.process(&bounce("b@example.com", BounceKind::Hard)).await.unwrap();
        assert_eq!(taken, Some(BounceAction::Delete));
        assert_eq!(status(&pool, "b@example.com").await, None);
    }
}
