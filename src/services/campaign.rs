//! Campaign dispatch worker.
//!
//! Producers (the scheduler, the importer's notifications) push
//! [`Dispatch`] items onto a bounded queue. The worker pops one item at a
//! time, looks the messenger up in the registry and delivers with retries.
//! Cancellation is only observed between items, so the message in hand is
//! always finished (or its retries abandoned) before the loop exits.
//!
//! When a campaign's `Finish` marker comes through, `app.notify_emails`
//! get a status message rendered from the `campaign-status` template.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::CampaignConfig;
use crate::lifecycle::worker::{Worker, WorkerError};
use crate::messenger::{Message, MessengerRegistry, EMAIL_MESSENGER};
use crate::resilience::RetryPolicy;
use crate::services::templates::{NotifTemplates, CAMPAIGN_STATUS};
use crate::storage::queries::{self, Queries, QueryError};
use crate::storage::StoragePool;

/// Work item for the campaign worker.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Deliver `message` through the messenger named `messenger`.
    Send { messenger: String, message: Message },
    /// Every message of the campaign has been queued.
    Finish { campaign_id: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("campaign queue is closed")]
    QueueClosed,

    #[error("campaign queue is full")]
    QueueFull,

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Delivery counters, shared with the HTTP `about` endpoint.
#[derive(Debug, Default)]
pub struct CampaignStats {
    queued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CampaignCounters {
    pub queued: u64,
    pub sent: u64,
    pub failed: u64,
}

impl CampaignStats {
    pub fn snapshot(&self) -> CampaignCounters {
        CampaignCounters {
            queued: self.queued.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable producer side of the campaign queue.
#[derive(Debug, Clone)]
pub struct CampaignQueue {
    tx: mpsc::Sender<Dispatch>,
    stats: Arc<CampaignStats>,
}

impl CampaignQueue {
    /// Queue `item`, waiting for room if the queue is full.
    pub async fn enqueue(&self, item: Dispatch) -> Result<(), CampaignError> {
        let is_send = matches!(item, Dispatch::Send { .. });
        self.tx
            .send(item)
            .await
            .map_err(|_| CampaignError::QueueClosed)?;
        if is_send {
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Queue `item` without waiting.
    pub fn try_enqueue(&self, item: Dispatch) -> Result<(), CampaignError> {
        let is_send = matches!(item, Dispatch::Send { .. });
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CampaignError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => CampaignError::QueueClosed,
        })?;
        if is_send {
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

pub struct CampaignManager {
    rx: Mutex<mpsc::Receiver<Dispatch>>,
    registry: Arc<MessengerRegistry>,
    pool: Arc<StoragePool>,
    queries: Arc<Queries>,
    retry: RetryPolicy,
    stats: Arc<CampaignStats>,
    templates: Arc<NotifTemplates>,
    notify_emails: Vec<String>,
}

impl CampaignManager {
    pub fn new(
        config: &CampaignConfig,
        registry: Arc<MessengerRegistry>,
        pool: Arc<StoragePool>,
        queries: Arc<Queries>,
        templates: Arc<NotifTemplates>,
        notify_emails: Vec<String>,
    ) -> (Arc<Self>, CampaignQueue) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let stats = Arc::new(CampaignStats::default());
        let manager = Arc::new(Self {
            rx: Mutex::new(rx),
            registry,
            pool,
            queries,
            retry: RetryPolicy::from(config),
            stats: stats.clone(),
            templates,
            notify_emails,
        });
        (manager, CampaignQueue { tx, stats })
    }

    pub fn stats(&self) -> Arc<CampaignStats> {
        self.stats.clone()
    }

    async fn handle(&self, item: Dispatch, shutdown: &CancellationToken) {
        match item {
            Dispatch::Send { messenger, message } => {
                self.deliver(&messenger, message, shutdown).await
            }
            Dispatch::Finish { campaign_id } => {
                if let Err(e) = self.set_status(campaign_id, "finished").await {
                    tracing::error!(campaign_id, error = %e, "Failed to finish campaign");
                } else {
                    tracing::info!(campaign_id, "Campaign finished");
                    self.notify(campaign_id, shutdown).await;
                }
            }
        }
    }

    async fn deliver(&self, name: &str, message: Message, shutdown: &CancellationToken) {
        let messenger = match self.registry.get(name) {
            Ok(m) => m,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(messenger = %name, message_id = %message.id, error = %e, "No messenger for message");
                return;
            }
        };

        let (result, attempts) = self
            .retry
            .run(shutdown, || messenger.send(&message))
            .await;
        match result {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                if let Some(campaign_id) = message.campaign_id {
                    if let Err(e) = self.count_sent(campaign_id).await {
                        tracing::warn!(campaign_id, error = %e, "Failed to record sent message");
                    }
                }
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    messenger = %name,
                    message_id = %message.id,
                    attempts,
                    error = %e,
                    "Message delivery failed"
                );
            }
        }
    }

    async fn notify(&self, campaign_id: i64, shutdown: &CancellationToken) {
        if self.notify_emails.is_empty() {
            return;
        }
        let (name, sent) = match self.campaign(campaign_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(campaign_id, error = %e, "Failed to load finished campaign");
                return;
            }
        };
        let sent = sent.to_string();
        let body = match self.templates.render(
            CAMPAIGN_STATUS,
            &[
                ("name", name.as_str()),
                ("status", "finished"),
                ("sent", sent.as_str()),
            ],
        ) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to render campaign notification");
                return;
            }
        };

        // Sent inline: this worker is the queue's only consumer.
        let message = Message::new(
            self.notify_emails.clone(),
            format!("Campaign {} finished", name),
            body,
        );
        self.deliver(EMAIL_MESSENGER, message, shutdown).await;
    }

    async fn campaign(&self, campaign_id: i64) -> Result<Option<(String, i64)>, QueryError> {
        let sql = self.queries.get(queries::GET_CAMPAIGN)?.to_string();
        let row = self
            .pool
            .with_conn(move |conn| {
                Ok(conn
                    .prepare_cached(&sql)?
                    .query_row([campaign_id], |r| Ok((r.get(0)?, r.get(1)?)))
                    .optional()?)
            })
            .await?;
        Ok(row)
    }

    async fn count_sent(&self, campaign_id: i64) -> Result<(), QueryError> {
        let sql = self.queries.get(queries::INCREMENT_CAMPAIGN_SENT)?.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.prepare_cached(&sql)?.execute([campaign_id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn set_status(&self, campaign_id: i64, status: &'static str) -> Result<(), QueryError> {
        let sql = self.queries.get(queries::UPDATE_CAMPAIGN_STATUS)?.to_string();
        self.pool
            .with_conn(move |conn| {
                conn.prepare_cached(&sql)?
                    .execute(rusqlite::params![campaign_id, status])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for CampaignManager {
    fn name(&self) -> &str {
        "campaign-manager"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut rx = self.rx.lock().await;
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            self.handle(item, &shutdown).await;
        }

        let pending = rx.len();
        if pending > 0 {
            tracing::warn!(pending, "Campaign worker stopping with undelivered messages");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::lifecycle::subsystem::Subsystem;
    use crate::lifecycle::worker::WorkerTask;
    use crate::messenger::{Messenger, MessengerError};
    use crate::storage::schema;
    use std::time::Duration;

    struct Recorder {
        sent: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Messenger for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, message: &Message) -> Result<(), MessengerError> {
            self.sent.lock().unwrap().push(message.to.join(","));
            Ok(())
        }

        async fn close(&self) -> Result<(), MessengerError> {
            Ok(())
        }
    }

    async fn setup(dir: &tempfile::TempDir) -> (Arc<StoragePool>, Arc<Queries>) {
        let pool = StoragePool::open(&DbConfig {
            path: dir.path().join("campaign.db").display().to_string(),
            max_open: 2,
            ..DbConfig::default()
        })
        .unwrap();
        schema::install(&pool, false).await.unwrap();
        let pool = Arc::new(pool);
        let queries = Queries::load(None).unwrap().prepare(&pool).await.unwrap();
        (pool, queries)
    }

    fn templates() -> Arc<NotifTemplates> {
        Arc::new(NotifTemplates::load(None).unwrap())
    }

    #[tokio::test]
    async fn test_delivers_queued_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, queries) = setup(&dir).await;
        let registry = Arc::new(MessengerRegistry::new());
        let recorder = Arc::new(Recorder {
            sent: std::sync::Mutex::new(Vec::new()),
        });
        registry.register("recorder", recorder.clone()).await.unwrap();

        let (manager, queue) = CampaignManager::new(
            &CampaignConfig::default(),
            registry,
            pool,
            queries,
            templates(),
            Vec::new(),
        );
        let stats = manager.stats();
        let task = WorkerTask::spawn(manager);

        for to in ["a@example.com", "b@example.com"] {
            queue
                .enqueue(Dispatch::Send {
                    messenger: "recorder".into(),
                    message: Message::new(vec![to.into()], "s", "b"),
                })
                .await
                .unwrap();
        }
        queue
            .enqueue(Dispatch::Send {
                messenger: "missing".into(),
                message: Message::new(vec!["c@example.com".into()], "s", "b"),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while stats.snapshot().sent + stats.snapshot().failed < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        task.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            stats.snapshot(),
            CampaignCounters {
                queued: 3,
                sent: 2,
                failed: 1
            }
        );
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finish_marks_campaign_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, queries) = setup(&dir).await;
        let create = queries.get(queries::CREATE_CAMPAIGN).unwrap().to_string();
        let campaign_id = pool
            .with_conn(move |conn| {
                conn.execute(&create, rusqlite::params!["weekly", "s", "b", "email"])?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .unwrap();

        let registry = Arc::new(MessengerRegistry::new());
        let recorder = Arc::new(Recorder {
            sent: std::sync::Mutex::new(Vec::new()),
        });
        registry.register(EMAIL_MESSENGER, recorder.clone()).await.unwrap();

        let (manager, queue) = CampaignManager::new(
            &CampaignConfig::default(),
            registry,
            pool.clone(),
            queries,
            templates(),
            vec!["admin@example.com".into()],
        );
        let task = WorkerTask::spawn(manager);

        queue
            .enqueue(Dispatch::Send {
                messenger: EMAIL_MESSENGER.into(),
                message: Message::new(vec!["a@example.com".into()], "s", "b")
                    .with_campaign(campaign_id),
            })
            .await
            .unwrap();
        queue.enqueue(Dispatch::Finish { campaign_id }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.sent.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        task.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            *recorder.sent.lock().unwrap(),
            vec!["a@example.com".to_string(), "admin@example.com".to_string()]
        );
        let (status, sent): (String, i64) = pool
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    "SELECT status, sent FROM campaigns WHERE id = ?1",
                    [campaign_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!((status.as_str(), sent), ("finished", 1));
    }

    #[tokio::test]
    async fn test_stops_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, queries) = setup(&dir).await;
        let (manager, queue) = CampaignManager::new(
            &CampaignConfig::default(),
            Arc::new(MessengerRegistry::new()),
            pool,
            queries,
            templates(),
            Vec::new(),
        );
        let task = WorkerTask::spawn(manager);
        task.stop(Duration::from_millis(500)).await.unwrap();
        assert!(task.is_finished());

        // Producers see the closed queue once the worker is gone.
        assert!(matches!(
            queue.try_enqueue(Dispatch::Finish { campaign_id: 1 }),
            Err(CampaignError::QueueClosed)
        ));
    }
}
