//! Subscriber importer worker.
//!
//! Imports arrive as already-parsed rows. Each import is applied in one
//! transaction; rows without a plausible address are skipped. When an import
//! completes, `app.notify_emails` receive a status notification through the
//! campaign queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::ImporterConfig;
use crate::lifecycle::worker::{Worker, WorkerError};
use crate::messenger::{Message, EMAIL_MESSENGER};
use crate::services::campaign::{CampaignQueue, Dispatch};
use crate::services::templates::{NotifTemplates, IMPORT_STATUS};
use crate::storage::queries::{self, Queries, QueryError};
use crate::storage::StoragePool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ImportJob {
    pub name: String,
    pub rows: Vec<ImportRow>,
    /// Update the name of subscribers that already exist.
    pub overwrite: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("import queue is closed")]
    QueueClosed,

    #[error("import queue is full")]
    QueueFull,

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Producer side of the import queue.
#[derive(Debug, Clone)]
pub struct ImportQueue {
    tx: mpsc::Sender<ImportJob>,
}

impl ImportQueue {
    /// Queue `job` without waiting. Imports are rejected while the importer
    /// is saturated.
    pub fn submit(&self, job: ImportJob) -> Result<(), ImportError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ImportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ImportError::QueueClosed,
        })
    }
}

pub struct Importer {
    rx: Mutex<mpsc::Receiver<ImportJob>>,
    pool: Arc<StoragePool>,
    queries: Arc<Queries>,
    templates: Arc<NotifTemplates>,
    campaigns: CampaignQueue,
    notify_emails: Vec<String>,
}

impl Importer {
    pub fn new(
        config: &ImporterConfig,
        pool: Arc<StoragePool>,
        queries: Arc<Queries>,
        templates: Arc<NotifTemplates>,
        campaigns: CampaignQueue,
        notify_emails: Vec<String>,
    ) -> (Arc<Self>, ImportQueue) {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let importer = Arc::new(Self {
            rx: Mutex::new(rx),
            pool,
            queries,
            templates,
            campaigns,
            notify_emails,
        });
        (importer, ImportQueue { tx })
    }

    /// Apply one import in a single transaction.
    pub async fn import(&self, job: &ImportJob) -> Result<ImportSummary, ImportError> {
        let name = if job.overwrite {
            queries::UPSERT_SUBSCRIBER
        } else {
            queries::INSERT_SUBSCRIBER
        };
        let sql = self.queries.get(name)?.to_string();
        let rows = job.rows.clone();

        let summary = self
            .pool
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut summary = ImportSummary::default();
                {
                    let mut stmt = tx.prepare_cached(&sql)?;
                    for row in &rows {
                        let email = row.email.trim().to_lowercase();
                        if !is_plausible_email(&email) {
                            summary.skipped += 1;
                            continue;
                        }
                        match stmt.execute(rusqlite::params![email, row.name.trim()])? {
                            0 => summary.skipped += 1,
                            _ => summary.imported += 1,
                        }
                    }
                }
                tx.commit()?;
                Ok(summary)
            })
            .await
            .map_err(QueryError::from)?;
        Ok(summary)
    }

    async fn notify(&self, job: &ImportJob, summary: ImportSummary) {
        if self.notify_emails.is_empty() {
            return;
        }
        let imported = summary.imported.to_string();
        let skipped = summary.skipped.to_string();
        let body = match self.templates.render(
            IMPORT_STATUS,
            &[
                ("name", job.name.as_str()),
                ("imported", imported.as_str()),
                ("skipped", skipped.as_str()),
            ],
        ) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to render import notification");
                return;
            }
        };

        let message = Message::new(
            self.notify_emails.clone(),
            format!("Import {} finished", job.name),
            body,
        );
        let item = Dispatch::Send {
            messenger: EMAIL_MESSENGER.to_string(),
            message,
        };
        if let Err(e) = self.campaigns.try_enqueue(item) {
            tracing::warn!(import = %job.name, error = %e, "Import notification dropped");
        }
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}

#[async_trait]
impl Worker for Importer {
    fn name(&self) -> &str {
        "importer"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut rx = self.rx.lock().await;
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match self.import(&job).await {
                Ok(summary) => {
                    tracing::info!(
                        import = %job.name,
                        imported = summary.imported,
                        skipped = summary.skipped,
                        "Import finished"
                    );
                    self.notify(&job, summary).await;
                }
                Err(e) => tracing::error!(import = %job.name, error = %e, "Import failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CampaignConfig, DbConfig};
    use crate::messenger::MessengerRegistry;
    use crate::services::campaign::CampaignManager;
    use crate::storage::schema;

    fn row(email: &str, name: &str) -> ImportRow {
        ImportRow {
            email: email.into(),
            name: name.into(),
        }
    }

    async fn importer(dir: &tempfile::TempDir) -> (Arc<Importer>, Arc<StoragePool>) {
        let pool = StoragePool::open(&DbConfig {
            path: dir.path().join("import.db").display().to_string(),
            max_open: 2,
            ..DbConfig::default()
        })
        .unwrap();
        schema::install(&pool, false).await.unwrap();
        let pool = Arc::new(pool);
        let queries = Queries::load(None).unwrap().prepare(&pool).await.unwrap();
        let templates = Arc::new(NotifTemplates::load(None).unwrap());
        let (_manager, campaigns) = CampaignManager::new(
            &CampaignConfig::default(),
            Arc::new(MessengerRegistry::new()),
            pool.clone(),
            queries.clone(),
            templates.clone(),
            Vec::new(),
        );
        let (importer, _queue) = Importer::new(
            &ImporterConfig::default(),
            pool.clone(),
            queries,
            templates,
            campaigns,
            Vec::new(),
        );
        (importer, pool)
    }

    #[test]
    fn test_plausible_email() {
        assert!(is_plausible_email("a@example.com"));
        assert!(!is_plausible_email("example.com"));
        assert!(!is_plausible_email("@example.com"));
        assert!(!is_plausible_email("a@localhost"));
    }

    #[tokio::test]
    async fn test_import_skips_invalid_and_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (importer, pool) = importer(&dir).await;

        let job = ImportJob {
            name: "first".into(),
            rows: vec![row("A@Example.com", "Ann"), row("broken", "Bob"), row("c@example.com", "Cy")],
            overwrite: false,
        };
        assert_eq!(
            importer.import(&job).await.unwrap(),
            ImportSummary { imported: 2, skipped: 1 }
        );

        // Re-importing without overwrite leaves existing rows alone.
        let again = ImportJob {
            name: "second".into(),
            rows: vec![row("a@example.com", "Annie")],
            overwrite: false,
        };
        assert_eq!(
            importer.import(&again).await.unwrap(),
            ImportSummary { imported: 0, skipped: 1 }
        );

        let overwrite = ImportJob { overwrite: true, ..again };
        assert_eq!(importer.import(&overwrite).await.unwrap().imported, 1);

        let name: String = pool
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT name FROM subscribers WHERE email = 'a@example.com'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(name, "Annie");
    }
}
