//! Periodic-job subsystem.
//!
//! # Data Flow
//! ```text
//! [[jobs]] (enabled only)
//!     → Scheduler::new (constructed during bootstrap, idle)
//!     → Scheduler::start (once the lifecycle is Running; one task per job)
//!     → each run: campaign row → one Dispatch per active subscriber
//!       → Finish marker → job_runs row
//!
//! Shutdown (first step of the shutdown plan):
//!     token cancelled → no new run is admitted → tasks joined (bounded)
//! ```
//!
//! # Design Decisions
//! - Cancellation is checked before every run, ahead of the timer
//! - Stopping a scheduler that never started is a no-op

pub mod job;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::subsystem::{StopError, Subsystem};
use crate::messenger::Message;
use crate::services::campaign::{CampaignError, CampaignQueue, Dispatch};
use crate::storage::queries::{self, Queries, QueryError};
use crate::storage::StoragePool;

pub use job::{JobConfig, JobSchedule};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler was stopped before it started")]
    Stopped,

    #[error("unknown job `{0}`")]
    UnknownJob(String),

    #[error("job cancelled after queueing {0} message(s)")]
    Cancelled(usize),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Campaign(#[from] CampaignError),
}

struct Inner {
    jobs: Vec<JobConfig>,
    pool: Arc<StoragePool>,
    queries: Arc<Queries>,
    campaigns: CampaignQueue,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    token: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Scheduler {
    /// Build an idle scheduler for the enabled jobs in `jobs`.
    pub fn new(
        jobs: &[JobConfig],
        pool: Arc<StoragePool>,
        queries: Arc<Queries>,
        campaigns: CampaignQueue,
    ) -> Self {
        let jobs: Vec<JobConfig> = jobs.iter().filter(|j| j.enabled).cloned().collect();
        Self {
            inner: Arc::new(Inner {
                jobs,
                pool,
                queries,
                campaigns,
            }),
            token: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(None),
        }
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.inner.jobs.iter().map(|j| j.name.as_str()).collect()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Spawn one task per job. Succeeds at most once.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.token.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let mut set = JoinSet::new();
        for index in 0..self.inner.jobs.len() {
            let inner = self.inner.clone();
            let token = self.token.clone();
            set.spawn(async move { inner.job_loop(index, token).await });
        }
        tracing::info!(jobs = self.inner.jobs.len(), "Scheduler started");

        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) = Some(set);
        Ok(())
    }

    /// Run the named job once, outside its schedule.
    pub async fn run_now(&self, name: &str) -> Result<usize, SchedulerError> {
        let job = self
            .inner
            .jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.inner.run_recorded(job, &self.token).await
    }
}

impl Inner {
    async fn job_loop(&self, index: usize, token: CancellationToken) {
        let Some(job) = self.jobs.get(index) else {
            return;
        };
        loop {
            let now = Utc::now();
            let Some(next) = job.schedule.next_after(now) else {
                tracing::warn!(job = %job.name, "Job has no next run, disabling");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::debug!(job = %job.name, next_run = %next, "Job scheduled");

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if token.is_cancelled() {
                return;
            }

            if let Err(e) = self.run_recorded(job, &token).await {
                tracing::error!(job = %job.name, error = %e, "Job run failed");
            }
        }
    }

    /// Run `job` and record the outcome in `job_runs`.
    async fn run_recorded(
        &self,
        job: &JobConfig,
        token: &CancellationToken,
    ) -> Result<usize, SchedulerError> {
        let started_at = Utc::now().to_rfc3339();
        let result = self.run_once(job, token).await;

        let (status, detail) = match &result {
            Ok(queued) => ("ok", format!("queued {} message(s)", queued)),
            Err(e) => ("failed", e.to_string()),
        };
        let sql = self.queries.get(queries::RECORD_JOB_RUN)?.to_string();
        let name = job.name.clone();
        let recorded = self
            .pool
            .with_conn(move |conn| {
                conn.prepare_cached(&sql)?
                    .execute(rusqlite::params![name, started_at, status, detail])?;
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            tracing::warn!(job = %job.name, error = %e, "Failed to record job run");
        }

        if let Ok(queued) = &result {
            tracing::info!(job = %job.name, queued, "Job run finished");
        }
        result
    }

    async fn run_once(
        &self,
        job: &JobConfig,
        token: &CancellationToken,
    ) -> Result<usize, SchedulerError> {
        let create = self.queries.get(queries::CREATE_CAMPAIGN)?.to_string();
        let active = self.queries.get(queries::GET_ACTIVE_SUBSCRIBERS)?.to_string();
        let (name, subject, body, messenger) = (
            format!("{} {}", job.name, Utc::now().format("%Y-%m-%d %H:%M")),
            job.subject.clone(),
            job.body.clone(),
            job.messenger.clone(),
        );

        let (campaign_id, recipients) = self
            .pool
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.prepare_cached(&create)?
                    .execute(rusqlite::params![name, subject, body, messenger])?;
                let campaign_id = tx.last_insert_rowid();
                let recipients = tx
                    .prepare_cached(&active)?
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                tx.commit()?;
                Ok((campaign_id, recipients))
            })
            .await
            .map_err(QueryError::from)?;

        let mut queued = 0;
        for email in recipients {
            let item = Dispatch::Send {
                messenger: job.messenger.clone(),
                message: Message::new(vec![email], job.subject.clone(), job.body.clone())
                    .with_campaign(campaign_id),
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SchedulerError::Cancelled(queued)),
                sent = self.campaigns.enqueue(item) => sent?,
            }
            queued += 1;
        }
        self.campaigns
            .enqueue(Dispatch::Finish { campaign_id })
            .await?;
        Ok(queued)
    }
}

#[async_trait]
impl Subsystem for Scheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn stop(&self, deadline: Duration) -> Result<(), StopError> {
        self.token.cancel();

        let set = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut set) = set else {
            return Ok(());
        };

        let drained = tokio::time::timeout(deadline, async {
            while set.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            set.abort_all();
            return Err(StopError::DeadlineExceeded {
                name: "scheduler".to_string(),
                deadline,
            });
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.job_names())
            .field("started", &self.is_started())
            .finish()
    }
}
