//! Startup orchestration.
//!
//! # Responsibilities
//! - Bring subsystems up in dependency order: storage, queries, domain
//!   workers, optional workers, messengers, HTTP listener
//! - Record a [`SubsystemHandle`] for everything that was started
//! - Roll back whatever was acquired when a later step fails
//!
//! # Design Decisions
//! - Fail fast: the first error aborts the chain
//! - Subsystems initialize in order, not concurrently
//! - The listener starts last (traffic only when ready)
//! - The scheduler is built here but started by the caller once `Running`

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::http::{AppState, HttpServer};
use crate::lifecycle::events::{EventBus, EventKind};
use crate::lifecycle::shutdown::{ShutdownDeadlines, ShutdownPlan};
use crate::lifecycle::state::{Lifecycle, LifecycleState, TransitionError};
use crate::lifecycle::subsystem::{Subsystem, SubsystemHandle};
use crate::lifecycle::worker::WorkerTask;
use crate::messenger::postback::PostbackMessenger;
use crate::messenger::smtp::SmtpMessenger;
use crate::messenger::{MessengerError, MessengerRegistry, EMAIL_MESSENGER};
use crate::net::{self, ListenerError};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::services::bounce::{BounceProcessor, BounceQueue};
use crate::services::campaign::{CampaignManager, CampaignQueue};
use crate::services::importer::{ImportQueue, Importer};
use crate::services::templates::{NotifTemplates, TemplateError};
use crate::storage::queries;
use crate::storage::schema::{self, SchemaStatus};
use crate::storage::{Queries, QueryError, StorageError, StoragePool};
use crate::update::{UpdateChecker, UpdateError};

/// Version reported by `/api/about` and compared by the update checker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a generation is built from.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub lifecycle: Lifecycle,
    pub version: &'static str,
}

impl AppContext {
    /// A context in `Starting`, publishing on `bus`.
    pub fn new(config: AppConfig, bus: EventBus) -> Self {
        Self {
            config: Arc::new(config),
            lifecycle: Lifecycle::new(bus),
            version: VERSION,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("database is not installed, run with --install")]
    NotInstalled,

    #[error("database schema v{current} is older than v{required}, run with --upgrade")]
    NeedsMigration { current: i64, required: i64 },

    #[error("database schema v{current} is newer than this build supports (v{supported})")]
    SchemaTooNew { current: i64, supported: i64 },

    #[error("queries: {0}")]
    Queries(#[from] QueryError),

    #[error("templates: {0}")]
    Templates(#[from] TemplateError),

    #[error("messenger: {0}")]
    Messenger(#[from] MessengerError),

    #[error("update checker: {0}")]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl BootstrapError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            BootstrapError::NotInstalled => 2,
            BootstrapError::NeedsMigration { .. } | BootstrapError::SchemaTooNew { .. } => 3,
            _ => 1,
        }
    }
}

/// A running generation.
pub struct App {
    lifecycle: Lifecycle,
    deadlines: ShutdownDeadlines,
    scheduler: Arc<Scheduler>,
    scheduler_handle: Arc<SubsystemHandle>,
    listener: Arc<SubsystemHandle>,
    workers: Vec<Arc<SubsystemHandle>>,
    storage: Arc<SubsystemHandle>,
    local_addr: SocketAddr,
    pub messengers: Arc<MessengerRegistry>,
    pub campaigns: CampaignQueue,
    pub imports: ImportQueue,
    pub bounces: Option<BounceQueue>,
}

impl App {
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Address the HTTP listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Start periodic jobs. Call after bootstrap returned.
    pub fn start_scheduler(&self) -> Result<(), SchedulerError> {
        self.scheduler.start()
    }

    /// Hand every handle to the shutdown sequence.
    pub fn into_shutdown_plan(self) -> ShutdownPlan {
        let mut plan = ShutdownPlan::new(self.lifecycle, self.deadlines, self.messengers)
            .scheduler(self.scheduler_handle)
            .listener(self.listener)
            .storage(self.storage);
        for worker in self.workers {
            plan = plan.worker(worker);
        }
        plan
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("local_addr", &self.local_addr)
            .field("workers", &self.workers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("messengers", &self.messengers.names())
            .finish()
    }
}

/// Something bootstrap has to give back if a later step fails.
enum Acquired {
    Handle(Arc<SubsystemHandle>, Duration),
    Messengers(Arc<MessengerRegistry>, Duration),
}

/// Acquisitions in the order they happened.
struct Acquisitions {
    lifecycle: Lifecycle,
    items: Vec<Acquired>,
}

impl Acquisitions {
    fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            items: Vec::new(),
        }
    }

    fn handle(&mut self, subsystem: Arc<dyn Subsystem>, deadline: Duration) -> Arc<SubsystemHandle> {
        let handle = Arc::new(SubsystemHandle::new(subsystem, &self.lifecycle));
        self.items.push(Acquired::Handle(handle.clone(), deadline));
        handle
    }

    fn messengers(&mut self, registry: Arc<MessengerRegistry>, deadline: Duration) {
        self.items.push(Acquired::Messengers(registry, deadline));
    }

    /// Stop everything in reverse acquisition order and end the lifecycle.
    async fn rollback(self) {
        if let Err(e) = self.lifecycle.advance(LifecycleState::ShuttingDown) {
            tracing::warn!(error = %e, "Rollback from unexpected state");
        }
        let bus = self.lifecycle.bus();
        for item in self.items.into_iter().rev() {
            match item {
                Acquired::Handle(handle, deadline) => {
                    if let Err(e) = handle.stop(deadline).await {
                        tracing::error!(subsystem = %handle.name(), error = %e, "Rollback stop failed");
                    }
                }
                Acquired::Messengers(registry, deadline) => {
                    for (name, result) in registry.close_all(deadline).await {
                        if let Err(e) = &result {
                            tracing::error!(messenger = %name, error = %e, "Rollback close failed");
                        }
                        bus.publish(EventKind::MessengerClosed {
                            name,
                            ok: result.is_ok(),
                        });
                    }
                }
            }
        }
        if let Err(e) = self.lifecycle.advance(LifecycleState::Terminated) {
            tracing::warn!(error = %e, "Could not mark lifecycle terminated after rollback");
        }
    }
}

/// Bring a generation up. On error everything acquired so far has been
/// released and the lifecycle is `Terminated`.
pub async fn bootstrap(ctx: &AppContext) -> Result<App, BootstrapError> {
    let mut acquired = Acquisitions::new(ctx.lifecycle.clone());
    match build(ctx, &mut acquired).await {
        Ok(app) => {
            tracing::info!(address = %app.local_addr, "Bootstrap complete");
            Ok(app)
        }
        Err(e) => {
            tracing::error!(error = %e, "Bootstrap failed, rolling back");
            acquired.rollback().await;
            Err(e)
        }
    }
}

async fn build(ctx: &AppContext, acquired: &mut Acquisitions) -> Result<App, BootstrapError> {
    let config = &ctx.config;
    let lifecycle = &ctx.lifecycle;
    let deadlines = ShutdownDeadlines::from(&config.shutdown);

    // 2. storage
    let pool = Arc::new(StoragePool::open(&config.db)?);
    let storage = acquired.handle(pool.clone(), deadlines.storage);

    // 3. schema
    match schema::check_schema(&pool).await? {
        SchemaStatus::Current => {}
        SchemaStatus::NotInstalled => return Err(BootstrapError::NotInstalled),
        SchemaStatus::Outdated { current, required } => {
            return Err(BootstrapError::NeedsMigration { current, required })
        }
        SchemaStatus::TooNew { current, supported } => {
            return Err(BootstrapError::SchemaTooNew { current, supported })
        }
    }

    // 4. queries
    let queries = Queries::load(config.db.queries_path.as_deref().map(Path::new))?
        .prepare(&pool)
        .await?;
    if let Err(e) = log_install(&pool, &queries).await {
        tracing::warn!(error = %e, "Could not read install settings");
    }

    // 5. domain services
    let templates = Arc::new(NotifTemplates::load(config.templates.dir.as_deref().map(Path::new))?);
    let messengers = Arc::new(MessengerRegistry::new());
    let mut workers = Vec::new();

    let (manager, campaigns) = CampaignManager::new(
        &config.campaign,
        messengers.clone(),
        pool.clone(),
        queries.clone(),
        templates.clone(),
        config.app.notify_emails.clone(),
    );
    let stats = manager.stats();
    workers.push(acquired.handle(WorkerTask::spawn(manager), deadlines.workers));

    let (importer, imports) = Importer::new(
        &config.importer,
        pool.clone(),
        queries.clone(),
        templates,
        campaigns.clone(),
        config.app.notify_emails.clone(),
    );
    workers.push(acquired.handle(WorkerTask::spawn(importer), deadlines.workers));

    let scheduler = Arc::new(Scheduler::new(
        &config.jobs,
        pool.clone(),
        queries.clone(),
        campaigns.clone(),
    ));
    let scheduler_handle = acquired.handle(scheduler.clone(), deadlines.scheduler);

    // 6. optional workers
    let bounces = if config.bounce.enabled {
        let (processor, bounces) = BounceProcessor::new(&config.bounce, pool.clone(), queries.clone());
        workers.push(acquired.handle(WorkerTask::spawn(processor), deadlines.workers));
        Some(bounces)
    } else {
        None
    };

    if config.app.check_updates {
        let checker = UpdateChecker::new(&config.app, ctx.version, lifecycle.clone())?;
        workers.push(acquired.handle(WorkerTask::spawn(Arc::new(checker)), deadlines.workers));
    }

    // 7. messengers
    acquired.messengers(messengers.clone(), deadlines.messengers);
    if config.smtp.enabled {
        let smtp = SmtpMessenger::new(config.smtp.clone())?;
        messengers.register(EMAIL_MESSENGER, Arc::new(smtp)).await?;
    }
    for postback in config.messengers.iter().filter(|m| m.enabled) {
        let messenger = PostbackMessenger::new(postback)?;
        messengers.register(postback.name.clone(), Arc::new(messenger)).await?;
    }
    if messengers.is_empty() {
        tracing::warn!("No messengers configured, campaigns cannot be delivered");
    }

    // 8. listener
    let (listener, local_addr) = net::bind(&config.app.address).await?;
    let server = HttpServer::new(
        listener,
        AppState {
            lifecycle: lifecycle.clone(),
            messengers: messengers.clone(),
            campaigns: stats,
            version: ctx.version,
        },
    );
    let listener = acquired.handle(WorkerTask::spawn(Arc::new(server)), deadlines.listener);

    lifecycle.advance(LifecycleState::Running)?;

    Ok(App {
        lifecycle: lifecycle.clone(),
        deadlines,
        scheduler,
        scheduler_handle,
        listener,
        workers,
        storage,
        local_addr,
        messengers,
        campaigns,
        imports,
        bounces,
    })
}

async fn log_install(pool: &StoragePool, queries: &Queries) -> Result<(), QueryError> {
    let settings_sql = queries.get(queries::GET_SETTINGS)?.to_string();
    let count_sql = queries.get(queries::COUNT_SUBSCRIBERS)?.to_string();
    let (settings, subscribers) = pool
        .with_conn(move |conn| {
            let settings = conn
                .prepare_cached(&settings_sql)?
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            let subscribers: i64 = conn.query_row(&count_sql, [], |r| r.get(0))?;
            Ok((settings, subscribers))
        })
        .await?;

    let installed_at = settings
        .get("app.installed_at")
        .map(String::as_str)
        .unwrap_or("unknown");
    tracing::info!(installed_at, subscribers, "Database ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(BootstrapError::NotInstalled.exit_code(), 2);
        assert_eq!(
            BootstrapError::NeedsMigration { current: 1, required: 3 }.exit_code(),
            3
        );
        assert_eq!(
            BootstrapError::SchemaTooNew { current: 9, supported: 3 }.exit_code(),
            3
        );
        assert_eq!(
            BootstrapError::Messenger(MessengerError::Closed("x".into())).exit_code(),
            1
        );
    }
}
