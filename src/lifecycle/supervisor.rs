//! Top-level run loop.
//!
//! One iteration is one generation: load config, bootstrap, start the
//! scheduler, wait for the coordinator to finish the shutdown sequence.
//! A reload trigger starts the next iteration when `app.restart_on_reload`
//! is set; anything else ends the loop. A terminate fired at any point,
//! including during a reload's shutdown or the next bootstrap, ends the
//! loop too.
//!
//! OS signals are watched for the whole run through one [`TriggerRelay`].

use std::path::{Path, PathBuf};

use crate::config::{load_config, ConfigError, ConfigWatcher};
use crate::lifecycle::coordinator::{
    Completion, Coordinator, ReloadTrigger, TriggerKind, TriggerRelay,
};
use crate::lifecycle::events::EventBus;
use crate::lifecycle::shutdown::ShutdownReport;
use crate::lifecycle::signals::spawn_signal_watcher;
use crate::lifecycle::startup::{bootstrap, AppContext, BootstrapError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bootstrap: {0}")]
    Bootstrap(#[from] BootstrapError),
}

impl SupervisorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Config(_) => 1,
            SupervisorError::Bootstrap(e) => e.exit_code(),
        }
    }
}

pub struct Supervisor {
    config_path: Option<PathBuf>,
    bus: EventBus,
    relay: TriggerRelay,
}

impl Supervisor {
    pub fn new(config_path: Option<&Path>) -> Self {
        Self {
            config_path: config_path.map(Path::to_path_buf),
            bus: EventBus::default(),
            relay: TriggerRelay::new(),
        }
    }

    /// Bus shared by every generation.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Trigger entry point shared with the signal watcher.
    pub fn relay(&self) -> TriggerRelay {
        self.relay.clone()
    }

    /// Run generations until a terminate trigger (or a reload with restarts
    /// disabled). Returns the last shutdown report.
    pub async fn run(self) -> Result<ShutdownReport, SupervisorError> {
        let signals = spawn_signal_watcher(self.relay.clone());
        let result = self.generations().await;
        self.relay.close();
        signals.abort();
        result
    }

    async fn generations(&self) -> Result<ShutdownReport, SupervisorError> {
        let mut generation = 0u64;
        loop {
            generation += 1;
            let config = load_config(self.config_path.as_deref())?;
            let restart_on_reload = config.app.restart_on_reload;
            let watch_config = config.app.watch_config;

            let ctx = AppContext::new(config, self.bus.clone());
            tracing::info!(generation, version = ctx.version, "Starting newsletterd");
            let app = bootstrap(&ctx).await?;
            if let Err(e) = app.start_scheduler() {
                tracing::error!(error = %e, "Scheduler did not start");
            }

            let (trigger, triggers) = ReloadTrigger::channel();
            let _watcher = match (&self.config_path, watch_config) {
                (Some(path), true) => match ConfigWatcher::new(path, trigger.clone()).run() {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watcher unavailable, reload on SIGHUP only");
                        None
                    }
                },
                _ => None,
            };

            let plan = app.into_shutdown_plan();
            let done = Coordinator::new(ctx.lifecycle.clone())
                .await_termination(triggers, move |_| async move { plan.execute().await });
            self.relay.attach(trigger.clone());

            let completion = match done.await {
                Ok(completion) => completion,
                Err(_) => {
                    tracing::error!("Coordinator exited without reporting");
                    Completion {
                        trigger: TriggerKind::Terminate,
                        report: ShutdownReport::default(),
                    }
                }
            };
            self.relay.detach();
            drop(trigger);

            for failure in &completion.report.failures {
                tracing::warn!(
                    step = %failure.step,
                    subsystem = %failure.name,
                    timed_out = failure.timed_out,
                    reason = %failure.reason,
                    "Shutdown step did not complete cleanly"
                );
            }

            let terminate = self.relay.terminate_requested();
            match completion.trigger {
                TriggerKind::Reload if restart_on_reload && !terminate => {
                    tracing::info!(generation, "Reloading");
                }
                TriggerKind::Reload if terminate => {
                    tracing::info!(generation, "Terminate requested during reload, exiting");
                    return Ok(completion.report);
                }
                _ => {
                    tracing::info!(generation, "Terminated");
                    return Ok(completion.report);
                }
            }
        }
    }
}
