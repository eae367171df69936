//! Shutdown sequence.
//!
//! [`ShutdownPlan::execute`] runs a fixed sequence. Each step starts only
//! after the previous one returned (or ran out of time):
//!
//! 1. scheduler (no new periodic job admitted)
//! 2. HTTP listener
//! 3. domain workers, reverse start order
//! 4. messengers, closed concurrently
//! 5. storage pool
//!
//! Failures and timeouts are collected into a [`ShutdownReport`] and never
//! prevent later steps from running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ShutdownConfig;
use crate::lifecycle::events::EventKind;
use crate::lifecycle::state::Lifecycle;
use crate::lifecycle::subsystem::{StopError, SubsystemHandle};
use crate::messenger::{MessengerError, MessengerRegistry};

/// Per-step deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownDeadlines {
    pub scheduler: Duration,
    pub listener: Duration,
    pub workers: Duration,
    pub messengers: Duration,
    pub storage: Duration,
}

impl From<&ShutdownConfig> for ShutdownDeadlines {
    fn from(config: &ShutdownConfig) -> Self {
        Self {
            scheduler: Duration::from_secs(config.scheduler_secs),
            listener: Duration::from_secs(config.listener_secs),
            workers: Duration::from_secs(config.workers_secs),
            messengers: Duration::from_secs(config.messengers_secs),
            storage: Duration::from_secs(config.storage_secs),
        }
    }
}

impl Default for ShutdownDeadlines {
    fn default() -> Self {
        Self::from(&ShutdownConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Scheduler,
    Listener,
    Workers,
    Messengers,
    Storage,
}

impl std::fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShutdownStep::Scheduler => "scheduler",
            ShutdownStep::Listener => "listener",
            ShutdownStep::Workers => "workers",
            ShutdownStep::Messengers => "messengers",
            ShutdownStep::Storage => "storage",
        };
        f.write_str(s)
    }
}

/// One thing that did not close cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: ShutdownStep,
    pub name: String,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub failures: Vec<StepFailure>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn timed_out(&self) -> impl Iterator<Item = &StepFailure> {
        self.failures.iter().filter(|f| f.timed_out)
    }
}

/// Everything one server generation owns, in shutdown order.
pub struct ShutdownPlan {
    lifecycle: Lifecycle,
    deadlines: ShutdownDeadlines,
    scheduler: Option<Arc<SubsystemHandle>>,
    listener: Option<Arc<SubsystemHandle>>,
    workers: Vec<Arc<SubsystemHandle>>,
    messengers: Arc<MessengerRegistry>,
    storage: Option<Arc<SubsystemHandle>>,
}

impl ShutdownPlan {
    pub fn new(
        lifecycle: Lifecycle,
        deadlines: ShutdownDeadlines,
        messengers: Arc<MessengerRegistry>,
    ) -> Self {
        Self {
            lifecycle,
            deadlines,
            scheduler: None,
            listener: None,
            workers: Vec::new(),
            messengers,
            storage: None,
        }
    }

    pub fn scheduler(mut self, handle: Arc<SubsystemHandle>) -> Self {
        self.scheduler = Some(handle);
        self
    }

    pub fn listener(mut self, handle: Arc<SubsystemHandle>) -> Self {
        self.listener = Some(handle);
        self
    }

    /// Add a domain worker. Call in start order.
    pub fn worker(mut self, handle: Arc<SubsystemHandle>) -> Self {
        self.workers.push(handle);
        self
    }

    pub fn storage(mut self, handle: Arc<SubsystemHandle>) -> Self {
        self.storage = Some(handle);
        self
    }

    pub async fn execute(&self) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        tracing::info!("Shutdown sequence started");

        if let Some(scheduler) = &self.scheduler {
            stop_step(&mut report, ShutdownStep::Scheduler, scheduler, self.deadlines.scheduler).await;
        }
        if let Some(listener) = &self.listener {
            stop_step(&mut report, ShutdownStep::Listener, listener, self.deadlines.listener).await;
        }
        for worker in self.workers.iter().rev() {
            stop_step(&mut report, ShutdownStep::Workers, worker, self.deadlines.workers).await;
        }

        let bus = self.lifecycle.bus();
        for (name, result) in self.messengers.close_all(self.deadlines.messengers).await {
            bus.publish(EventKind::MessengerClosed {
                name: name.clone(),
                ok: result.is_ok(),
            });
            if let Err(e) = result {
                report.failures.push(StepFailure {
                    step: ShutdownStep::Messengers,
                    timed_out: matches!(e, MessengerError::Timeout(_)),
                    name,
                    reason: e.to_string(),
                });
            }
        }

        if let Some(storage) = &self.storage {
            stop_step(&mut report, ShutdownStep::Storage, storage, self.deadlines.storage).await;
        }

        report.elapsed = started.elapsed();
        if report.is_clean() {
            tracing::info!(elapsed = ?report.elapsed, "Shutdown sequence complete");
        } else {
            tracing::warn!(
                elapsed = ?report.elapsed,
                failures = report.failures.len(),
                "Shutdown sequence complete with failures"
            );
        }
        report
    }
}

async fn stop_step(
    report: &mut ShutdownReport,
    step: ShutdownStep,
    handle: &SubsystemHandle,
    deadline: Duration,
) {
    if let Err(e) = handle.stop(deadline).await {
        report.failures.push(StepFailure {
            step,
            name: handle.name().to_string(),
            timed_out: matches!(e, StopError::DeadlineExceeded { .. }),
            reason: e.to_string(),
        });
    }
}

impl std::fmt::Debug for ShutdownPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownPlan")
            .field("deadlines", &self.deadlines)
            .field("scheduler", &self.scheduler.as_ref().map(|h| h.name()))
            .field("listener", &self.listener.as_ref().map(|h| h.name()))
            .field("workers", &self.workers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("messengers", &self.messengers)
            .field("storage", &self.storage.as_ref().map(|h| h.name()))
            .finish()
    }
}
