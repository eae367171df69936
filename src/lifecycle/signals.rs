//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to [`TriggerKind`]s on the process-wide relay
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP asks for a reload, SIGTERM/SIGINT/ctrl-c for termination
//! - Repeated signals are forwarded as-is; the coordinator collapses them
//! - Installed once per process run: tokio keeps the handlers registered,
//!   so a signal with no live receiver would be lost
//! - Non-unix platforms only see ctrl-c

use tokio::task::JoinHandle;

use crate::lifecycle::coordinator::{TriggerKind, TriggerRelay};

/// Spawn the watcher. It runs until the relay is closed or the returned
/// handle is aborted.
pub fn spawn_signal_watcher(relay: TriggerRelay) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = watch(relay).await {
            tracing::error!(error = %e, "Signal watcher failed to install handlers");
        }
    })
}

#[cfg(unix)]
async fn watch(relay: TriggerRelay) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        let (name, kind) = tokio::select! {
            _ = sighup.recv() => ("SIGHUP", TriggerKind::Reload),
            _ = sigint.recv() => ("SIGINT", TriggerKind::Terminate),
            _ = sigterm.recv() => ("SIGTERM", TriggerKind::Terminate),
        };
        tracing::info!(signal = name, trigger = %kind, "Signal received");
        relay.fire(kind);
        if relay.is_closed() {
            return Ok(());
        }
    }
}

#[cfg(not(unix))]
async fn watch(relay: TriggerRelay) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        tracing::info!(signal = "ctrl-c", "Signal received");
        relay.fire(TriggerKind::Terminate);
        if relay.is_closed() {
            return Ok(());
        }
    }
}
