//! Supervisor run loop tests.

mod common;

use std::time::Duration;

use newsletterd::config::AppConfig;
use newsletterd::lifecycle::events::EventKind;
use newsletterd::lifecycle::{LifecycleState, Supervisor, TriggerKind};

use common::*;

fn write_config(dir: &tempfile::TempDir, config: &AppConfig) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, toml::to_string(config).unwrap()).unwrap();
    path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_during_reload_shutdown_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = installed_config(&dir).await;
    config.app.restart_on_reload = true;
    config.app.watch_config = false;
    let path = write_config(&dir, &config);

    let supervisor = Supervisor::new(Some(&path));
    let relay = supervisor.relay();
    let mut rx = supervisor.bus().subscribe();
    let run = tokio::spawn(supervisor.run());

    wait_for(&mut rx, |k| *k == EventKind::StateChanged(LifecycleState::Running)).await;
    assert!(relay.fire(TriggerKind::Reload));
    wait_for(&mut rx, |k| *k == EventKind::TriggerAccepted(TriggerKind::Reload)).await;
    relay.fire(TriggerKind::Terminate);

    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor kept running after terminate")
        .unwrap()
        .unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(relay.terminate_requested());
    assert!(relay.is_closed());
    assert!(!accepts(listen_addr(&config)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_restarts_then_terminate_exits() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = installed_config(&dir).await;
    config.app.restart_on_reload = true;
    config.app.watch_config = false;
    let path = write_config(&dir, &config);

    let supervisor = Supervisor::new(Some(&path));
    let relay = supervisor.relay();
    let mut rx = supervisor.bus().subscribe();
    let run = tokio::spawn(supervisor.run());

    wait_for(&mut rx, |k| *k == EventKind::StateChanged(LifecycleState::Running)).await;
    relay.fire(TriggerKind::Reload);
    wait_for(&mut rx, |k| *k == EventKind::StateChanged(LifecycleState::Terminated)).await;
    // Second generation.
    wait_for(&mut rx, |k| *k == EventKind::StateChanged(LifecycleState::Running)).await;
    assert!(accepts(listen_addr(&config)).await);

    relay.fire(TriggerKind::Terminate);
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor kept running after terminate")
        .unwrap()
        .unwrap();
}
