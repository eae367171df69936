//! Release update checker.
//!
//! Polls a GitHub-style "latest release" endpoint and, when a newer version
//! is published, stores it as the lifecycle's pending update. The checker is
//! purely informational and never restarts anything.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::lifecycle::state::{Lifecycle, PendingUpdate};
use crate::lifecycle::worker::{Worker, WorkerError};
use crate::resilience::backoff::jittered;

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    html_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("release endpoint responded {0}")]
    Status(reqwest::StatusCode),
}

pub struct UpdateChecker {
    url: String,
    interval: Duration,
    current: String,
    client: reqwest::Client,
    lifecycle: Lifecycle,
}

impl UpdateChecker {
    pub fn new(
        config: &ServerConfig,
        current: &str,
        lifecycle: Lifecycle,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("newsletterd/{}", current))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            url: config.update_url.clone(),
            interval: Duration::from_secs(config.update_interval_secs.max(1)),
            current: current.to_string(),
            client,
            lifecycle,
        })
    }

    /// Fetch the latest release once. Returns the pending update, if any.
    pub async fn check(&self) -> Result<Option<PendingUpdate>, UpdateError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::Status(response.status()));
        }
        let release: Release = response.json().await?;

        let update = is_newer(&self.current, &release.tag_name).then(|| PendingUpdate {
            version: release.tag_name,
            url: release.html_url,
            checked_at: Utc::now(),
        });
        self.lifecycle.set_pending_update(update.clone());
        Ok(update)
    }
}

/// Whether `candidate` is a higher dotted version than `current`. A leading
/// `v` and any pre-release suffix are ignored.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    fn parts(version: &str) -> Vec<u64> {
        version
            .trim()
            .trim_start_matches('v')
            .split(['-', '+'])
            .next()
            .unwrap_or_default()
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    }

    let (mut current, mut candidate) = (parts(current), parts(candidate));
    let len = current.len().max(candidate.len());
    current.resize(len, 0);
    candidate.resize(len, 0);
    candidate > current
}

#[async_trait]
impl Worker for UpdateChecker {
    fn name(&self) -> &str {
        "update-checker"
    }

    async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), WorkerError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                result = self.check() => match result {
                    Ok(Some(update)) => tracing::info!(version = %update.version, url = %update.url, "A newer release is available"),
                    Ok(None) => tracing::debug!("No newer release"),
                    Err(e) => tracing::warn!(error = %e, "Update check failed"),
                },
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(jittered(self.interval, 10)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::events::EventBus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_version_comparison() {
        assert!(is_newer("0.1.0", "v0.2.0"));
        assert!(is_newer("1.9.9", "1.10.0"));
        assert!(is_newer("1.2", "1.2.1"));
        assert!(!is_newer("1.2.0", "v1.2.0"));
        assert!(!is_newer("2.0.0", "1.99.0"));
        assert!(!is_newer("1.2.0", "1.2.0-rc1"));
    }

    /// Serves one canned HTTP response.
    async fn release_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{}/releases/latest", addr)
    }

    #[tokio::test]
    async fn test_check_sets_pending_update() {
        let url = release_server(
            r#"{"tag_name":"v9.0.0","html_url":"https://example.com/releases/v9.0.0"}"#,
        )
        .await;
        let lifecycle = Lifecycle::new(EventBus::default());
        let config = ServerConfig {
            update_url: url,
            ..ServerConfig::default()
        };
        let checker = UpdateChecker::new(&config, "0.1.0", lifecycle.clone()).unwrap();

        let update = checker.check().await.unwrap().unwrap();
        assert_eq!(update.version, "v9.0.0");
        assert_eq!(lifecycle.pending_update(), Some(update));
    }
}
