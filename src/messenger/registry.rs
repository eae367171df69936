//! Name-keyed messenger registry.
//!
//! Names come from configuration. Registering an existing name replaces the
//! entry and closes the replaced instance straight away, so an overwritten
//! messenger is never left open and unreachable. `close_all` drains the
//! registry: every held instance is closed exactly once and the registry
//! accepts no further entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;

use crate::messenger::{Messenger, MessengerError};

#[derive(Default)]
pub struct MessengerRegistry {
    entries: DashMap<String, Arc<dyn Messenger>>,
    closed: AtomicBool,
}

impl MessengerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `messenger` under `name`. Returns `true` if an existing entry
    /// was replaced (and closed).
    pub async fn register(
        &self,
        name: impl Into<String>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<bool, MessengerError> {
        let name = name.into();
        if self.closed.load(Ordering::SeqCst) {
            if let Err(e) = messenger.close().await {
                tracing::warn!(messenger = %name, error = %e, "Failed to close rejected messenger");
            }
            return Err(MessengerError::Closed(name));
        }

        let replaced = self.entries.insert(name.clone(), messenger.clone());

        // A `close_all` that started after the check above may have drained
        // without seeing this entry. Whoever removes it closes it.
        if self.closed.load(Ordering::SeqCst) {
            if let Some((_, late)) = self
                .entries
                .remove_if(&name, |_, held| Arc::ptr_eq(held, &messenger))
            {
                if let Err(e) = late.close().await {
                    tracing::warn!(messenger = %name, error = %e, "Failed to close rejected messenger");
                }
            }
            if let Some(old) = replaced {
                if let Err(e) = old.close().await {
                    tracing::warn!(messenger = %name, error = %e, "Failed to close replaced messenger");
                }
            }
            return Err(MessengerError::Closed(name));
        }

        match replaced {
            Some(old) => {
                tracing::warn!(messenger = %name, "Messenger name registered twice, closing the replaced instance");
                if let Err(e) = old.close().await {
                    tracing::warn!(messenger = %name, error = %e, "Failed to close replaced messenger");
                }
                Ok(true)
            }
            None => {
                tracing::info!(messenger = %name, "Messenger registered");
                Ok(false)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Messenger>, MessengerError> {
        self.entries
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MessengerError::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every messenger concurrently, each bounded by `deadline`.
    ///
    /// Individual failures never short-circuit the others. Results are
    /// sorted by name.
    pub async fn close_all(&self, deadline: Duration) -> Vec<(String, Result<(), MessengerError>)> {
        self.closed.store(true, Ordering::SeqCst);

        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<(String, Arc<dyn Messenger>)> = names
            .into_iter()
            .filter_map(|name| self.entries.remove(&name))
            .collect();

        let closes = drained.into_iter().map(|(name, messenger)| async move {
            let result = match tokio::time::timeout(deadline, messenger.close()).await {
                Ok(result) => result,
                Err(_) => Err(MessengerError::Timeout(format!("closing {}", name))),
            };
            match &result {
                Ok(()) => tracing::info!(messenger = %name, "Messenger closed"),
                Err(e) => tracing::error!(messenger = %name, error = %e, "Messenger failed to close"),
            }
            (name, result)
        });

        let mut results = join_all(closes).await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

impl std::fmt::Debug for MessengerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerRegistry")
            .field("names", &self.names())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
