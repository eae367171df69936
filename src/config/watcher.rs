//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::loader::load_config;
use crate::lifecycle::coordinator::{ReloadTrigger, TriggerKind};

/// A watcher that turns configuration file changes into reload triggers.
pub struct ConfigWatcher {
    path: PathBuf,
    trigger: ReloadTrigger,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher feeding `trigger`.
    pub fn new(path: &Path, trigger: ReloadTrigger) -> Self {
        Self {
            path: path.to_path_buf(),
            trigger,
        }
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for as long as reloads
    /// should be observed.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let trigger = self.trigger.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        // Only a config that would boot is allowed to tear down the running one.
                        match load_config(Some(&path)) {
                            Ok(_) => {
                                tracing::info!("Config file change detected, requesting reload");
                                if !trigger.fire(TriggerKind::Reload) {
                                    tracing::debug!("Reload already pending");
                                }
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Changed config is invalid: {}. Keeping current configuration.",
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}
