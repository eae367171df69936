//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use newsletterd::config::{AppConfig, ShutdownConfig};
use newsletterd::lifecycle::events::{drain, Event, EventKind};
use newsletterd::lifecycle::{StopError, Subsystem};
use newsletterd::messenger::{Message, Messenger, MessengerError};
use newsletterd::storage::install_database;

/// A config whose database lives in `dir` and whose listener takes a free
/// port on localhost.
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.db.path = dir.path().join("newsletterd.db").display().to_string();
    config.db.max_open = 2;
    config.app.address = format!("127.0.0.1:{}", free_port());
    config.shutdown = ShutdownConfig {
        scheduler_secs: 1,
        listener_secs: 1,
        workers_secs: 1,
        messengers_secs: 1,
        storage_secs: 1,
    };
    config
}

/// A config pointing at an already installed database.
pub async fn installed_config(dir: &TempDir) -> AppConfig {
    let config = test_config(dir);
    install_database(&config.db, false).await.unwrap();
    config
}

/// Overwrite the schema version recorded in the database file.
pub fn set_schema_version(config: &AppConfig, version: i64) {
    let conn = rusqlite::Connection::open(&config.db.path).unwrap();
    conn.pragma_update(None, "user_version", version).unwrap();
}

/// A port nothing is listening on (at the time of the call).
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn listen_addr(config: &AppConfig) -> SocketAddr {
    config.app.address.parse().unwrap()
}

/// Whether anything accepts connections on `addr`.
pub async fn accepts(addr: SocketAddr) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_ok()
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Wait (up to 10s) for the first event matching `want`.
pub async fn wait_for(rx: &mut broadcast::Receiver<Event>, want: impl Fn(&EventKind) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if want(&event.kind) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("event never published");
}

/// Every event kind buffered in `rx`, in publish order.
pub fn kinds(rx: &mut broadcast::Receiver<Event>) -> Vec<(u64, EventKind)> {
    drain(rx).into_iter().map(|e| (e.seq, e.kind)).collect()
}

/// Sequence number of the first event matching `kind`.
pub fn seq_of(events: &[(u64, EventKind)], kind: &EventKind) -> Option<u64> {
    events.iter().find(|(_, k)| k == kind).map(|(seq, _)| *seq)
}

pub fn stop_requested(events: &[(u64, EventKind)]) -> Vec<String> {
    events
        .iter()
        .filter_map(|(_, k)| match k {
            EventKind::StopRequested(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// A subsystem that stops immediately and counts the calls.
pub struct Recording {
    pub name: &'static str,
    pub stops: AtomicUsize,
}

impl Recording {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            stops: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Subsystem for Recording {
    fn name(&self) -> &str {
        self.name
    }

    async fn stop(&self, _deadline: Duration) -> Result<(), StopError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A subsystem whose stop never returns.
pub struct Hanging(pub &'static str);

#[async_trait]
impl Subsystem for Hanging {
    fn name(&self) -> &str {
        self.0
    }

    async fn stop(&self, _deadline: Duration) -> Result<(), StopError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    Ok,
    Fail,
    Hang,
}

/// A messenger that records sends and closes.
pub struct FakeMessenger {
    pub name: String,
    pub behavior: CloseBehavior,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeMessenger {
    pub fn new(name: &str, behavior: CloseBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            sends: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _message: &Message) -> Result<(), MessengerError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            CloseBehavior::Ok => Ok(()),
            CloseBehavior::Fail => Err(MessengerError::Transport(format!("{} refused to close", self.name))),
            CloseBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
