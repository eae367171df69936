//! Named, parametrized queries.
//!
//! Queries live in a single SQL file split by `-- name: <query-name>`
//! markers. The embedded file is used unless `db.queries_path` points
//! elsewhere. Preparing the set compiles every statement against the live
//! schema, so a query referencing a missing table fails the boot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::storage::pool::{StorageError, StoragePool};

pub const DEFAULT_QUERIES: &str = include_str!("queries.sql");

pub const GET_SETTINGS: &str = "get-settings";
pub const GET_ACTIVE_SUBSCRIBERS: &str = "get-active-subscribers";
pub const COUNT_SUBSCRIBERS: &str = "count-subscribers";
pub const UPSERT_SUBSCRIBER: &str = "upsert-subscriber";
pub const INSERT_SUBSCRIBER: &str = "insert-subscriber";
pub const BLOCKLIST_SUBSCRIBER: &str = "blocklist-subscriber";
pub const DELETE_SUBSCRIBER: &str = "delete-subscriber";
pub const CREATE_CAMPAIGN: &str = "create-campaign";
pub const GET_CAMPAIGN: &str = "get-campaign";
pub const UPDATE_CAMPAIGN_STATUS: &str = "update-campaign-status";
pub const INCREMENT_CAMPAIGN_SENT: &str = "increment-campaign-sent";
pub const RECORD_BOUNCE: &str = "record-bounce";
pub const COUNT_BOUNCES: &str = "count-bounces";
pub const RECORD_JOB_RUN: &str = "record-job-run";

/// Every query the services rely on.
pub const REQUIRED_QUERIES: &[&str] = &[
    GET_SETTINGS,
    GET_ACTIVE_SUBSCRIBERS,
    COUNT_SUBSCRIBERS,
    UPSERT_SUBSCRIBER,
    INSERT_SUBSCRIBER,
    BLOCKLIST_SUBSCRIBER,
    DELETE_SUBSCRIBER,
    CREATE_CAMPAIGN,
    GET_CAMPAIGN,
    UPDATE_CAMPAIGN_STATUS,
    INCREMENT_CAMPAIGN_SENT,
    RECORD_BOUNCE,
    COUNT_BOUNCES,
    RECORD_JOB_RUN,
];

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("SQL found before the first `-- name:` marker")]
    Orphan,

    #[error("query `{0}` is defined twice")]
    Duplicate(String),

    #[error("query `{0}` has an empty body")]
    Empty(String),

    #[error("required query `{0}` is missing")]
    Missing(String),

    #[error("query `{name}` failed to prepare: {source}")]
    Prepare {
        name: String,
        source: rusqlite::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A parsed query set.
#[derive(Debug, Clone, Default)]
pub struct Queries {
    map: HashMap<String, String>,
}

impl Queries {
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        let mut map = HashMap::new();
        let mut current: Option<(String, String)> = None;

        let mut finish = |entry: Option<(String, String)>| -> Result<(), QueryError> {
            if let Some((name, body)) = entry {
                let body = body.trim().to_string();
                if body.is_empty() {
                    return Err(QueryError::Empty(name));
                }
                if map.insert(name.clone(), body).is_some() {
                    return Err(QueryError::Duplicate(name));
                }
            }
            Ok(())
        };

        for line in text.lines() {
            if let Some(name) = line.trim().strip_prefix("-- name:") {
                finish(current.take())?;
                current = Some((name.trim().to_string(), String::new()));
                continue;
            }
            match current.as_mut() {
                Some((_, body)) => {
                    body.push_str(line);
                    body.push('\n');
                }
                None if line.trim().is_empty() || line.trim().starts_with("--") => {}
                None => return Err(QueryError::Orphan),
            }
        }
        finish(current)?;

        Ok(Self { map })
    }

    /// Load the query file at `path`, or the embedded default.
    pub fn load(path: Option<&Path>) -> Result<Self, QueryError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| QueryError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::parse(&text)
            }
            None => Self::parse(DEFAULT_QUERIES),
        }
    }

    pub fn get(&self, name: &str) -> Result<&str, QueryError> {
        self.map
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| QueryError::Missing(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Check required names are present and compile every statement.
    pub async fn prepare(self, pool: &StoragePool) -> Result<Arc<Self>, QueryError> {
        for name in REQUIRED_QUERIES {
            self.get(name)?;
        }

        let statements: Vec<(String, String)> = self
            .map
            .iter()
            .map(|(name, sql)| (name.clone(), sql.clone()))
            .collect();
        let failure = pool
            .with_conn(move |conn| {
                for (name, sql) in statements {
                    if let Err(source) = conn.prepare_cached(&sql) {
                        return Ok(Some(QueryError::Prepare { name, source }));
                    }
                }
                Ok(None)
            })
            .await?;
        if let Some(err) = failure {
            return Err(err);
        }

        tracing::info!(count = self.map.len(), "Queries prepared");
        Ok(Arc::new(self))
    }
}
