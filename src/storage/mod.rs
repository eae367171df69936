//! Storage subsystem.
//!
//! # Data Flow
//! ```text
//! db.path
//!     → pool.rs (open db.max_open connections, WAL)
//!     → schema.rs (PRAGMA user_version vs SCHEMA_VERSION)
//!     → queries.rs (load named queries, prepare against the live schema)
//!     → services borrow connections through StoragePool::with_conn
//!
//! Shutdown:
//!     pool closes last, after every worker that could use it
//! ```
//!
//! # Design Decisions
//! - Schema changes only happen through `--install` / `--upgrade`, never
//!   implicitly at boot
//! - rusqlite is synchronous; every call runs on the blocking pool

pub mod pool;
pub mod queries;
pub mod schema;

use std::time::Duration;

use crate::config::DbConfig;

pub use pool::{StorageError, StoragePool};
pub use queries::{Queries, QueryError};
pub use schema::{SchemaStatus, SCHEMA_VERSION};

const MAINTENANCE_CLOSE: Duration = Duration::from_secs(5);

/// Create the schema on the configured database (`--install`).
pub async fn install_database(config: &DbConfig, idempotent: bool) -> Result<(), StorageError> {
    let pool = StoragePool::open(config)?;
    let result = schema::install(&pool, idempotent).await;
    pool.close(MAINTENANCE_CLOSE).await?;
    result
}

/// Apply pending migrations on the configured database (`--upgrade`).
pub async fn upgrade_database(config: &DbConfig) -> Result<Vec<i64>, StorageError> {
    let pool = StoragePool::open(config)?;
    let result = schema::upgrade(&pool).await;
    pool.close(MAINTENANCE_CLOSE).await?;
    result
}
