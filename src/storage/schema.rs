//! Schema versioning.
//!
//! The schema version lives in `PRAGMA user_version`. Version 0 means the
//! database was never installed. Each migration runs in its own transaction
//! and bumps the version as its last statement.

use rusqlite::Connection;

use crate::storage::pool::{StorageError, StoragePool};

/// Schema version this build expects.
pub const SCHEMA_VERSION: i64 = 3;

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "settings, subscribers and campaigns",
        sql: "
            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE subscribers (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'enabled',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE campaigns (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                messenger TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                sent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        ",
    },
    Migration {
        version: 2,
        description: "bounces",
        sql: "
            CREATE TABLE bounces (
                id INTEGER PRIMARY KEY,
                subscriber_id INTEGER REFERENCES subscribers(id) ON DELETE CASCADE,
                email TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX idx_bounces_email ON bounces(email);
        ",
    },
    Migration {
        version: 3,
        description: "periodic job runs",
        sql: "
            CREATE TABLE job_runs (
                id INTEGER PRIMARY KEY,
                job TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                status TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT ''
            );
        ",
    },
];

/// Result of comparing the database against [`SCHEMA_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    NotInstalled,
    Current,
    Outdated { current: i64, required: i64 },
    TooNew { current: i64, supported: i64 },
}

fn user_version(conn: &Connection) -> Result<i64, StorageError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn apply(conn: &mut Connection, migration: &Migration) -> Result<(), StorageError> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()?;
    tracing::info!(
        version = migration.version,
        description = migration.description,
        "Applied migration"
    );
    Ok(())
}

pub async fn check_schema(pool: &StoragePool) -> Result<SchemaStatus, StorageError> {
    let current = pool.with_conn(|conn| user_version(conn)).await?;
    Ok(match current {
        0 => SchemaStatus::NotInstalled,
        v if v == SCHEMA_VERSION => SchemaStatus::Current,
        v if v < SCHEMA_VERSION => SchemaStatus::Outdated {
            current: v,
            required: SCHEMA_VERSION,
        },
        v => SchemaStatus::TooNew {
            current: v,
            supported: SCHEMA_VERSION,
        },
    })
}

/// Create the full schema on an empty database.
///
/// With `idempotent`, an already installed database is left untouched.
pub async fn install(pool: &StoragePool, idempotent: bool) -> Result<(), StorageError> {
    pool.with_conn(move |conn| {
        let current = user_version(conn)?;
        if current != 0 {
            if idempotent {
                tracing::info!(version = current, "Database already installed, skipping");
                return Ok(());
            }
            return Err(StorageError::AlreadyInstalled(current));
        }
        for migration in MIGRATIONS {
            apply(conn, migration)?;
        }
        conn.execute(
            "INSERT INTO settings (key, value) VALUES ('app.installed_at', datetime('now'))",
            [],
        )?;
        Ok(())
    })
    .await
}

/// Apply every pending migration. Returns the versions applied.
pub async fn upgrade(pool: &StoragePool) -> Result<Vec<i64>, StorageError> {
    pool.with_conn(|conn| {
        let current = user_version(conn)?;
        if current == 0 {
            return Err(StorageError::NotInstalled);
        }
        let mut applied = Vec::new();
        for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
            apply(conn, migration)?;
            applied.push(migration.version);
        }
        Ok(applied)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    fn pool(dir: &tempfile::TempDir) -> StoragePool {
        StoragePool::open(&DbConfig {
            path: dir.path().join("schema.db").display().to_string(),
            max_open: 1,
            ..DbConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_migrations_end_at_schema_version() {
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
        assert!(MIGRATIONS.windows(2).all(|w| w[1].version == w[0].version + 1));
    }

    #[tokio::test]
    async fn test_install_then_current() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);

        assert_eq!(check_schema(&pool).await.unwrap(), SchemaStatus::NotInstalled);
        install(&pool, false).await.unwrap();
        assert_eq!(check_schema(&pool).await.unwrap(), SchemaStatus::Current);

        assert!(matches!(
            install(&pool, false).await,
            Err(StorageError::AlreadyInstalled(SCHEMA_VERSION))
        ));
        install(&pool, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_upgrade_from_older_version() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        pool.with_conn(|conn| apply(conn, &MIGRATIONS[0])).await.unwrap();

        assert_eq!(
            check_schema(&pool).await.unwrap(),
            SchemaStatus::Outdated {
                current: 1,
                required: SCHEMA_VERSION
            }
        );
        assert_eq!(upgrade(&pool).await.unwrap(), vec![2, 3]);
        assert_eq!(check_schema(&pool).await.unwrap(), SchemaStatus::Current);
    }

    #[tokio::test]
    async fn test_upgrade_requires_install() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        assert!(matches!(upgrade(&pool).await, Err(StorageError::NotInstalled)));
    }
}
