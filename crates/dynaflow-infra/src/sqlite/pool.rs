//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode and enforce foreign keys.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

/// Reader connections opened by [`DatabasePool::new`].
pub const DEFAULT_READER_CONNECTIONS: u32 = 8;

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool for the engine's concurrent candidate and
///   watch queries.
/// - `writer`: Single-connection pool for serialized version-checked writes.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the pool with [`DEFAULT_READER_CONNECTIONS`] readers.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_readers(database_url, DEFAULT_READER_CONNECTIONS).await
    }

    /// Open the pool with `readers` reader connections (at least one).
    ///
    /// Migrations run on the writer before the reader pool opens. Both pools
    /// use WAL journal mode, foreign key enforcement and a 5-second busy timeout.
    pub async fn with_readers(database_url: &str, readers: u32) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;

        let migrator = sqlx::migrate!("../../migrations");
        migrator.run(&writer).await?;
        debug!(migrations = migrator.iter().count(), "engine schema up to date");

        let reader = SqlitePoolOptions::new()
            .max_connections(readers.max(1))
            .connect_with(base_opts.read_only(true))
            .await?;
        info!(readers = readers.max(1), "database pool ready");

        Ok(Self { reader, writer })
    }
}

/// Returns the default database URL: `dynaflow.db` inside the data directory
/// (`DYNAFLOW_DATA_DIR`, else `~/.dynaflow`).
pub fn default_database_url() -> String {
    let data_dir = crate::filesystem::resolve_data_dir();
    format!("sqlite://{}/dynaflow.db?mode=rwc", data_dir.display())
}
