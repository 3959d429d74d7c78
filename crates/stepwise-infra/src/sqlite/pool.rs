//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::resolve_data_dir;

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Create a new DatabasePool with split reader/writer connections.
    ///
    /// Runs migrations automatically on the writer pool.
    /// Both pools use WAL journal mode and a 5-second busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        // Run migrations on writer before opening reader pool
        sqlx::migrate!("../../migrations")
            .run(&writer)
            .await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(database_url, "opened database pool");
        Ok(Self { reader, writer })
    }
}

/// Returns the default database URL inside the resolved data directory
/// (`STEPWISE_DATA_DIR`, falling back to `~/.stepwise/stepwise.db`).
pub fn default_database_url() -> String {
    format!("sqlite://{}/stepwise.db", resolve_data_dir().display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(table_names, vec!["kv_storage", "priority_queue", "states"]);
    }

    #[tokio::test]
    async fn test_pool_wal_mode() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test_wal.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let pool = DatabasePool::new(&url).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();

        assert_eq!(result.0.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_reopen_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("twice.db").display());

        DatabasePool::new(&url).await.unwrap();
        // Migrations are already applied; a second open must not fail.
        DatabasePool::new(&url).await.unwrap();
    }

    async fn journal_insert(pool: &DatabasePool, instance_id: &str, action: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO priority_queue (instance_id, created_on, target_timestamp, action, entry_type, hash)
             VALUES (?, '2026-01-01T00:00:00Z', 1000, ?, 0, 'nap-1')",
        )
        .bind(instance_id)
        .bind(action)
        .execute(&pool.writer)
        .await
        .map(|_| ())
    }

    #[tokio::test]
    async fn test_wake_journal_rows_unique_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("journal.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();

        journal_insert(&pool, "inst-a", 1).await.unwrap();
        assert!(journal_insert(&pool, "inst-a", 1).await.is_err());
        // Removal of the same entry and the same entry in another partition are distinct rows.
        journal_insert(&pool, "inst-a", 0).await.unwrap();
        journal_insert(&pool, "inst-b", 1).await.unwrap();

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM priority_queue")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_kv_keys_scoped_by_instance() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("kv.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();

        let insert = "INSERT INTO kv_storage (instance_id, key, value, updated_at)
                      VALUES (?, 'INSTANCE_STATUS', '0', '2026-01-01T00:00:00Z')";
        sqlx::query(insert).bind("inst-a").execute(&pool.writer).await.unwrap();
        assert!(sqlx::query(insert).bind("inst-a").execute(&pool.writer).await.is_err());
        sqlx::query(insert).bind("inst-b").execute(&pool.writer).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_pool_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ro.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();

        let write = sqlx::query(
            "INSERT INTO kv_storage (instance_id, key, value, updated_at) VALUES ('i', 'k', '1', 'now')",
        )
        .execute(&pool.reader)
        .await;
        assert!(write.is_err());
    }

    #[test]
    fn test_default_database_url() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("stepwise.db"));
    }
}
