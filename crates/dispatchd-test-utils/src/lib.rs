//! Shared test utilities for dispatchd integration tests.
//!
//! Unlike a networked Postgres instance, a SQLite file is cheap to create per
//! test: each call to [`test_pool`] gets its own temp-directory-backed
//! database, migrated fresh, with no shared-instance bookkeeping required.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

use dispatchd_db::pool;

/// An isolated database pool plus the temp directory backing its file.
///
/// Keep the returned `TempDir` alive for as long as the pool is in use; it
/// deletes the database file (and any WAL/SHM sidecars) on drop.
pub async fn test_pool() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir for test database");
    let db_path = dir.path().join("test.db");

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let temp_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&temp_pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    (temp_pool, dir)
}
