//! Shared test utilities for drover integration tests.
//!
//! Provides a temporary SQLite state store per test: each call to
//! [`TestStore::create`] opens a fresh database file inside its own temp
//! directory with the schema applied. The directory (and the database with
//! it) is removed when the `TestStore` is dropped.

use sqlx::SqlitePool;
use tempfile::TempDir;

use drover_db::pool;

/// A temporary state store for one test.
///
/// Keep the struct alive for the duration of the test; dropping it deletes
/// the backing directory.
pub struct TestStore {
    /// Pool connected to the temporary database.
    pub pool: SqlitePool,
    /// Held to keep the temp directory (and database file) alive.
    _dir: TempDir,
}

impl TestStore {
    /// Create a fresh store with the schema applied.
    pub async fn create() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir for test store");
        let path = dir.path().join("store.db");
        let pool = pool::open_pool_at(&path)
            .await
            .expect("failed to open test store");
        Self { pool, _dir: dir }
    }

    /// Close the pool explicitly. Useful at the end of tests that assert
    /// on clean shutdown; otherwise dropping is enough.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
