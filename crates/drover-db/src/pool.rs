//! Store pool construction.
//!
//! Opens (or creates) the shared SQLite database and applies the schema
//! inline via `include_str!` on first open, so no running database or
//! migration directory is required at compile time.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::DbConfig;

/// Create a connection pool for the configured database and apply the
/// schema.
pub async fn open_pool(config: &DbConfig) -> Result<SqlitePool> {
    let options = connect_options(config)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open state store at {}", config.database_url))?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// Open a pool backed by a database file at an explicit path.
///
/// Convenience for tests and tools that bypass URL handling.
pub async fn open_pool_at(path: &Path) -> Result<SqlitePool> {
    let url = format!("sqlite://{}", path.display());
    open_pool(&DbConfig::new(url)).await
}

fn connect_options(config: &DbConfig) -> Result<SqliteConnectOptions> {
    let options = match config.database_path() {
        Some(path) => {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create store directory {}", parent.display())
                    })?;
                }
            }
            SqliteConnectOptions::new().filename(path)
        }
        None => config
            .database_url
            .parse::<SqliteConnectOptions>()
            .with_context(|| format!("invalid database URL {}", config.database_url))?,
    };

    Ok(options
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10))
        .pragma("foreign_keys", "ON"))
}

/// Apply the embedded schema to a pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    let schema_sql = include_str!("../migrations/001_schema.sql");
    sqlx::raw_sql(schema_sql)
        .execute(pool)
        .await
        .context("failed to apply state store schema")?;
    info!("state store schema applied");
    Ok(())
}
