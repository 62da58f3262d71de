//! Task lease locks: TTL-bounded, atomically acquired, owner-checked.
//!
//! The lock is the only mutual-exclusion primitive in the system. Holding
//! it is the precondition for transitioning a task's state during
//! execution. Acquisition is a single insert-or-steal-expired statement so
//! concurrent callers race on `rows_affected`, not on a read-then-write.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

use super::now_ms;

/// Try to acquire the lock for `task_id` on behalf of `agent`.
///
/// Returns `true` when this call took the lock (either it was absent or
/// the previous holder's TTL had lapsed). Refreshing a lock you already
/// hold goes through [`renew_lock`], not this.
pub async fn acquire_lock(
    pool: &SqlitePool,
    task_id: &str,
    agent: &str,
    ttl: Duration,
) -> Result<bool> {
    let now = now_ms();
    let expires = now + ttl.as_millis() as i64;

    let result = sqlx::query(
        "INSERT INTO task_locks (task_id, owner, expires_at_ms) VALUES (?1, ?2, ?3) \
         ON CONFLICT(task_id) DO UPDATE SET \
            owner = excluded.owner, \
            expires_at_ms = excluded.expires_at_ms \
         WHERE task_locks.expires_at_ms <= ?4",
    )
    .bind(task_id)
    .bind(agent)
    .bind(expires)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to acquire task lock")?;

    let acquired = result.rows_affected() > 0;
    if acquired {
        debug!(task_id, agent, ttl_ms = ttl.as_millis() as i64, "lock acquired");
    } else {
        debug!(task_id, agent, "lock already held");
    }
    Ok(acquired)
}

/// Refresh the TTL, but only if `agent` still holds a live lock.
pub async fn renew_lock(
    pool: &SqlitePool,
    task_id: &str,
    agent: &str,
    ttl: Duration,
) -> Result<bool> {
    let now = now_ms();
    let expires = now + ttl.as_millis() as i64;

    let result = sqlx::query(
        "UPDATE task_locks SET expires_at_ms = ?1 \
         WHERE task_id = ?2 AND owner = ?3 AND expires_at_ms > ?4",
    )
    .bind(expires)
    .bind(task_id)
    .bind(agent)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to renew task lock")?;

    Ok(result.rows_affected() > 0)
}

/// Release the lock, but only if `agent` owns it.
pub async fn release_lock(pool: &SqlitePool, task_id: &str, agent: &str) -> Result<()> {
    sqlx::query("DELETE FROM task_locks WHERE task_id = ?1 AND owner = ?2")
        .bind(task_id)
        .bind(agent)
        .execute(pool)
        .await
        .context("failed to release task lock")?;
    Ok(())
}

/// Current live owner of the lock, if any. Expired locks read as absent.
pub async fn lock_owner(pool: &SqlitePool, task_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT owner FROM task_locks WHERE task_id = ?1 AND expires_at_ms > ?2")
            .bind(task_id)
            .bind(now_ms())
            .fetch_optional(pool)
            .await
            .context("failed to read lock owner")?;
    Ok(row.map(|(owner,)| owner))
}
