//! Goal-wide spending-cap backoff deadlines.
//!
//! While a deadline is in the future, no agent on the goal may invoke the
//! oracle for work. Writes never move an existing deadline earlier.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;

use super::now_ms;

/// Set the goal's backoff deadline. An earlier deadline than the stored
/// one is ignored.
pub async fn set_goal_backoff_until(
    pool: &SqlitePool,
    goal_id: &str,
    until: DateTime<Utc>,
) -> Result<()> {
    let until_ms = until.timestamp_millis();
    sqlx::query(
        "INSERT INTO goal_backoffs (goal_id, until_ms) VALUES (?1, ?2) \
         ON CONFLICT(goal_id) DO UPDATE SET \
            until_ms = MAX(goal_backoffs.until_ms, excluded.until_ms)",
    )
    .bind(goal_id)
    .bind(until_ms)
    .execute(pool)
    .await
    .context("failed to set goal backoff")?;
    Ok(())
}

/// The goal's backoff deadline if it is still in the future, else `None`.
pub async fn get_goal_backoff_until(
    pool: &SqlitePool,
    goal_id: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT until_ms FROM goal_backoffs WHERE goal_id = ?1 AND until_ms > ?2")
            .bind(goal_id)
            .bind(now_ms())
            .fetch_optional(pool)
            .await
            .context("failed to read goal backoff")?;

    Ok(row.and_then(|(until_ms,)| Utc.timestamp_millis_opt(until_ms).single()))
}

/// Drop the goal's backoff deadline regardless of its value.
pub async fn clear_goal_backoff(pool: &SqlitePool, goal_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM goal_backoffs WHERE goal_id = ?1")
        .bind(goal_id)
        .execute(pool)
        .await
        .context("failed to clear goal backoff")?;
    Ok(())
}
