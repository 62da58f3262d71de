//! Per-task state records: full-overwrite reads and writes.
//!
//! The state row is the durable half of a task's lifecycle; the lock row
//! (see [`super::locks`]) is the ephemeral half. Writers are expected to
//! hold the task's lock except for startup recovery and operator
//! directives.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{TaskState, TaskStatus};

use super::{decode_ts, encode_ts};

#[derive(sqlx::FromRow)]
struct StateRow {
    status: String,
    owner: Option<String>,
    lease_expires: Option<String>,
    progress: Option<String>,
    artifacts_json: String,
    last_error: Option<String>,
}

impl StateRow {
    fn into_state(self) -> Result<TaskState> {
        let status: TaskStatus = self
            .status
            .parse()
            .with_context(|| format!("corrupt status in state row: {:?}", self.status))?;
        let artifacts: Vec<String> = serde_json::from_str(&self.artifacts_json)
            .context("corrupt artifacts list in state row")?;
        Ok(TaskState {
            status,
            owner: self.owner,
            lease_expires: self.lease_expires.as_deref().and_then(decode_ts),
            progress: self.progress,
            artifacts,
            last_error: self.last_error,
        })
    }
}

/// Fetch a task's state, or `None` if the task has never been written.
pub async fn get_task_state(pool: &SqlitePool, task_id: &str) -> Result<Option<TaskState>> {
    let row: Option<StateRow> = sqlx::query_as(
        "SELECT status, owner, lease_expires, progress, artifacts_json, last_error \
         FROM task_states WHERE task_id = ?1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch task state")?;

    row.map(StateRow::into_state).transpose()
}

/// Overwrite a task's state record.
pub async fn update_task_state(pool: &SqlitePool, task_id: &str, state: &TaskState) -> Result<()> {
    let artifacts_json =
        serde_json::to_string(&state.artifacts).context("failed to encode artifacts")?;

    sqlx::query(
        "INSERT INTO task_states \
            (task_id, status, owner, lease_expires, progress, artifacts_json, last_error) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT(task_id) DO UPDATE SET \
            status = excluded.status, \
            owner = excluded.owner, \
            lease_expires = excluded.lease_expires, \
            progress = excluded.progress, \
            artifacts_json = excluded.artifacts_json, \
            last_error = excluded.last_error",
    )
    .bind(task_id)
    .bind(state.status.to_string())
    .bind(&state.owner)
    .bind(state.lease_expires.as_ref().map(encode_ts))
    .bind(&state.progress)
    .bind(artifacts_json)
    .bind(&state.last_error)
    .execute(pool)
    .await
    .context("failed to update task state")?;

    Ok(())
}
