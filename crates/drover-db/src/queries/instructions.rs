//! Append-only instruction version ledger.
//!
//! Keyed by `<agent>:<goal>`. Each push records the full text, its sha256
//! digest, and a timestamp; agents consult the latest version before each
//! work cycle.

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::models::InstructionVersion;

use super::{decode_ts, encode_ts};

/// Compute the hex sha256 digest of an instruction body.
pub fn digest(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Append a new version under `instruction_id` and return the stored row.
pub async fn push_version(
    pool: &SqlitePool,
    instruction_id: &str,
    body: &str,
) -> Result<InstructionVersion> {
    let sha = digest(body);
    let pushed_at = Utc::now();

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO instruction_versions (instruction_id, body, sha256, pushed_at) \
         VALUES (?1, ?2, ?3, ?4) \
         RETURNING id",
    )
    .bind(instruction_id)
    .bind(body)
    .bind(&sha)
    .bind(encode_ts(&pushed_at))
    .fetch_one(pool)
    .await
    .context("failed to push instruction version")?;

    Ok(InstructionVersion {
        id,
        instruction_id: instruction_id.to_owned(),
        body: body.to_owned(),
        sha256: sha,
        pushed_at,
    })
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: i64,
    instruction_id: String,
    body: String,
    sha256: String,
    pushed_at: String,
}

impl VersionRow {
    fn into_version(self) -> Result<InstructionVersion> {
        let pushed_at = decode_ts(&self.pushed_at)
            .with_context(|| format!("corrupt version timestamp: {:?}", self.pushed_at))?;
        Ok(InstructionVersion {
            id: self.id,
            instruction_id: self.instruction_id,
            body: self.body,
            sha256: self.sha256,
            pushed_at,
        })
    }
}

/// The newest version for `instruction_id`, or `None` if never pushed.
pub async fn latest_version(
    pool: &SqlitePool,
    instruction_id: &str,
) -> Result<Option<InstructionVersion>> {
    let row: Option<VersionRow> = sqlx::query_as(
        "SELECT id, instruction_id, body, sha256, pushed_at \
         FROM instruction_versions WHERE instruction_id = ?1 \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(instruction_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest instruction version")?;

    row.map(VersionRow::into_version).transpose()
}

/// The full version history for `instruction_id`, oldest first.
pub async fn version_history(
    pool: &SqlitePool,
    instruction_id: &str,
) -> Result<Vec<InstructionVersion>> {
    let rows: Vec<VersionRow> = sqlx::query_as(
        "SELECT id, instruction_id, body, sha256, pushed_at \
         FROM instruction_versions WHERE instruction_id = ?1 \
         ORDER BY id ASC",
    )
    .bind(instruction_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch instruction history")?;

    rows.into_iter().map(VersionRow::into_version).collect()
}
