//! Agent liveness: registration, TTL heartbeats, and memory snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::AgentRegistration;

use super::{decode_ts, encode_ts, now_ms};

/// Register an agent under its name with its process id and capability
/// map. Re-registration overwrites the previous record.
pub async fn register_agent(
    pool: &SqlitePool,
    name: &str,
    pid: u32,
    capabilities: &BTreeMap<String, String>,
) -> Result<()> {
    let capabilities_json =
        serde_json::to_string(capabilities).context("failed to encode capabilities")?;

    sqlx::query(
        "INSERT INTO agents (name, pid, registered_at, capabilities_json) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(name) DO UPDATE SET \
            pid = excluded.pid, \
            registered_at = excluded.registered_at, \
            capabilities_json = excluded.capabilities_json",
    )
    .bind(name)
    .bind(i64::from(pid))
    .bind(encode_ts(&Utc::now()))
    .bind(capabilities_json)
    .execute(pool)
    .await
    .context("failed to register agent")?;

    Ok(())
}

/// Remove an agent's registration and heartbeat. Memory snapshots are
/// kept so a restarted agent can rehydrate.
pub async fn deregister_agent(pool: &SqlitePool, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM agents WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await
        .context("failed to deregister agent")?;
    sqlx::query("DELETE FROM agent_heartbeats WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await
        .context("failed to clear agent heartbeat")?;
    Ok(())
}

/// Fetch an agent's registration record.
pub async fn get_registration(pool: &SqlitePool, name: &str) -> Result<Option<AgentRegistration>> {
    let row: Option<(i64, String, String)> = sqlx::query_as(
        "SELECT pid, registered_at, capabilities_json FROM agents WHERE name = ?1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch agent registration")?;

    let Some((pid, registered_at, capabilities_json)) = row else {
        return Ok(None);
    };

    let capabilities: BTreeMap<String, String> =
        serde_json::from_str(&capabilities_json).context("corrupt capability map")?;
    let registered_at = decode_ts(&registered_at)
        .with_context(|| format!("corrupt registration timestamp: {registered_at:?}"))?;

    Ok(Some(AgentRegistration {
        name: name.to_owned(),
        pid,
        registered_at,
        capabilities,
    }))
}

/// Publish a TTL-bounded heartbeat for the agent.
pub async fn heartbeat_agent(pool: &SqlitePool, name: &str, ttl: Duration) -> Result<()> {
    let expires = now_ms() + ttl.as_millis() as i64;
    sqlx::query(
        "INSERT INTO agent_heartbeats (name, beat_at, expires_at_ms) VALUES (?1, ?2, ?3) \
         ON CONFLICT(name) DO UPDATE SET \
            beat_at = excluded.beat_at, \
            expires_at_ms = excluded.expires_at_ms",
    )
    .bind(name)
    .bind(encode_ts(&Utc::now()))
    .bind(expires)
    .execute(pool)
    .await
    .context("failed to publish heartbeat")?;
    Ok(())
}

/// The agent's last heartbeat timestamp, or `None` once the TTL lapsed.
pub async fn agent_last_heartbeat(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT beat_at FROM agent_heartbeats WHERE name = ?1 AND expires_at_ms > ?2",
    )
    .bind(name)
    .bind(now_ms())
    .fetch_optional(pool)
    .await
    .context("failed to read heartbeat")?;

    Ok(row.and_then(|(beat_at,)| decode_ts(&beat_at)))
}

/// Persist an agent's memory snapshot, replacing any previous one.
pub async fn store_memory_snapshot(
    pool: &SqlitePool,
    name: &str,
    entries: &[String],
) -> Result<()> {
    let entries_json = serde_json::to_string(entries).context("failed to encode memory")?;
    sqlx::query(
        "INSERT INTO agent_memory (name, entries_json) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET entries_json = excluded.entries_json",
    )
    .bind(name)
    .bind(entries_json)
    .execute(pool)
    .await
    .context("failed to store memory snapshot")?;
    Ok(())
}

/// Load an agent's memory snapshot. A missing or unreadable snapshot
/// loads as empty.
pub async fn load_memory_snapshot(pool: &SqlitePool, name: &str) -> Result<Vec<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT entries_json FROM agent_memory WHERE name = ?1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("failed to load memory snapshot")?;

    Ok(row
        .and_then(|(entries_json,)| serde_json::from_str(&entries_json).ok())
        .unwrap_or_default())
}
