//! Scheduler-facing store operations: the ready list, stale-task
//! recovery, and synthesis of remediation/recovery nodes.
//!
//! These sit above the raw DAG/state/lock tables and encode the claiming
//! rules: a node is claimable when its status is READY or BLOCKED and
//! every dependency has reached a satisfied status. Crash detection is
//! lock-absence or lease expiry on a RUNNING/CLAIMED node.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::models::{meta, TaskNode, TaskState, TaskStatus};

use super::{dag, locks, state};

/// Reset tasks whose owner has evidently died.
///
/// A node whose status is RUNNING or CLAIMED is stale when its lock is
/// absent or its lease deadline has passed; its state is reset to READY
/// with owner and lease cleared. Returns the recovered ids.
pub async fn recover_stale_tasks(pool: &SqlitePool, goal_id: &str) -> Result<Vec<String>> {
    let Some(graph) = dag::read_dag(pool, goal_id).await? else {
        return Ok(Vec::new());
    };

    let now = Utc::now();
    let mut recovered = Vec::new();

    for node in &graph.nodes {
        let Some(task_state) = state::get_task_state(pool, &node.id).await? else {
            continue;
        };
        if !matches!(task_state.status, TaskStatus::Running | TaskStatus::Claimed) {
            continue;
        }

        let lock_missing = locks::lock_owner(pool, &node.id).await?.is_none();
        let lease_lapsed = task_state.lease_expires.is_some_and(|t| t <= now);
        if !(lock_missing || lease_lapsed) {
            continue;
        }

        info!(
            goal_id,
            task_id = %node.id,
            owner = task_state.owner.as_deref().unwrap_or("unknown"),
            lock_missing,
            lease_lapsed,
            "recovering stale task"
        );
        state::update_task_state(pool, &node.id, &task_state.as_ready()).await?;
        recovered.push(node.id.clone());
    }

    Ok(recovered)
}

/// Ids claimable right now, ordered by descending priority with ties
/// broken by DAG insertion order.
///
/// Runs stale recovery first, then promotes BLOCKED nodes whose
/// dependencies have all reached a satisfied status (the promotion is
/// written back).
pub async fn list_ready_tasks(pool: &SqlitePool, goal_id: &str) -> Result<Vec<String>> {
    let recovered = recover_stale_tasks(pool, goal_id).await?;
    if !recovered.is_empty() {
        info!(goal_id, count = recovered.len(), "stale tasks returned to ready");
    }

    let Some(graph) = dag::read_dag(pool, goal_id).await? else {
        debug!(goal_id, "no DAG found for goal");
        return Ok(Vec::new());
    };

    let mut states: HashMap<&str, TaskState> = HashMap::new();
    for node in &graph.nodes {
        if let Some(task_state) = state::get_task_state(pool, &node.id).await? {
            states.insert(node.id.as_str(), task_state);
        }
    }

    // Stable sort keeps insertion order within equal priorities.
    let mut ordered: Vec<&TaskNode> = graph.nodes.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut ready = Vec::new();
    let mut satisfied_count = 0usize;
    let mut waiting_count = 0usize;

    for node in ordered {
        let Some(task_state) = states.get(node.id.as_str()) else {
            continue;
        };
        if task_state.status.is_satisfied() || task_state.status.is_terminal() {
            satisfied_count += 1;
            continue;
        }

        let deps = graph.dependencies_for(&node.id);
        let deps_satisfied = deps.iter().all(|dep| {
            states
                .get(*dep)
                .is_some_and(|dep_state| dep_state.status.is_satisfied())
        });
        if !deps_satisfied {
            waiting_count += 1;
            continue;
        }

        match task_state.status {
            TaskStatus::Ready => ready.push(node.id.clone()),
            TaskStatus::Blocked => {
                state::update_task_state(pool, &node.id, &task_state.as_ready()).await?;
                ready.push(node.id.clone());
            }
            _ => {}
        }
    }

    debug!(
        goal_id,
        ready = ready.len(),
        satisfied = satisfied_count,
        waiting = waiting_count,
        total = graph.nodes.len(),
        "scanned goal for ready tasks"
    );
    Ok(ready)
}

/// Append a development node that a QA task becomes blocked on after a
/// failed review.
///
/// The node id is `{qa_task}__fix_{cycle}`, suffixed on collision. The QA
/// task gains an incoming edge from the new node; the new node starts
/// READY. Returns the node id.
pub async fn create_remediation_task(
    pool: &SqlitePool,
    goal_id: &str,
    qa_task: &str,
    dev_role: &str,
    cycle: u32,
    priority: u32,
) -> Result<String> {
    let id = unique_node_id(pool, goal_id, &format!("{qa_task}__fix_{cycle}")).await?;
    let title = format!("Remediate review findings for {qa_task} (cycle {cycle})");

    let node = TaskNode::new(id.clone(), title, priority)
        .with_meta(meta::PHASE, "development")
        .with_meta(meta::REQUIRED_ROLE, dev_role)
        .with_meta(meta::PARENT_TASK_ID, qa_task)
        .with_meta(meta::REVIEW_CYCLE, cycle.to_string())
        .with_meta(meta::DEV_ROLE, dev_role);

    append_blocking_node(pool, goal_id, &node, qa_task).await?;
    info!(goal_id, qa_task, remediation = %id, cycle, "created remediation task");
    Ok(id)
}

/// Append a development node that a failed task becomes blocked on while
/// a recoverable error is repaired.
///
/// The node id is `{blocked_task}__recover_{attempt}`, suffixed on
/// collision. Returns the node id.
pub async fn create_recovery_task(
    pool: &SqlitePool,
    goal_id: &str,
    blocked_task: &str,
    owner_role: &str,
    attempt: u32,
    priority: u32,
    title: &str,
) -> Result<String> {
    let id = unique_node_id(pool, goal_id, &format!("{blocked_task}__recover_{attempt}")).await?;

    let node = TaskNode::new(id.clone(), title, priority)
        .with_meta(meta::PHASE, "development")
        .with_meta(meta::REQUIRED_ROLE, owner_role)
        .with_meta(meta::RECOVERY_FOR, blocked_task)
        .with_meta(meta::RECOVERY_ATTEMPT, attempt.to_string());

    append_blocking_node(pool, goal_id, &node, blocked_task).await?;
    info!(goal_id, blocked_task, recovery = %id, attempt, "created recovery task");
    Ok(id)
}

/// Find an unused node id starting from `base`, appending `_2`, `_3`, …
/// on collision.
async fn unique_node_id(pool: &SqlitePool, goal_id: &str, base: &str) -> Result<String> {
    let mut candidate = base.to_owned();
    let mut n = 2u32;
    while node_exists(pool, goal_id, &candidate).await? {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    Ok(candidate)
}

async fn node_exists(pool: &SqlitePool, goal_id: &str, node_id: &str) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM dag_nodes WHERE goal_id = ?1 AND node_id = ?2)",
    )
    .bind(goal_id)
    .bind(node_id)
    .fetch_one(pool)
    .await
    .context("failed to check node existence")?;
    Ok(row.0 != 0)
}

/// Insert `node` into the goal's DAG with no dependencies of its own, add
/// it as an incoming edge to `blocks_task`, and initialize its state to
/// READY. Runs in one transaction.
async fn append_blocking_node(
    pool: &SqlitePool,
    goal_id: &str,
    node: &TaskNode,
    blocks_task: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to begin node append")?;

    let target_deps: Option<(String,)> =
        sqlx::query_as("SELECT deps_json FROM dag_deps WHERE goal_id = ?1 AND node_id = ?2")
            .bind(goal_id)
            .bind(blocks_task)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to read target deps")?;
    let Some((deps_json,)) = target_deps else {
        bail!("task {blocks_task} not found in goal {goal_id}");
    };
    let mut target_deps: Vec<String> =
        serde_json::from_str(&deps_json).context("corrupt dependency list")?;

    let (max_position,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(position), -1) FROM dag_nodes WHERE goal_id = ?1",
    )
    .bind(goal_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to read max node position")?;

    let node_json = serde_json::to_string(node).context("failed to encode node")?;
    sqlx::query(
        "INSERT INTO dag_nodes (goal_id, node_id, node_json, position) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(goal_id)
    .bind(&node.id)
    .bind(node_json)
    .bind(max_position + 1)
    .execute(&mut *tx)
    .await
    .context("failed to insert synthesized node")?;

    sqlx::query("INSERT INTO dag_deps (goal_id, node_id, deps_json) VALUES (?1, ?2, '[]')")
        .bind(goal_id)
        .bind(&node.id)
        .execute(&mut *tx)
        .await
        .context("failed to insert synthesized node deps")?;

    target_deps.push(node.id.clone());
    let deps_json = serde_json::to_string(&target_deps).context("failed to encode deps")?;
    sqlx::query("UPDATE dag_deps SET deps_json = ?1 WHERE goal_id = ?2 AND node_id = ?3")
        .bind(deps_json)
        .bind(goal_id)
        .bind(blocks_task)
        .execute(&mut *tx)
        .await
        .context("failed to link synthesized node")?;

    let fresh = TaskState::new(TaskStatus::Ready);
    let artifacts_json =
        serde_json::to_string(&fresh.artifacts).context("failed to encode artifacts")?;
    sqlx::query(
        "INSERT INTO task_states \
            (task_id, status, owner, lease_expires, progress, artifacts_json, last_error) \
         VALUES (?1, ?2, NULL, NULL, NULL, ?3, NULL) \
         ON CONFLICT(task_id) DO UPDATE SET \
            status = excluded.status, \
            owner = NULL, \
            lease_expires = NULL, \
            progress = NULL, \
            artifacts_json = excluded.artifacts_json, \
            last_error = NULL",
    )
    .bind(&node.id)
    .bind(fresh.status.to_string())
    .bind(artifacts_json)
    .execute(&mut *tx)
    .await
    .context("failed to initialize synthesized node state")?;

    tx.commit().await.context("failed to commit node append")?;
    Ok(())
}
