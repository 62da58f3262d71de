//! DAG persistence: nodes and dependency lists keyed by goal.
//!
//! The graph is stored as two maps (nodes by id, dependency lists by id),
//! never as in-memory references, so any process can reconstruct it from
//! store state alone. Node insertion order is recorded for the ready-list
//! tie-break.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

use crate::models::{GoalDag, TaskEdge, TaskNode, TaskState, TaskStatus};

/// Atomically replace the stored DAG for the goal and initialize every
/// node's state: READY when the node has no incoming edges, BLOCKED
/// otherwise.
pub async fn write_dag(pool: &SqlitePool, dag: &GoalDag) -> Result<()> {
    debug!(
        goal_id = %dag.goal_id,
        nodes = dag.nodes.len(),
        edges = dag.edges.len(),
        "writing DAG to store"
    );

    let mut tx = pool.begin().await.context("failed to begin DAG write")?;

    sqlx::query("DELETE FROM dag_nodes WHERE goal_id = ?1")
        .bind(&dag.goal_id)
        .execute(&mut *tx)
        .await
        .context("failed to clear DAG nodes")?;
    sqlx::query("DELETE FROM dag_deps WHERE goal_id = ?1")
        .bind(&dag.goal_id)
        .execute(&mut *tx)
        .await
        .context("failed to clear DAG deps")?;

    for (position, node) in dag.nodes.iter().enumerate() {
        let node_json = serde_json::to_string(node).context("failed to encode node")?;
        sqlx::query(
            "INSERT INTO dag_nodes (goal_id, node_id, node_json, position) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&dag.goal_id)
        .bind(&node.id)
        .bind(node_json)
        .bind(position as i64)
        .execute(&mut *tx)
        .await
        .context("failed to insert DAG node")?;

        let deps = dag.dependencies_for(&node.id);
        let deps_json = serde_json::to_string(&deps).context("failed to encode deps")?;
        sqlx::query("INSERT INTO dag_deps (goal_id, node_id, deps_json) VALUES (?1, ?2, ?3)")
            .bind(&dag.goal_id)
            .bind(&node.id)
            .bind(deps_json)
            .execute(&mut *tx)
            .await
            .context("failed to insert DAG deps")?;

        let status = if deps.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Blocked
        };
        let state = TaskState::new(status);
        let artifacts_json =
            serde_json::to_string(&state.artifacts).context("failed to encode artifacts")?;
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
        .bind(state.status.to_string())
        .bind(artifacts_json)
        .execute(&mut *tx)
        .await
        .context("failed to initialize task state")?;
    }

    tx.commit().await.context("failed to commit DAG write")?;
    Ok(())
}

/// Read the stored DAG for a goal, or `None` if no DAG has been written.
pub async fn read_dag(pool: &SqlitePool, goal_id: &str) -> Result<Option<GoalDag>> {
    let node_rows: Vec<(String,)> = sqlx::query_as(
        "SELECT node_json FROM dag_nodes WHERE goal_id = ?1 ORDER BY position ASC",
    )
    .bind(goal_id)
    .fetch_all(pool)
    .await
    .context("failed to read DAG nodes")?;

    if node_rows.is_empty() {
        return Ok(None);
    }

    let mut nodes = Vec::with_capacity(node_rows.len());
    for (node_json,) in &node_rows {
        let node: TaskNode =
            serde_json::from_str(node_json).context("corrupt node in DAG store")?;
        nodes.push(node);
    }

    let dep_rows: Vec<(String, String)> =
        sqlx::query_as("SELECT node_id, deps_json FROM dag_deps WHERE goal_id = ?1")
            .bind(goal_id)
            .fetch_all(pool)
            .await
            .context("failed to read DAG deps")?;

    let mut edges = Vec::new();
    for (node_id, deps_json) in &dep_rows {
        let deps: Vec<String> =
            serde_json::from_str(deps_json).context("corrupt dependency list in DAG store")?;
        for dep in deps {
            edges.push(TaskEdge::new(dep, node_id.clone()));
        }
    }

    let dag = GoalDag::new(goal_id, nodes, edges).context("stored DAG failed validation")?;
    Ok(Some(dag))
}

/// Fetch a single node from a goal's DAG.
pub async fn get_task_node(
    pool: &SqlitePool,
    goal_id: &str,
    task_id: &str,
) -> Result<Option<TaskNode>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT node_json FROM dag_nodes WHERE goal_id = ?1 AND node_id = ?2")
            .bind(goal_id)
            .bind(task_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch DAG node")?;

    row.map(|(node_json,)| {
        serde_json::from_str(&node_json).context("corrupt node in DAG store")
    })
    .transpose()
}

/// Patch a node in place (metadata, priority, title). Never touches state
/// or dependencies.
pub async fn update_task_node(pool: &SqlitePool, goal_id: &str, node: &TaskNode) -> Result<()> {
    let node_json = serde_json::to_string(node).context("failed to encode node")?;
    let result =
        sqlx::query("UPDATE dag_nodes SET node_json = ?1 WHERE goal_id = ?2 AND node_id = ?3")
            .bind(node_json)
            .bind(goal_id)
            .bind(&node.id)
            .execute(pool)
            .await
            .context("failed to update DAG node")?;

    if result.rows_affected() == 0 {
        bail!("node {} not found in goal {}", node.id, goal_id);
    }
    Ok(())
}
