//! The oracle seam: a typed facade over the external LLM provider.
//!
//! Five structured operations drive the whole runtime: DAG proposal, task
//! selection, task execution, summarization, and recoverability
//! assessment. The trait is object-safe so the production CLI-backed
//! client and the deterministic stubs are interchangeable.

pub mod backoff;
pub mod cli;
pub mod prompt;
pub mod stub;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drover_db::models::{GoalDag, TaskNode};

/// Outcome class reported by a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Done,
    Failed,
    Blocked,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

/// Result of a task-selection call.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSelection {
    /// Chosen task id, or `None` when the oracle declines to pick.
    pub selected_task_id: Option<String>,
    pub justification: String,
    /// Selection confidence, clamped to `[0, 1]`.
    pub confidence: f64,
}

/// Structured outcome of a task execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    /// Opaque artifact references produced by the execution.
    pub outputs: Vec<String>,
    pub notes: String,
    /// Suggested follow-up task ids (advisory only).
    pub follow_ups: Vec<String>,
}

/// Result of a recoverability assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAssessment {
    pub recoverable: bool,
    pub reason: String,
    pub remediation_title: String,
    pub remediation_steps: Vec<String>,
    /// Assessment confidence, clamped to `[0, 1]`.
    pub confidence: f64,
}

/// Callback invoked when the provider reports a spending cap, before the
/// client sleeps until the parsed reset time. The agent uses this to
/// publish the goal-wide backoff deadline.
#[async_trait]
pub trait BackoffNotifier: Send + Sync {
    async fn spending_cap_hit(&self, resume_at: DateTime<Utc>, sleep: Duration);
}

/// The external LLM provider behind a typed interface.
///
/// Implementations must return errors (not panic) for malformed provider
/// output; the runtime feeds those errors into its recovery path.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Propose a task DAG for a goal from its instruction text.
    async fn create_goal_dag(&self, instructions: &str, goal_id: &str) -> Result<GoalDag>;

    /// Choose the next task among currently ready, role-eligible nodes.
    async fn select_next_task(
        &self,
        ready_nodes: &[TaskNode],
        memory: &[String],
        goal_id: &str,
        instructions: &str,
    ) -> Result<TaskSelection>;

    /// Execute a task and report the structured outcome.
    async fn execute_task(
        &self,
        task: &TaskNode,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<ExecutionReport>;

    /// Produce a non-empty progress summary for a completed execution.
    async fn summarize_task(
        &self,
        task: &TaskNode,
        execution: &ExecutionReport,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<String>;

    /// Classify whether a failed execution is worth a recovery task.
    async fn assess_recovery(
        &self,
        task: &TaskNode,
        error: &str,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<RecoveryAssessment>;
}

// Compile-time assertion: Oracle must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Oracle) {}
};
