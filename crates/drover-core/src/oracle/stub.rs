//! Deterministic oracle stubs.
//!
//! [`StubOracle`] answers every operation heuristically so the runtime can
//! be exercised without a provider; [`ScriptedOracle`] layers per-call
//! queues on top for tests that need specific outcomes in sequence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;

use drover_db::models::{GoalDag, TaskEdge, TaskNode};

use super::{ExecutionReport, ExecutionStatus, Oracle, RecoveryAssessment, TaskSelection};

/// Build a linear DAG from bullet-list instructions ("- step" lines).
///
/// Falls back to a single bootstrap node when no bullets are present.
pub fn dag_from_bullets(instructions: &str, goal_id: &str) -> GoalDag {
    let mut nodes: Vec<TaskNode> = Vec::new();
    let mut edges: Vec<TaskEdge> = Vec::new();
    for line in instructions.lines() {
        let line = line.trim();
        let Some(title) = line.strip_prefix('-') else {
            continue;
        };
        let title = title.trim();
        let node_id = format!("task-{:03}", nodes.len() + 1);
        let title = if title.is_empty() {
            format!("Step {}", nodes.len() + 1)
        } else {
            title.to_owned()
        };
        if let Some(previous) = nodes.last() {
            edges.push(TaskEdge::new(previous.id.clone(), node_id.clone()));
        }
        let priority = nodes.len() as u32;
        nodes.push(TaskNode::new(node_id, title, priority));
    }
    if nodes.is_empty() {
        nodes.push(TaskNode::new("task-001", "Bootstrap goal", 0));
    }
    GoalDag {
        goal_id: goal_id.to_owned(),
        nodes,
        edges,
    }
}

/// Heuristic oracle: picks the first ready node, executes everything
/// successfully, and classifies every error as recoverable.
#[derive(Debug, Default)]
pub struct StubOracle {
    dag_blueprint: Option<GoalDag>,
}

impl StubOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `create_goal_dag` with a fixed DAG instead of bullets.
    pub fn with_dag(dag: GoalDag) -> Self {
        Self {
            dag_blueprint: Some(dag),
        }
    }
}

#[async_trait]
impl Oracle for StubOracle {
    async fn create_goal_dag(&self, instructions: &str, goal_id: &str) -> Result<GoalDag> {
        if let Some(blueprint) = &self.dag_blueprint {
            return Ok(blueprint.clone());
        }
        Ok(dag_from_bullets(instructions, goal_id))
    }

    async fn select_next_task(
        &self,
        ready_nodes: &[TaskNode],
        _memory: &[String],
        _goal_id: &str,
        _instructions: &str,
    ) -> Result<TaskSelection> {
        match ready_nodes.first() {
            Some(node) => Ok(TaskSelection {
                selected_task_id: Some(node.id.clone()),
                justification: "highest priority ready node".to_owned(),
                confidence: 0.9,
            }),
            None => Ok(TaskSelection {
                selected_task_id: None,
                justification: "no ready tasks".to_owned(),
                confidence: 0.0,
            }),
        }
    }

    async fn execute_task(
        &self,
        task: &TaskNode,
        goal_id: &str,
        _instructions: &str,
        _memory: &[String],
    ) -> Result<ExecutionReport> {
        Ok(ExecutionReport {
            status: ExecutionStatus::Done,
            outputs: vec![format!("artifact://{}.txt", task.id)],
            notes: format!("Executed {} for goal {goal_id}", task.title),
            follow_ups: vec![],
        })
    }

    async fn summarize_task(
        &self,
        task: &TaskNode,
        execution: &ExecutionReport,
        _goal_id: &str,
        _instructions: &str,
        _memory: &[String],
    ) -> Result<String> {
        Ok(format!(
            "Task {} completed with outputs {:?}. Notes: {}",
            task.id, execution.outputs, execution.notes
        ))
    }

    async fn assess_recovery(
        &self,
        task: &TaskNode,
        error: &str,
        _goal_id: &str,
        _instructions: &str,
        _memory: &[String],
    ) -> Result<RecoveryAssessment> {
        Ok(RecoveryAssessment {
            recoverable: true,
            reason: format!("stub assessment for {}: {error}", task.id),
            remediation_title: format!("Recover {}", task.id),
            remediation_steps: vec!["retry the failing step".to_owned()],
            confidence: 1.0,
        })
    }
}

/// One scripted answer for an `execute_task` call.
#[derive(Debug, Clone)]
pub enum ScriptedExecution {
    /// Return this report.
    Report(ExecutionReport),
    /// Fail the call with this error message.
    Error(String),
}

/// Oracle with scripted per-operation queues, falling back to
/// [`StubOracle`] behavior when a queue is empty.
///
/// Call counters let tests assert which operations ran.
#[derive(Default)]
pub struct ScriptedOracle {
    fallback: StubOracle,
    executions: Mutex<VecDeque<ScriptedExecution>>,
    assessments: Mutex<VecDeque<RecoveryAssessment>>,
    forbid_selection: AtomicBool,
    pub select_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next `execute_task` outcome.
    pub fn push_execution(&self, outcome: ScriptedExecution) {
        self.executions
            .lock()
            .expect("execution queue poisoned")
            .push_back(outcome);
    }

    /// Queue a successful execution with the given outputs.
    pub fn push_done(&self, outputs: &[&str]) {
        self.push_execution(ScriptedExecution::Report(ExecutionReport {
            status: ExecutionStatus::Done,
            outputs: outputs.iter().map(|s| (*s).to_owned()).collect(),
            notes: "scripted success".to_owned(),
            follow_ups: vec![],
        }));
    }

    /// Queue an execution returning `failed` with the given notes.
    pub fn push_failed(&self, notes: &str) {
        self.push_execution(ScriptedExecution::Report(ExecutionReport {
            status: ExecutionStatus::Failed,
            outputs: vec![],
            notes: notes.to_owned(),
            follow_ups: vec![],
        }));
    }

    /// Queue an execution that raises an error.
    pub fn push_error(&self, message: &str) {
        self.push_execution(ScriptedExecution::Error(message.to_owned()));
    }

    /// Queue the next `assess_recovery` answer.
    pub fn push_assessment(&self, assessment: RecoveryAssessment) {
        self.assessments
            .lock()
            .expect("assessment queue poisoned")
            .push_back(assessment);
    }

    /// Make any `select_next_task` call panic. Used to prove gating paths
    /// never reach the oracle.
    pub fn forbid_selection(&self) {
        self.forbid_selection.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn create_goal_dag(&self, instructions: &str, goal_id: &str) -> Result<GoalDag> {
        self.fallback.create_goal_dag(instructions, goal_id).await
    }

    async fn select_next_task(
        &self,
        ready_nodes: &[TaskNode],
        memory: &[String],
        goal_id: &str,
        instructions: &str,
    ) -> Result<TaskSelection> {
        assert!(
            !self.forbid_selection.load(Ordering::SeqCst),
            "select_next_task called while forbidden"
        );
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        self.fallback
            .select_next_task(ready_nodes, memory, goal_id, instructions)
            .await
    }

    async fn execute_task(
        &self,
        task: &TaskNode,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<ExecutionReport> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .executions
            .lock()
            .expect("execution queue poisoned")
            .pop_front();
        match scripted {
            Some(ScriptedExecution::Report(report)) => Ok(report),
            Some(ScriptedExecution::Error(message)) => bail!(message),
            None => {
                self.fallback
                    .execute_task(task, goal_id, instructions, memory)
                    .await
            }
        }
    }

    async fn summarize_task(
        &self,
        task: &TaskNode,
        execution: &ExecutionReport,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<String> {
        self.fallback
            .summarize_task(task, execution, goal_id, instructions, memory)
            .await
    }

    async fn assess_recovery(
        &self,
        task: &TaskNode,
        error: &str,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<RecoveryAssessment> {
        let scripted = self
            .assessments
            .lock()
            .expect("assessment queue poisoned")
            .pop_front();
        match scripted {
            Some(assessment) => Ok(assessment),
            None => {
                self.fallback
                    .assess_recovery(task, error, goal_id, instructions, memory)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bullets_become_a_linear_chain() {
        let instructions = "# goal\n- first step\n- second step\nnot a bullet\n- third step\n";
        let dag = dag_from_bullets(instructions, "g");
        assert_eq!(dag.nodes.len(), 3);
        assert_eq!(dag.edges.len(), 2);
        assert_eq!(dag.nodes[0].title, "first step");
        assert_eq!(dag.edges[0].source, "task-001");
        assert_eq!(dag.edges[0].target, "task-002");
        assert!(GoalDag::new("g", dag.nodes.clone(), dag.edges.clone()).is_ok());
    }

    #[tokio::test]
    async fn empty_instructions_bootstrap_one_node() {
        let dag = dag_from_bullets("", "g");
        assert_eq!(dag.nodes.len(), 1);
        assert_eq!(dag.nodes[0].id, "task-001");
    }

    #[tokio::test]
    async fn stub_selects_first_ready() {
        let oracle = StubOracle::new();
        let nodes = vec![TaskNode::new("a", "A", 1), TaskNode::new("b", "B", 2)];
        let selection = oracle.select_next_task(&nodes, &[], "g", "").await.unwrap();
        assert_eq!(selection.selected_task_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn scripted_executions_pop_in_order() {
        let oracle = ScriptedOracle::new();
        oracle.push_failed("broken tests");
        oracle.push_done(&["artifact://fixed.txt"]);

        let node = TaskNode::new("n1", "N1", 0);
        let first = oracle.execute_task(&node, "g", "", &[]).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Failed);
        let second = oracle.execute_task(&node, "g", "", &[]).await.unwrap();
        assert_eq!(second.status, ExecutionStatus::Done);
        assert_eq!(second.outputs, vec!["artifact://fixed.txt"]);
        assert_eq!(oracle.execute_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scripted_error_raises() {
        let oracle = ScriptedOracle::new();
        oracle.push_error("node: command not found");
        let node = TaskNode::new("n1", "N1", 0);
        let err = oracle.execute_task(&node, "g", "", &[]).await.unwrap_err();
        assert!(err.to_string().contains("command not found"));
    }

    #[tokio::test]
    #[should_panic(expected = "select_next_task called while forbidden")]
    async fn forbidden_selection_panics() {
        let oracle = ScriptedOracle::new();
        oracle.forbid_selection();
        let _ = oracle.select_next_task(&[], &[], "g", "").await;
    }
}
