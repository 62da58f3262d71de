use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task within its goal's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Ready,
    Claimed,
    Running,
    Blocked,
    DevDone,
    QaFailed,
    QaPassed,
    Integrated,
    Done,
    Failed,
}

impl TaskStatus {
    /// Whether this status satisfies a dependency edge pointing at it.
    pub fn is_satisfied(self) -> bool {
        matches!(
            self,
            Self::DevDone | Self::QaPassed | Self::Integrated | Self::Done
        )
    }

    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::DevDone => "dev_done",
            Self::QaFailed => "qa_failed",
            Self::QaPassed => "qa_passed",
            Self::Integrated => "integrated",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "blocked" => Ok(Self::Blocked),
            "dev_done" => Ok(Self::DevDone),
            "qa_failed" => Ok(Self::QaFailed),
            "qa_passed" => Ok(Self::QaPassed),
            "integrated" => Ok(Self::Integrated),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Pipeline phase a task belongs to, read from node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Development,
    Qa,
    Integration,
}

impl Phase {
    /// Parse a metadata phase value. Unknown strings map to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "development" => Some(Self::Development),
            "qa" => Some(Self::Qa),
            "integration" => Some(Self::Integration),
            _ => None,
        }
    }

    /// The status a successful execution transitions the task to.
    pub fn completion_status(self) -> TaskStatus {
        match self {
            Self::Development => TaskStatus::DevDone,
            Self::Qa => TaskStatus::QaPassed,
            Self::Integration => TaskStatus::Done,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Development => "development",
            Self::Qa => "qa",
            Self::Integration => "integration",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Metadata keys
// ---------------------------------------------------------------------------

/// Reserved task metadata keys.
pub mod meta {
    pub const PHASE: &str = "phase";
    pub const REQUIRED_ROLE: &str = "required_role";
    pub const PARENT_TASK_ID: &str = "parent_task_id";
    pub const REVIEW_CYCLE: &str = "review_cycle";
    pub const DEV_ROLE: &str = "dev_role";
    pub const MANAGER_ROLE: &str = "manager_role";
    pub const RECOVERY_ATTEMPTS: &str = "recovery_attempts";
    pub const RECOVERY_ATTEMPT: &str = "recovery_attempt";
    pub const RECOVERY_FOR: &str = "recovery_for";
    pub const LAST_RECOVERY_REASON: &str = "last_recovery_reason";
}

// ---------------------------------------------------------------------------
// DAG value types
// ---------------------------------------------------------------------------

/// A node in a goal's task DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub expected_artifacts: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TaskNode {
    /// Create a node with empty artifacts and metadata.
    pub fn new(id: impl Into<String>, title: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority,
            expected_artifacts: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Read a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Write a metadata value, returning `self` for chaining.
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    /// Read a metadata value as a non-negative integer; absent or
    /// malformed values read as `None`.
    pub fn meta_u32(&self, key: &str) -> Option<u32> {
        self.meta(key).and_then(|v| v.parse().ok())
    }

    /// The pipeline phase from metadata, if recognized.
    pub fn phase(&self) -> Option<Phase> {
        self.meta(meta::PHASE).and_then(Phase::parse)
    }

    /// The role string that may claim this task, if restricted.
    pub fn required_role(&self) -> Option<&str> {
        self.meta(meta::REQUIRED_ROLE)
    }
}

/// A directed dependency edge: `target` depends on `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEdge {
    pub source: String,
    pub target: String,
}

impl TaskEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A goal's task DAG: nodes plus dependency edges.
///
/// Construction validates referential integrity (every edge endpoint names
/// an existing node, node ids are unique). Acyclicity is checked
/// separately via [`GoalDag::ensure_acyclic`] so callers can report cycle
/// paths distinctly from dangling edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalDag {
    pub goal_id: String,
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<TaskEdge>,
}

impl GoalDag {
    /// Build a DAG, rejecting duplicate node ids and dangling edges.
    pub fn new(
        goal_id: impl Into<String>,
        nodes: Vec<TaskNode>,
        edges: Vec<TaskEdge>,
    ) -> Result<Self, DagError> {
        let dag = Self {
            goal_id: goal_id.into(),
            nodes,
            edges,
        };
        dag.validate_references()?;
        Ok(dag)
    }

    fn validate_references(&self) -> Result<(), DagError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(DagError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }
        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                return Err(DagError::DanglingEdge {
                    endpoint: edge.source.clone(),
                });
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(DagError::DanglingEdge {
                    endpoint: edge.target.clone(),
                });
            }
        }
        Ok(())
    }

    /// Ids of the nodes `node_id` depends on (incoming edge sources).
    pub fn dependencies_for(&self, node_id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.target == node_id)
            .map(|e| e.source.as_str())
            .collect()
    }

    /// Look up a node by id.
    pub fn node(&self, node_id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Verify the edge set is acyclic via three-color depth-first search.
    ///
    /// Returns the cycle path on failure.
    pub fn ensure_acyclic(&self) -> Result<(), DagError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in &self.nodes {
            adjacency.entry(node.id.as_str()).or_default();
        }
        for edge in &self.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        let mut marks: BTreeMap<&str, Mark> = adjacency
            .keys()
            .map(|&id| (id, Mark::Unvisited))
            .collect();

        fn visit<'a>(
            node: &'a str,
            adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Result<(), DagError> {
            match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    let mut path: Vec<&str> = stack.clone();
                    path.push(node);
                    return Err(DagError::Cycle {
                        path: path.join(" -> "),
                    });
                }
                Mark::Unvisited => {}
            }
            marks.insert(node, Mark::InProgress);
            stack.push(node);
            if let Some(neighbors) = adjacency.get(node) {
                for &next in neighbors {
                    visit(next, adjacency, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let ids: Vec<&str> = adjacency.keys().copied().collect();
        for id in ids {
            let mut stack = Vec::new();
            visit(id, &adjacency, &mut marks, &mut stack)?;
        }
        Ok(())
    }
}

/// Errors from DAG construction and validation.
#[derive(Debug, Clone)]
pub enum DagError {
    /// Two nodes share an id.
    DuplicateNode { node_id: String },
    /// An edge references a node that does not exist.
    DanglingEdge { endpoint: String },
    /// The edge set contains a cycle.
    Cycle { path: String },
}

impl fmt::Display for DagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNode { node_id } => {
                write!(f, "duplicate node id {node_id:?} in DAG")
            }
            Self::DanglingEdge { endpoint } => {
                write!(f, "edge endpoint {endpoint:?} missing from DAG nodes")
            }
            Self::Cycle { path } => write!(f, "cycle detected in DAG: {path}"),
        }
    }
}

impl std::error::Error for DagError {}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// The mutable per-task state record.
///
/// Transitions are expressed as pure constructors returning new records;
/// the store overwrites the whole row on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub lease_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl TaskState {
    /// Fresh state with only a status set.
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            owner: None,
            lease_expires: None,
            progress: None,
            artifacts: Vec::new(),
            last_error: None,
        }
    }

    /// Transition to RUNNING under `owner` with a lease deadline.
    pub fn as_running(&self, owner: &str, lease_expires: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::Running,
            owner: Some(owner.to_owned()),
            lease_expires: Some(lease_expires),
            ..self.clone()
        }
    }

    /// Transition to a completion status with a progress summary and the
    /// execution's artifacts. Clears owner and lease.
    pub fn as_completed(&self, status: TaskStatus, progress: &str, artifacts: Vec<String>) -> Self {
        Self {
            status,
            owner: None,
            lease_expires: None,
            progress: Some(progress.to_owned()),
            artifacts,
            ..self.clone()
        }
    }

    /// Transition to DONE.
    pub fn as_done(&self, progress: &str, artifacts: Vec<String>) -> Self {
        self.as_completed(TaskStatus::Done, progress, artifacts)
    }

    /// Transition to FAILED with an error message. Clears owner and lease.
    pub fn as_failed(&self, error: &str) -> Self {
        Self {
            status: TaskStatus::Failed,
            owner: None,
            lease_expires: None,
            last_error: Some(error.to_owned()),
            ..self.clone()
        }
    }

    /// Transition to BLOCKED with a progress note. Clears owner, lease,
    /// and artifacts (the task is being handed back to the scheduler).
    pub fn as_blocked(&self, progress: &str) -> Self {
        Self {
            status: TaskStatus::Blocked,
            owner: None,
            lease_expires: None,
            progress: Some(progress.to_owned()),
            artifacts: Vec::new(),
            ..self.clone()
        }
    }

    /// Reset to READY, clearing owner and lease. Used by stale recovery
    /// and the `DROP-TASK` directive.
    pub fn as_ready(&self) -> Self {
        Self {
            status: TaskStatus::Ready,
            owner: None,
            lease_expires: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger rows
// ---------------------------------------------------------------------------

/// One entry in the append-only instruction version ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionVersion {
    pub id: i64,
    pub instruction_id: String,
    pub body: String,
    pub sha256: String,
    pub pushed_at: DateTime<Utc>,
}

/// An agent's registration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub pid: i64,
    pub registered_at: DateTime<Utc>,
    pub capabilities: BTreeMap<String, String>,
}

impl AgentRegistration {
    /// The declared role from the capability map, if any.
    pub fn role(&self) -> Option<&str> {
        self.capabilities.get("role").map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Ready,
            TaskStatus::Claimed,
            TaskStatus::Running,
            TaskStatus::Blocked,
            TaskStatus::DevDone,
            TaskStatus::QaFailed,
            TaskStatus::QaPassed,
            TaskStatus::Integrated,
            TaskStatus::Done,
            TaskStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn satisfied_set() {
        assert!(TaskStatus::DevDone.is_satisfied());
        assert!(TaskStatus::QaPassed.is_satisfied());
        assert!(TaskStatus::Integrated.is_satisfied());
        assert!(TaskStatus::Done.is_satisfied());
        assert!(!TaskStatus::Ready.is_satisfied());
        assert!(!TaskStatus::Blocked.is_satisfied());
        assert!(!TaskStatus::Failed.is_satisfied());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn phase_parse_and_completion() {
        assert_eq!(Phase::parse("development"), Some(Phase::Development));
        assert_eq!(Phase::parse("qa"), Some(Phase::Qa));
        assert_eq!(Phase::parse("integration"), Some(Phase::Integration));
        assert_eq!(Phase::parse("mystery"), None);

        assert_eq!(Phase::Development.completion_status(), TaskStatus::DevDone);
        assert_eq!(Phase::Qa.completion_status(), TaskStatus::QaPassed);
        assert_eq!(Phase::Integration.completion_status(), TaskStatus::Done);
    }

    #[test]
    fn dag_rejects_dangling_edge() {
        let nodes = vec![TaskNode::new("a", "A", 0)];
        let edges = vec![TaskEdge::new("a", "b")];
        let err = GoalDag::new("g", nodes, edges).unwrap_err();
        assert!(matches!(err, DagError::DanglingEdge { endpoint } if endpoint == "b"));
    }

    #[test]
    fn dag_rejects_duplicate_node() {
        let nodes = vec![TaskNode::new("a", "A", 0), TaskNode::new("a", "A2", 1)];
        let err = GoalDag::new("g", nodes, vec![]).unwrap_err();
        assert!(matches!(err, DagError::DuplicateNode { node_id } if node_id == "a"));
    }

    #[test]
    fn dag_dependencies_for() {
        let nodes = vec![
            TaskNode::new("a", "A", 0),
            TaskNode::new("b", "B", 0),
            TaskNode::new("c", "C", 0),
        ];
        let edges = vec![TaskEdge::new("a", "c"), TaskEdge::new("b", "c")];
        let dag = GoalDag::new("g", nodes, edges).unwrap();
        assert_eq!(dag.dependencies_for("c"), vec!["a", "b"]);
        assert!(dag.dependencies_for("a").is_empty());
    }

    #[test]
    fn acyclic_check_accepts_diamond() {
        let nodes = vec![
            TaskNode::new("a", "A", 0),
            TaskNode::new("b", "B", 0),
            TaskNode::new("c", "C", 0),
            TaskNode::new("d", "D", 0),
        ];
        let edges = vec![
            TaskEdge::new("a", "b"),
            TaskEdge::new("a", "c"),
            TaskEdge::new("b", "d"),
            TaskEdge::new("c", "d"),
        ];
        let dag = GoalDag::new("g", nodes, edges).unwrap();
        assert!(dag.ensure_acyclic().is_ok());
    }

    #[test]
    fn acyclic_check_rejects_cycle() {
        let nodes = vec![
            TaskNode::new("a", "A", 0),
            TaskNode::new("b", "B", 0),
            TaskNode::new("c", "C", 0),
        ];
        let edges = vec![
            TaskEdge::new("a", "b"),
            TaskEdge::new("b", "c"),
            TaskEdge::new("c", "a"),
        ];
        let dag = GoalDag::new("g", nodes, edges).unwrap();
        let err = dag.ensure_acyclic().unwrap_err();
        assert!(matches!(err, DagError::Cycle { .. }));
    }

    #[test]
    fn state_as_running_sets_owner_and_lease() {
        let lease = Utc::now();
        let state = TaskState::new(TaskStatus::Ready).as_running("agent-1", lease);
        assert_eq!(state.status, TaskStatus::Running);
        assert_eq!(state.owner.as_deref(), Some("agent-1"));
        assert_eq!(state.lease_expires, Some(lease));
    }

    #[test]
    fn state_as_done_clears_ownership() {
        let state = TaskState::new(TaskStatus::Ready)
            .as_running("agent-1", Utc::now())
            .as_done("all good", vec!["artifact://x".into()]);
        assert_eq!(state.status, TaskStatus::Done);
        assert!(state.owner.is_none());
        assert!(state.lease_expires.is_none());
        assert_eq!(state.progress.as_deref(), Some("all good"));
        assert_eq!(state.artifacts, vec!["artifact://x".to_string()]);
    }

    #[test]
    fn state_as_failed_records_error() {
        let state = TaskState::new(TaskStatus::Running).as_failed("boom");
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(state.owner.is_none());
    }

    #[test]
    fn state_as_blocked_clears_artifacts() {
        let mut state = TaskState::new(TaskStatus::Running);
        state.artifacts = vec!["artifact://stale".into()];
        let blocked = state.as_blocked("waiting on fix");
        assert_eq!(blocked.status, TaskStatus::Blocked);
        assert!(blocked.artifacts.is_empty());
        assert_eq!(blocked.progress.as_deref(), Some("waiting on fix"));
    }

    #[test]
    fn node_metadata_helpers() {
        let node = TaskNode::new("t1", "Task", 3)
            .with_meta(meta::PHASE, "qa")
            .with_meta(meta::REQUIRED_ROLE, "reviewer")
            .with_meta(meta::REVIEW_CYCLE, "2")
            .with_meta(meta::RECOVERY_ATTEMPTS, "not-a-number");
        assert_eq!(node.phase(), Some(Phase::Qa));
        assert_eq!(node.required_role(), Some("reviewer"));
        assert_eq!(node.meta_u32(meta::REVIEW_CYCLE), Some(2));
        assert_eq!(node.meta_u32(meta::RECOVERY_ATTEMPTS), None);
    }

    #[test]
    fn registration_role_from_capabilities() {
        let mut caps = BTreeMap::new();
        caps.insert("role".to_string(), "builder".to_string());
        let reg = AgentRegistration {
            name: "agent-1".into(),
            pid: 42,
            registered_at: Utc::now(),
            capabilities: caps,
        };
        assert_eq!(reg.role(), Some("builder"));
    }
}
