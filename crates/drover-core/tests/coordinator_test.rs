//! Integration tests for the coordinator reconcile loop: DAG
//! establishment with role-workflow expansion, the spawn hierarchy,
//! idempotent spawning, and descriptor churn.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use drover_core::coordinator::{Coordinator, CoordinatorConfig};
use drover_core::oracle::stub::StubOracle;
use drover_core::oracle::{
    ExecutionReport, Oracle, RecoveryAssessment, TaskSelection,
};
use drover_core::spawn::{SpawnAdapter, SpawnHandle, SpawnRequest};
use drover_db::models::{meta, GoalDag, TaskNode, TaskStatus};
use drover_db::queries::{dag, instructions as ledger, state};
use drover_test_utils::TestStore;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Spawn adapter that records requests and hands out sequential PIDs.
#[derive(Default)]
struct RecordingSpawnAdapter {
    requests: Mutex<Vec<SpawnRequest>>,
    next_pid: AtomicU32,
}

impl RecordingSpawnAdapter {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(100),
        }
    }

    fn recorded(&self) -> Vec<SpawnRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn request_for(&self, name: &str) -> Option<SpawnRequest> {
        self.recorded().into_iter().find(|r| r.name == name)
    }
}

#[async_trait]
impl SpawnAdapter for RecordingSpawnAdapter {
    async fn spawn_agent(&self, request: &SpawnRequest) -> Result<SpawnHandle> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok(SpawnHandle {
            pid,
            command: request.argv.clone(),
        })
    }
}

/// Oracle wrapper counting DAG generations.
struct CountingOracle {
    inner: StubOracle,
    dag_calls: AtomicUsize,
}

impl CountingOracle {
    fn new() -> Self {
        Self {
            inner: StubOracle::new(),
            dag_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Oracle for CountingOracle {
    async fn create_goal_dag(&self, instructions: &str, goal_id: &str) -> Result<GoalDag> {
        self.dag_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_goal_dag(instructions, goal_id).await
    }

    async fn select_next_task(
        &self,
        ready_nodes: &[TaskNode],
        memory: &[String],
        goal_id: &str,
        instructions: &str,
    ) -> Result<TaskSelection> {
        self.inner
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
        self.inner.execute_task(task, goal_id, instructions, memory).await
    }

    async fn summarize_task(
        &self,
        task: &TaskNode,
        execution: &ExecutionReport,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<String> {
        self.inner
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
        self.inner
            .assess_recovery(task, error, goal_id, instructions, memory)
            .await
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

const FLEET_DOC: &str = r#"# Fleet

```yaml
agents:
  - name: product-owner
    goal: goal-alpha
    instructions: owner.md
    heartbeat: owner.hb
  - name: team-lead
    goal: goal-alpha
    instructions: lead.md
    heartbeat: lead.hb
  - name: features-dev
    goal: goal-alpha
    instructions: features.md
    heartbeat: features.hb
  - name: qa-dev
    goal: goal-alpha
    instructions: qa.md
    heartbeat: qa.hb
```
"#;

struct Fixture {
    store: TestStore,
    dir: TempDir,
    oracle: Arc<CountingOracle>,
    spawner: Arc<RecordingSpawnAdapter>,
}

impl Fixture {
    async fn create() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fleet.md"), FLEET_DOC).unwrap();
        // The planner's instructions drive the stub DAG generation.
        std::fs::write(
            dir.path().join("owner.md"),
            "Plan:\n- build the feature\n- write the docs\n",
        )
        .unwrap();
        for name in ["lead", "features", "qa"] {
            std::fs::write(dir.path().join(format!("{name}.md")), "work hard\n").unwrap();
            std::fs::write(dir.path().join(format!("{name}.hb")), "").unwrap();
        }
        std::fs::write(dir.path().join("owner.hb"), "").unwrap();

        Self {
            store: TestStore::create().await,
            dir,
            oracle: Arc::new(CountingOracle::new()),
            spawner: Arc::new(RecordingSpawnAdapter::new()),
        }
    }

    fn coordinator(&self) -> Coordinator {
        let mut config = CoordinatorConfig::new(
            self.dir.path().join("fleet.md"),
            "sqlite://unused-in-tests.db",
        );
        config.poll_interval = Duration::ZERO;
        Coordinator::new(
            self.store.pool.clone(),
            self.oracle.clone(),
            self.spawner.clone(),
            config,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_cycle_establishes_the_expanded_dag() {
    let fixture = Fixture::create().await;
    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;

    let graph = dag::read_dag(&fixture.store.pool, "goal-alpha")
        .await
        .unwrap()
        .expect("DAG written");

    // Two dev nodes from the bullets, each with a QA and an integration
    // stage appended.
    assert_eq!(graph.nodes.len(), 6);
    let dev = graph.node("task-001").unwrap();
    assert_eq!(dev.meta(meta::PHASE), Some("development"));
    assert_eq!(dev.meta(meta::REQUIRED_ROLE), Some("features-dev"));
    assert_eq!(dev.meta(meta::MANAGER_ROLE), Some("product-owner"));

    let qa = graph.node("task-001__qa").unwrap();
    assert_eq!(qa.meta(meta::REQUIRED_ROLE), Some("qa-dev"));
    let integrate = graph.node("task-001__integrate").unwrap();
    assert_eq!(integrate.meta(meta::REQUIRED_ROLE), Some("product-owner"));

    // Initial states follow incoming edges.
    let root_state = state::get_task_state(&fixture.store.pool, "task-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root_state.status, TaskStatus::Ready);
    let downstream = state::get_task_state(&fixture.store.pool, "task-001__qa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(downstream.status, TaskStatus::Blocked);

    // The planner's instruction text entered the ledger.
    let version = ledger::latest_version(&fixture.store.pool, "product-owner:goal-alpha")
        .await
        .unwrap()
        .expect("planner instructions versioned");
    assert!(version.body.contains("build the feature"));
}

#[tokio::test]
async fn spawn_hierarchy_chains_owner_lead_workers() {
    let fixture = Fixture::create().await;
    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;

    let requests = fixture.spawner.recorded();
    assert_eq!(requests.len(), 4);

    let coordinator_pid = std::process::id();
    let owner = fixture.spawner.request_for("agent-product-owner").unwrap();
    assert_eq!(owner.parent_pid, coordinator_pid);

    let owner_pid = coordinator.spawned_pid("product-owner").unwrap();
    let lead = fixture.spawner.request_for("agent-team-lead").unwrap();
    assert_eq!(lead.parent_pid, owner_pid);

    let lead_pid = coordinator.spawned_pid("team-lead").unwrap();
    for worker in ["agent-features-dev", "agent-qa-dev"] {
        let request = fixture.spawner.request_for(worker).unwrap();
        assert_eq!(request.parent_pid, lead_pid, "{worker} parents under the lead");
    }

    // Worker argv carries the agent-mode flags.
    let features = fixture.spawner.request_for("agent-features-dev").unwrap();
    let argv = features.argv.join(" ");
    assert!(argv.contains("--role agent"));
    assert!(argv.contains("--agent-name features-dev"));
    assert!(argv.contains("--goal-id goal-alpha"));
    assert!(argv.contains("--heartbeat"));
}

#[tokio::test]
async fn cycles_are_idempotent() {
    let fixture = Fixture::create().await;
    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;
    coordinator.process_cycle().await;
    coordinator.process_cycle().await;

    assert_eq!(
        fixture.oracle.dag_calls.load(Ordering::SeqCst),
        1,
        "the DAG is generated once"
    );
    assert_eq!(
        fixture.spawner.recorded().len(),
        4,
        "agents are spawned once"
    );
}

#[tokio::test]
async fn vanished_descriptors_are_forgotten_not_killed() {
    let fixture = Fixture::create().await;
    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;
    assert!(coordinator.spawned_pid("qa-dev").is_some());

    // Drop qa-dev from the fleet document.
    let trimmed = FLEET_DOC.replace(
        "  - name: qa-dev\n    goal: goal-alpha\n    instructions: qa.md\n    heartbeat: qa.hb\n",
        "",
    );
    std::fs::write(fixture.dir.path().join("fleet.md"), trimmed).unwrap();

    coordinator.process_cycle().await;
    assert!(coordinator.spawned_pid("qa-dev").is_none());
    assert_eq!(
        fixture.spawner.recorded().len(),
        4,
        "no re-spawns, no kills"
    );
}

#[tokio::test]
async fn parse_errors_abort_the_cycle_but_not_the_coordinator() {
    let fixture = Fixture::create().await;
    let mut coordinator = fixture.coordinator();

    std::fs::write(fixture.dir.path().join("fleet.md"), ": not yaml : [").unwrap();
    coordinator.process_cycle().await;
    assert!(fixture.spawner.recorded().is_empty());
    assert!(dag::read_dag(&fixture.store.pool, "goal-alpha")
        .await
        .unwrap()
        .is_none());

    // A later cycle with a repaired document proceeds normally.
    std::fs::write(fixture.dir.path().join("fleet.md"), FLEET_DOC).unwrap();
    coordinator.process_cycle().await;
    assert_eq!(fixture.spawner.recorded().len(), 4);
    assert!(dag::read_dag(&fixture.store.pool, "goal-alpha")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn missing_planner_instructions_skip_the_goal() {
    let fixture = Fixture::create().await;
    std::fs::remove_file(fixture.dir.path().join("owner.md")).unwrap();

    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;

    assert!(dag::read_dag(&fixture.store.pool, "goal-alpha")
        .await
        .unwrap()
        .is_none());
    // Agents are still spawned; they will idle until a DAG appears.
    assert_eq!(fixture.spawner.recorded().len(), 4);
}

#[tokio::test]
async fn existing_dag_is_never_regenerated() {
    let fixture = Fixture::create().await;

    // Pre-seed a DAG for the goal.
    let seeded = GoalDag::new(
        "goal-alpha",
        vec![TaskNode::new("seeded", "Seeded", 0)],
        vec![],
    )
    .unwrap();
    dag::write_dag(&fixture.store.pool, &seeded).await.unwrap();

    let mut coordinator = fixture.coordinator();
    coordinator.process_cycle().await;

    assert_eq!(fixture.oracle.dag_calls.load(Ordering::SeqCst), 0);
    let graph = dag::read_dag(&fixture.store.pool, "goal-alpha")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(graph.nodes.len(), 1);
    assert_eq!(graph.nodes[0].id, "seeded");
}
