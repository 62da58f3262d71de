//! Integration tests for the raw store operations: DAG persistence,
//! task state records, lease locks, agent liveness, memory snapshots,
//! goal backoff, and the instruction ledger.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;

use drover_db::models::{meta, GoalDag, TaskEdge, TaskNode, TaskState, TaskStatus};
use drover_db::queries::{agents, backoff, dag, instructions, locks, state};
use drover_test_utils::TestStore;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn diamond_dag(goal_id: &str) -> GoalDag {
    let nodes = vec![
        TaskNode::new("setup", "Set up", 10),
        TaskNode::new("left", "Left branch", 5),
        TaskNode::new("right", "Right branch", 5),
        TaskNode::new("merge", "Merge", 1),
    ];
    let edges = vec![
        TaskEdge::new("setup", "left"),
        TaskEdge::new("setup", "right"),
        TaskEdge::new("left", "merge"),
        TaskEdge::new("right", "merge"),
    ];
    GoalDag::new(goal_id, nodes, edges).unwrap()
}

async fn status_of(store: &TestStore, task_id: &str) -> TaskStatus {
    state::get_task_state(&store.pool, task_id)
        .await
        .unwrap()
        .expect("state should exist")
        .status
}

// ---------------------------------------------------------------------------
// DAG persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_dag_initializes_states_by_incoming_edges() {
    let store = TestStore::create().await;
    dag::write_dag(&store.pool, &diamond_dag("g1")).await.unwrap();

    // Roots are READY, everything with incoming edges BLOCKED.
    assert_eq!(status_of(&store, "setup").await, TaskStatus::Ready);
    assert_eq!(status_of(&store, "left").await, TaskStatus::Blocked);
    assert_eq!(status_of(&store, "right").await, TaskStatus::Blocked);
    assert_eq!(status_of(&store, "merge").await, TaskStatus::Blocked);
}

#[tokio::test]
async fn read_dag_round_trips_nodes_and_edges() {
    let store = TestStore::create().await;
    let written = diamond_dag("g1");
    dag::write_dag(&store.pool, &written).await.unwrap();

    let read = dag::read_dag(&store.pool, "g1").await.unwrap().unwrap();
    // read_dag re-validates, so edge endpoints exist and ids are unique.
    assert_eq!(read.goal_id, "g1");
    assert_eq!(read.nodes, written.nodes);
    assert_eq!(read.edges.len(), written.edges.len());
    for edge in &written.edges {
        assert!(
            read.edges.iter().any(|e| e == edge),
            "missing edge {} -> {}",
            edge.source,
            edge.target
        );
    }
    assert!(read.ensure_acyclic().is_ok());
}

#[tokio::test]
async fn read_dag_for_unknown_goal_is_none() {
    let store = TestStore::create().await;
    assert!(dag::read_dag(&store.pool, "nope").await.unwrap().is_none());
}

#[tokio::test]
async fn write_dag_replaces_previous_graph() {
    let store = TestStore::create().await;
    dag::write_dag(&store.pool, &diamond_dag("g1")).await.unwrap();

    let replacement = GoalDag::new("g1", vec![TaskNode::new("solo", "Solo", 0)], vec![]).unwrap();
    dag::write_dag(&store.pool, &replacement).await.unwrap();

    let read = dag::read_dag(&store.pool, "g1").await.unwrap().unwrap();
    assert_eq!(read.nodes.len(), 1);
    assert_eq!(read.nodes[0].id, "solo");
    assert!(read.edges.is_empty());
}

#[tokio::test]
async fn update_task_node_patches_metadata_without_touching_state() {
    let store = TestStore::create().await;
    dag::write_dag(&store.pool, &diamond_dag("g1")).await.unwrap();

    // Give the node some state first.
    let running = TaskState::new(TaskStatus::Ready).as_running("agent-1", Utc::now());
    state::update_task_state(&store.pool, "setup", &running).await.unwrap();

    let mut node = dag::get_task_node(&store.pool, "g1", "setup")
        .await
        .unwrap()
        .unwrap();
    node.priority = 99;
    node.metadata
        .insert(meta::RECOVERY_ATTEMPTS.to_owned(), "2".to_owned());
    dag::update_task_node(&store.pool, "g1", &node).await.unwrap();

    let reread = dag::get_task_node(&store.pool, "g1", "setup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reread.priority, 99);
    assert_eq!(reread.meta_u32(meta::RECOVERY_ATTEMPTS), Some(2));

    let task_state = state::get_task_state(&store.pool, "setup").await.unwrap().unwrap();
    assert_eq!(task_state.status, TaskStatus::Running);
    assert_eq!(task_state.owner.as_deref(), Some("agent-1"));
}

#[tokio::test]
async fn update_unknown_node_is_an_error() {
    let store = TestStore::create().await;
    dag::write_dag(&store.pool, &diamond_dag("g1")).await.unwrap();
    let node = TaskNode::new("ghost", "Ghost", 0);
    assert!(dag::update_task_node(&store.pool, "g1", &node).await.is_err());
}

// ---------------------------------------------------------------------------
// Task state records
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_state_full_overwrite_round_trip() {
    let store = TestStore::create().await;

    let lease = Utc::now();
    let mut written = TaskState::new(TaskStatus::Ready).as_running("agent-1", lease);
    written.progress = Some("halfway".to_owned());
    written.artifacts = vec!["artifact://a".to_owned(), "artifact://b".to_owned()];
    written.last_error = Some("earlier hiccup".to_owned());
    state::update_task_state(&store.pool, "t1", &written).await.unwrap();

    let read = state::get_task_state(&store.pool, "t1").await.unwrap().unwrap();
    assert_eq!(read.status, TaskStatus::Running);
    assert_eq!(read.owner.as_deref(), Some("agent-1"));
    assert_eq!(read.progress.as_deref(), Some("halfway"));
    assert_eq!(read.artifacts, written.artifacts);
    assert_eq!(read.last_error.as_deref(), Some("earlier hiccup"));
    // RFC 3339 text storage keeps sub-second precision.
    let stored_lease = read.lease_expires.expect("lease present");
    assert!((stored_lease - lease).num_milliseconds().abs() < 10);

    // Overwrite clears what the new record leaves unset.
    let done = read.as_done("finished", vec!["artifact://c".to_owned()]);
    state::update_task_state(&store.pool, "t1", &done).await.unwrap();
    let reread = state::get_task_state(&store.pool, "t1").await.unwrap().unwrap();
    assert_eq!(reread.status, TaskStatus::Done);
    assert!(reread.owner.is_none());
    assert!(reread.lease_expires.is_none());
}

#[tokio::test]
async fn missing_state_reads_as_none() {
    let store = TestStore::create().await;
    assert!(state::get_task_state(&store.pool, "ghost").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lock_is_exclusive_while_live() {
    let store = TestStore::create().await;
    let ttl = Duration::from_secs(30);

    assert!(locks::acquire_lock(&store.pool, "t1", "agent-a", ttl).await.unwrap());
    assert!(!locks::acquire_lock(&store.pool, "t1", "agent-b", ttl).await.unwrap());
    assert_eq!(
        locks::lock_owner(&store.pool, "t1").await.unwrap().as_deref(),
        Some("agent-a")
    );
}

#[tokio::test]
async fn concurrent_acquisition_admits_exactly_one_winner() {
    let store = TestStore::create().await;
    let ttl = Duration::from_secs(30);

    let mut handles = Vec::new();
    for i in 0..8 {
        let pool = store.pool.clone();
        handles.push(tokio::spawn(async move {
            locks::acquire_lock(&pool, "contended", &format!("agent-{i}"), ttl)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one concurrent caller may win the lock");
}

#[tokio::test]
async fn release_by_non_owner_leaves_lock_in_place() {
    let store = TestStore::create().await;
    let ttl = Duration::from_secs(30);

    locks::acquire_lock(&store.pool, "t1", "agent-a", ttl).await.unwrap();
    locks::release_lock(&store.pool, "t1", "agent-b").await.unwrap();
    assert_eq!(
        locks::lock_owner(&store.pool, "t1").await.unwrap().as_deref(),
        Some("agent-a")
    );

    locks::release_lock(&store.pool, "t1", "agent-a").await.unwrap();
    assert!(locks::lock_owner(&store.pool, "t1").await.unwrap().is_none());
}

#[tokio::test]
async fn expired_lock_can_be_stolen() {
    let store = TestStore::create().await;

    assert!(
        locks::acquire_lock(&store.pool, "t1", "agent-a", Duration::from_millis(20))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Expired: reads as absent and is up for grabs.
    assert!(locks::lock_owner(&store.pool, "t1").await.unwrap().is_none());
    assert!(
        locks::acquire_lock(&store.pool, "t1", "agent-b", Duration::from_secs(30))
            .await
            .unwrap()
    );
    assert_eq!(
        locks::lock_owner(&store.pool, "t1").await.unwrap().as_deref(),
        Some("agent-b")
    );
}

#[tokio::test]
async fn renew_only_works_for_the_live_owner() {
    let store = TestStore::create().await;
    let ttl = Duration::from_secs(30);

    locks::acquire_lock(&store.pool, "t1", "agent-a", ttl).await.unwrap();
    assert!(locks::renew_lock(&store.pool, "t1", "agent-a", ttl).await.unwrap());
    assert!(!locks::renew_lock(&store.pool, "t1", "agent-b", ttl).await.unwrap());

    // An expired lock cannot be renewed, even by its former owner.
    locks::release_lock(&store.pool, "t1", "agent-a").await.unwrap();
    locks::acquire_lock(&store.pool, "t2", "agent-a", Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!locks::renew_lock(&store.pool, "t2", "agent-a", ttl).await.unwrap());
}

// ---------------------------------------------------------------------------
// Agents, heartbeats, memory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_round_trip() {
    let store = TestStore::create().await;

    let mut capabilities = BTreeMap::new();
    capabilities.insert("role".to_owned(), "builder".to_owned());
    agents::register_agent(&store.pool, "agent-a", 4242, &capabilities)
        .await
        .unwrap();

    let registration = agents::get_registration(&store.pool, "agent-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registration.pid, 4242);
    assert_eq!(registration.role(), Some("builder"));

    agents::deregister_agent(&store.pool, "agent-a").await.unwrap();
    assert!(agents::get_registration(&store.pool, "agent-a")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn heartbeat_expires_with_its_ttl() {
    let store = TestStore::create().await;

    agents::heartbeat_agent(&store.pool, "agent-a", Duration::from_millis(40))
        .await
        .unwrap();
    assert!(agents::agent_last_heartbeat(&store.pool, "agent-a")
        .await
        .unwrap()
        .is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(agents::agent_last_heartbeat(&store.pool, "agent-a")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn memory_snapshot_round_trip() {
    let store = TestStore::create().await;

    assert!(agents::load_memory_snapshot(&store.pool, "agent-a")
        .await
        .unwrap()
        .is_empty());

    let entries = vec!["did a thing".to_owned(), "did another".to_owned()];
    agents::store_memory_snapshot(&store.pool, "agent-a", &entries)
        .await
        .unwrap();
    assert_eq!(
        agents::load_memory_snapshot(&store.pool, "agent-a").await.unwrap(),
        entries
    );

    // Deregistration keeps the snapshot for rehydration.
    agents::deregister_agent(&store.pool, "agent-a").await.unwrap();
    assert_eq!(
        agents::load_memory_snapshot(&store.pool, "agent-a").await.unwrap(),
        entries
    );
}

// ---------------------------------------------------------------------------
// Goal backoff
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backoff_deadline_round_trip_and_expiry() {
    let store = TestStore::create().await;

    assert!(backoff::get_goal_backoff_until(&store.pool, "g1")
        .await
        .unwrap()
        .is_none());

    let until = Utc::now() + chrono::Duration::seconds(60);
    backoff::set_goal_backoff_until(&store.pool, "g1", until).await.unwrap();
    let stored = backoff::get_goal_backoff_until(&store.pool, "g1")
        .await
        .unwrap()
        .unwrap();
    assert!((stored - until).num_milliseconds().abs() < 10);

    // A deadline already in the past reads as absent.
    backoff::set_goal_backoff_until(&store.pool, "g2", Utc::now() - chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert!(backoff::get_goal_backoff_until(&store.pool, "g2")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn backoff_deadline_never_regresses() {
    let store = TestStore::create().await;

    let later = Utc::now() + chrono::Duration::seconds(120);
    let earlier = Utc::now() + chrono::Duration::seconds(30);
    backoff::set_goal_backoff_until(&store.pool, "g1", later).await.unwrap();
    backoff::set_goal_backoff_until(&store.pool, "g1", earlier).await.unwrap();

    let stored = backoff::get_goal_backoff_until(&store.pool, "g1")
        .await
        .unwrap()
        .unwrap();
    assert!((stored - later).num_milliseconds().abs() < 10);
}

#[tokio::test]
async fn backoff_clear_removes_the_deadline() {
    let store = TestStore::create().await;
    backoff::set_goal_backoff_until(
        &store.pool,
        "g1",
        Utc::now() + chrono::Duration::seconds(600),
    )
    .await
    .unwrap();
    backoff::clear_goal_backoff(&store.pool, "g1").await.unwrap();
    assert!(backoff::get_goal_backoff_until(&store.pool, "g1")
        .await
        .unwrap()
        .is_none());
}

// ---------------------------------------------------------------------------
// Instruction ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn instruction_versions_append_in_order() {
    let store = TestStore::create().await;

    assert!(instructions::latest_version(&store.pool, "a:g")
        .await
        .unwrap()
        .is_none());

    let v1 = instructions::push_version(&store.pool, "a:g", "first body").await.unwrap();
    let v2 = instructions::push_version(&store.pool, "a:g", "second body").await.unwrap();
    assert_ne!(v1.sha256, v2.sha256);
    assert_eq!(v1.sha256, instructions::digest("first body"));

    let latest = instructions::latest_version(&store.pool, "a:g")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.body, "second body");
    assert_eq!(latest.id, v2.id);

    let history = instructions::version_history(&store.pool, "a:g").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].body, "first body");
    assert_eq!(history[1].body, "second body");

    // Other ids are independent.
    assert!(instructions::latest_version(&store.pool, "b:g")
        .await
        .unwrap()
        .is_none());
}
