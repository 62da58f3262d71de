//! The coordinator process: reconciles the declared fleet against
//! reality.
//!
//! Each cycle parses the instruction document, ensures every goal has a
//! DAG (asking the oracle for one and expanding it with the role
//! workflow), recovers stale tasks once per goal, and spawns missing
//! agents through the external supervisor in an owner → team-lead →
//! workers hierarchy. Agents whose descriptors disappear are forgotten
//! but never killed.

pub mod roles;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_db::models::GoalDag;
use drover_db::queries::{dag, instructions as ledger, scheduler};

use crate::instructions::{self, AgentDescriptor};
use crate::oracle::Oracle;
use crate::spawn::{SpawnAdapter, SpawnRequest};

use roles::{classify_role, expand_role_workflow, RoleClass};

/// Default reconcile-loop sleep.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Static configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// The fleet instruction document.
    pub instructions_path: PathBuf,
    pub poll_interval: Duration,
    /// Store URL handed to spawned agents.
    pub database_url: String,
    /// Program invoked (under the supervisor) for each agent process.
    pub agent_program: String,
    /// Extra arguments appended to every agent command line (oracle
    /// configuration passthrough).
    pub agent_extra_args: Vec<String>,
}

impl CoordinatorConfig {
    pub fn new(instructions_path: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            instructions_path: instructions_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            database_url: database_url.into(),
            agent_program: "drover".to_owned(),
            agent_extra_args: Vec::new(),
        }
    }

    /// Command line for one agent process.
    fn agent_argv(&self, descriptor: &AgentDescriptor) -> Vec<String> {
        let mut argv = vec![
            self.agent_program.clone(),
            "--role".to_owned(),
            "agent".to_owned(),
            "--agent-name".to_owned(),
            descriptor.name.clone(),
            "--agent-role".to_owned(),
            descriptor.effective_role().to_owned(),
            "--goal-id".to_owned(),
            descriptor.goal_id.clone(),
            "--instructions".to_owned(),
            descriptor.instructions_path.display().to_string(),
            "--heartbeat".to_owned(),
            descriptor.heartbeat_path.display().to_string(),
            "--database-url".to_owned(),
            self.database_url.clone(),
            "--log-level".to_owned(),
            descriptor.log_level.clone(),
            "--loop-interval".to_owned(),
            descriptor.cadence_seconds.to_string(),
            "--heartbeat-interval".to_owned(),
            descriptor.cadence_seconds.to_string(),
            "--instruction-interval".to_owned(),
            descriptor.cadence_seconds.to_string(),
        ];
        argv.extend(self.agent_extra_args.iter().cloned());
        argv
    }
}

/// The coordinator reconcile loop.
pub struct Coordinator {
    config: CoordinatorConfig,
    pool: SqlitePool,
    oracle: Arc<dyn Oracle>,
    spawner: Arc<dyn SpawnAdapter>,
    /// PIDs of agents spawned this coordinator lifetime, by agent name.
    spawned: HashMap<String, u32>,
    /// Goals whose stale tasks were already recovered on startup.
    recovered_goals: HashSet<String>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        pool: SqlitePool,
        oracle: Arc<dyn Oracle>,
        spawner: Arc<dyn SpawnAdapter>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            config,
            pool,
            oracle,
            spawner,
            spawned: HashMap::new(),
            recovered_goals: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that ends the loop at the next iteration boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// PID of a spawned agent, if this coordinator spawned it.
    pub fn spawned_pid(&self, agent_name: &str) -> Option<u32> {
        self.spawned.get(agent_name).copied()
    }

    /// Run the reconcile loop until cancelled or `max_cycles` is reached.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> Result<()> {
        info!(
            instructions = %self.config.instructions_path.display(),
            "starting coordinator"
        );
        let mut cycles = 0u64;
        while !self.cancel.is_cancelled() && max_cycles.is_none_or(|max| cycles < max) {
            self.process_cycle().await;
            cycles += 1;
            if !self.config.poll_interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }
        info!(cycles, "coordinator shutting down");
        Ok(())
    }

    /// One reconcile pass. Failures are logged; the loop continues.
    pub async fn process_cycle(&mut self) {
        let descriptors = match instructions::read_instruction_doc(&self.config.instructions_path)
        {
            Ok(descriptors) => descriptors,
            Err(e) => {
                error!(error = %e, "failed to parse instruction document, aborting cycle");
                return;
            }
        };

        let mut by_goal: BTreeMap<String, Vec<AgentDescriptor>> = BTreeMap::new();
        for descriptor in &descriptors {
            by_goal
                .entry(descriptor.goal_id.clone())
                .or_default()
                .push(descriptor.clone());
        }

        for (goal_id, group) in &by_goal {
            if let Err(e) = self.ensure_goal_dag(goal_id, group).await {
                error!(goal_id = %goal_id, error = %e, "failed to establish goal DAG");
                continue;
            }
            if !self.recovered_goals.contains(goal_id) {
                match scheduler::recover_stale_tasks(&self.pool, goal_id).await {
                    Ok(recovered) => {
                        info!(
                            goal_id = %goal_id,
                            count = recovered.len(),
                            tasks = ?recovered,
                            "startup stale-task recovery"
                        );
                        self.recovered_goals.insert(goal_id.clone());
                    }
                    Err(e) => warn!(goal_id = %goal_id, error = %e, "stale recovery failed"),
                }
            }
        }

        self.spawn_fleet(&descriptors).await;
        self.forget_vanished(&descriptors);
    }

    /// Generate, expand, validate, and write the goal's DAG when none
    /// exists yet.
    async fn ensure_goal_dag(&self, goal_id: &str, group: &[AgentDescriptor]) -> Result<()> {
        if dag::read_dag(&self.pool, goal_id).await?.is_some() {
            return Ok(());
        }

        let planner = group
            .iter()
            .find(|d| classify_role(d) == RoleClass::Manager)
            .unwrap_or(&group[0]);
        let text = match std::fs::read_to_string(&planner.instructions_path) {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    goal_id = %goal_id,
                    planner = %planner.name,
                    path = %planner.instructions_path.display(),
                    "planner instructions missing, skipping goal"
                );
                return Ok(());
            }
        };

        ledger::push_version(&self.pool, &planner.instruction_id(), &text).await?;
        info!(goal_id = %goal_id, planner = %planner.name, "generating DAG for goal");

        let proposed = self.oracle.create_goal_dag(&text, goal_id).await?;
        info!(
            goal_id = %goal_id,
            nodes = proposed.nodes.len(),
            edges = proposed.edges.len(),
            "oracle proposed DAG"
        );

        let expanded = expand_role_workflow(proposed, group);
        let validated = GoalDag::new(goal_id, expanded.nodes, expanded.edges)
            .context("expanded DAG failed referential validation")?;
        validated
            .ensure_acyclic()
            .context("expanded DAG contains a cycle")?;

        dag::write_dag(&self.pool, &validated).await?;
        info!(
            goal_id = %goal_id,
            nodes = validated.nodes.len(),
            edges = validated.edges.len(),
            "DAG written to store"
        );
        Ok(())
    }

    /// Spawn missing agents in the owner → team-lead → workers
    /// hierarchy. Spawns are idempotent per agent name.
    async fn spawn_fleet(&mut self, descriptors: &[AgentDescriptor]) {
        let coordinator_pid = std::process::id();

        let owner = descriptors
            .iter()
            .find(|d| matches_stem(d, "owner"))
            .cloned();
        let lead = descriptors
            .iter()
            .find(|d| matches_stem(d, "lead") && Some(&d.name) != owner.as_ref().map(|o| &o.name))
            .cloned();

        let owner_pid = match &owner {
            Some(owner) => self.ensure_spawned(owner, coordinator_pid).await,
            None => None,
        };
        let lead_parent = owner_pid.unwrap_or(coordinator_pid);
        let lead_pid = match &lead {
            Some(lead) => self.ensure_spawned(lead, lead_parent).await,
            None => None,
        };
        let worker_parent = lead_pid.unwrap_or(coordinator_pid);

        for descriptor in descriptors {
            let is_owner = owner.as_ref().is_some_and(|o| o.name == descriptor.name);
            let is_lead = lead.as_ref().is_some_and(|l| l.name == descriptor.name);
            if is_owner || is_lead {
                continue;
            }
            self.ensure_spawned(descriptor, worker_parent).await;
        }
    }

    /// Spawn one agent unless it was already spawned. Returns its PID.
    async fn ensure_spawned(
        &mut self,
        descriptor: &AgentDescriptor,
        parent_pid: u32,
    ) -> Option<u32> {
        if let Some(pid) = self.spawned.get(&descriptor.name) {
            return Some(*pid);
        }

        let request = SpawnRequest {
            name: format!("agent-{}", descriptor.name),
            parent_pid,
            log_level: descriptor.log_level.clone(),
            argv: self.config.agent_argv(descriptor),
        };
        match self.spawner.spawn_agent(&request).await {
            Ok(handle) => {
                info!(agent = %descriptor.name, pid = handle.pid, "spawned agent");
                self.spawned.insert(descriptor.name.clone(), handle.pid);
                Some(handle.pid)
            }
            Err(e) => {
                error!(agent = %descriptor.name, error = %e, "failed to spawn agent");
                None
            }
        }
    }

    /// Forget agents whose descriptors disappeared. Their processes are
    /// left running; only the PID bookkeeping is dropped.
    fn forget_vanished(&mut self, descriptors: &[AgentDescriptor]) {
        let current: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        let vanished: Vec<String> = self
            .spawned
            .keys()
            .filter(|name| !current.contains(name.as_str()))
            .cloned()
            .collect();
        for name in vanished {
            info!(
                agent = %name,
                "descriptor removed from instructions; leaving process running"
            );
            self.spawned.remove(&name);
        }
    }
}

/// Whether the descriptor's name or role carries the given stem.
fn matches_stem(descriptor: &AgentDescriptor, stem: &str) -> bool {
    descriptor.name.to_lowercase().contains(stem)
        || descriptor.effective_role().to_lowercase().contains(stem)
}
