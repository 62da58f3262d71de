//! Per-agent control loop.
//!
//! One process runs one [`AgentRuntime`]: a single-task cooperative loop
//! that polls operator directives, publishes liveness, honors the
//! goal-wide spending-cap gate, reloads instructions through the version
//! ledger, and claims and executes one task per cycle. Suspension is a
//! plain sleep between iterations; phase gating is explicit flags.

mod recovery;

pub use recovery::{MAX_RECOVERY_ATTEMPTS, MIN_RECOVERY_CONFIDENCE};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drover_db::models::{Phase, TaskNode, TaskState, TaskStatus};
use drover_db::queries::{agents, backoff, dag, instructions, locks, scheduler, state};

use crate::heartbeat::{self, Directive};
use crate::memory::Memory;
use crate::oracle::{BackoffNotifier, ExecutionStatus, Oracle};

/// Default sleep between loop iterations.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(1);
/// Default task lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
/// Default interval between directive-file polls.
pub const DEFAULT_HEARTBEAT_REFRESH: Duration = Duration::from_secs(120);
/// Default interval between instruction reloads.
pub const DEFAULT_INSTRUCTION_REFRESH: Duration = Duration::from_secs(120);

/// Static configuration for one agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_name: String,
    /// Role string used for task gating.
    pub agent_role: String,
    pub goal_id: String,
    pub instructions_path: PathBuf,
    pub heartbeat_path: PathBuf,
    pub loop_interval: Duration,
    pub lease_ttl: Duration,
    pub heartbeat_refresh_interval: Duration,
    pub instructions_refresh_interval: Duration,
}

impl AgentConfig {
    /// Config with default intervals.
    pub fn new(
        agent_name: impl Into<String>,
        agent_role: impl Into<String>,
        goal_id: impl Into<String>,
        instructions_path: impl Into<PathBuf>,
        heartbeat_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_role: agent_role.into(),
            goal_id: goal_id.into(),
            instructions_path: instructions_path.into(),
            heartbeat_path: heartbeat_path.into(),
            loop_interval: DEFAULT_LOOP_INTERVAL,
            lease_ttl: DEFAULT_LEASE_TTL,
            heartbeat_refresh_interval: DEFAULT_HEARTBEAT_REFRESH,
            instructions_refresh_interval: DEFAULT_INSTRUCTION_REFRESH,
        }
    }
}

/// Publishes oracle spending-cap events as the goal-wide backoff
/// deadline, so every agent on the goal stops invoking the oracle until
/// the cap resets.
pub struct GoalBackoffPublisher {
    pool: SqlitePool,
    goal_id: String,
}

impl GoalBackoffPublisher {
    pub fn new(pool: SqlitePool, goal_id: impl Into<String>) -> Self {
        Self {
            pool,
            goal_id: goal_id.into(),
        }
    }
}

#[async_trait]
impl BackoffNotifier for GoalBackoffPublisher {
    async fn spending_cap_hit(&self, resume_at: DateTime<Utc>, sleep: Duration) {
        match backoff::set_goal_backoff_until(&self.pool, &self.goal_id, resume_at).await {
            Ok(()) => info!(
                goal_id = %self.goal_id,
                resume_at = %resume_at,
                sleep_s = sleep.as_secs(),
                "published goal-wide spending-cap deadline"
            ),
            Err(e) => warn!(
                goal_id = %self.goal_id,
                error = %e,
                "failed to publish spending-cap deadline"
            ),
        }
    }
}

/// The per-agent cooperative control loop.
pub struct AgentRuntime {
    config: AgentConfig,
    pool: SqlitePool,
    oracle: Arc<dyn Oracle>,
    memory: Memory,
    instructions_text: String,
    loaded_instruction_hash: Option<String>,
    paused: bool,
    in_backoff: bool,
    last_directive_poll: Option<Instant>,
    last_reload: Option<Instant>,
    cancel: CancellationToken,
}

impl AgentRuntime {
    pub fn new(pool: SqlitePool, oracle: Arc<dyn Oracle>, config: AgentConfig) -> Self {
        Self {
            config,
            pool,
            oracle,
            memory: Memory::new(),
            instructions_text: String::new(),
            loaded_instruction_hash: None,
            paused: false,
            in_backoff: false,
            last_directive_poll: None,
            last_reload: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that ends the loop at the next iteration boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether a PAUSE directive is in effect.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Copy of the in-process memory, oldest first.
    pub fn memory_snapshot(&self) -> Vec<String> {
        self.memory.snapshot()
    }

    /// Run the control loop until cancelled or `max_cycles` is reached,
    /// then write the final memory snapshot and deregister.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> Result<()> {
        let pid = std::process::id();
        info!(
            agent = %self.config.agent_name,
            role = %self.config.agent_role,
            goal_id = %self.config.goal_id,
            pid,
            "starting agent"
        );

        let mut capabilities = BTreeMap::new();
        capabilities.insert("role".to_owned(), self.config.agent_role.clone());
        agents::register_agent(&self.pool, &self.config.agent_name, pid, &capabilities).await?;

        let snapshot = agents::load_memory_snapshot(&self.pool, &self.config.agent_name).await?;
        if !snapshot.is_empty() {
            debug!(entries = snapshot.len(), "hydrating memory from snapshot");
            self.memory.hydrate(snapshot);
        }
        if let Err(e) = self.reload_instructions().await {
            warn!(error = %e, "initial instruction load failed");
        }

        let mut cycles = 0u64;
        while !self.cancel.is_cancelled() && max_cycles.is_none_or(|max| cycles < max) {
            if let Err(e) = self.run_cycle().await {
                error!(agent = %self.config.agent_name, error = %e, "agent cycle failed");
            }
            cycles += 1;
            if !self.config.loop_interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.loop_interval) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        info!(agent = %self.config.agent_name, cycles, "agent shutting down");
        self.snapshot_memory().await?;
        agents::deregister_agent(&self.pool, &self.config.agent_name).await?;
        Ok(())
    }

    /// One loop iteration: directives, liveness, backoff gate,
    /// instruction reload, work.
    pub async fn run_cycle(&mut self) -> Result<()> {
        if self.directive_poll_due() {
            let directives = heartbeat::read(&self.config.heartbeat_path);
            self.apply_directives(&directives).await?;
            self.last_directive_poll = Some(Instant::now());
        }

        agents::heartbeat_agent(&self.pool, &self.config.agent_name, self.config.lease_ttl)
            .await?;

        if let Some(until) =
            backoff::get_goal_backoff_until(&self.pool, &self.config.goal_id).await?
        {
            if !self.in_backoff {
                info!(
                    goal_id = %self.config.goal_id,
                    until = %until,
                    "goal under spending-cap backoff, skipping work"
                );
                self.in_backoff = true;
            }
            return Ok(());
        }
        if self.in_backoff {
            info!(goal_id = %self.config.goal_id, "spending-cap backoff lifted, resuming work");
            self.in_backoff = false;
        }

        if self.reload_due() {
            self.reload_instructions().await?;
        }

        if self.paused {
            debug!(agent = %self.config.agent_name, "paused, skipping work cycle");
            return Ok(());
        }
        self.work_cycle().await
    }

    fn directive_poll_due(&self) -> bool {
        self.last_directive_poll
            .is_none_or(|last| last.elapsed() >= self.config.heartbeat_refresh_interval)
    }

    fn reload_due(&self) -> bool {
        self.last_reload
            .is_none_or(|last| last.elapsed() >= self.config.instructions_refresh_interval)
    }

    /// Apply operator directives in file order.
    pub async fn apply_directives(&mut self, directives: &[Directive]) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::Pause => {
                    if !self.paused {
                        info!(agent = %self.config.agent_name, "paused by operator directive");
                    }
                    self.paused = true;
                }
                Directive::Resume => {
                    if self.paused {
                        info!(agent = %self.config.agent_name, "resumed by operator directive");
                    }
                    self.paused = false;
                }
                Directive::Reparse => self.reload_instructions().await?,
                Directive::DropTask { task_id } => self.drop_task(task_id).await?,
                Directive::Elevate { task_id, priority } => {
                    self.elevate_task(task_id, priority).await?;
                }
                Directive::FlushMemory => {
                    self.memory.hydrate(Vec::<String>::new());
                    self.snapshot_memory().await?;
                    info!(agent = %self.config.agent_name, "memory flushed by operator directive");
                }
            }
        }
        Ok(())
    }

    /// Force a task back to READY and release this agent's lock on it.
    async fn drop_task(&self, task_id: &str) -> Result<()> {
        info!(task_id, "dropping task on operator request");
        if let Some(task_state) = state::get_task_state(&self.pool, task_id).await? {
            state::update_task_state(&self.pool, task_id, &task_state.as_ready()).await?;
        }
        locks::release_lock(&self.pool, task_id, &self.config.agent_name).await?;
        Ok(())
    }

    /// Rewrite a task's priority. Non-numeric priorities are ignored.
    async fn elevate_task(&self, task_id: &str, priority: &str) -> Result<()> {
        let Ok(priority) = priority.parse::<u32>() else {
            warn!(task_id, priority, "ignoring ELEVATE with non-numeric priority");
            return Ok(());
        };
        let Some(mut node) = dag::get_task_node(&self.pool, &self.config.goal_id, task_id).await?
        else {
            warn!(task_id, "ELEVATE target not found in DAG");
            return Ok(());
        };
        node.priority = priority;
        dag::update_task_node(&self.pool, &self.config.goal_id, &node).await?;
        info!(task_id, priority, "task priority elevated");
        Ok(())
    }

    /// Load instructions from the file via the version ledger: push a new
    /// version when the file changed, then adopt the latest stored
    /// version.
    pub async fn reload_instructions(&mut self) -> Result<()> {
        self.last_reload = Some(Instant::now());

        let instruction_id = format!("{}:{}", self.config.agent_name, self.config.goal_id);
        let file_text = match std::fs::read_to_string(&self.config.instructions_path) {
            Ok(text) => text,
            Err(_) => {
                warn!(
                    path = %self.config.instructions_path.display(),
                    "instructions file missing"
                );
                self.instructions_text.clear();
                return Ok(());
            }
        };

        let latest = instructions::latest_version(&self.pool, &instruction_id).await?;
        let version = match latest {
            Some(version) if version.body == file_text => version,
            _ => {
                let pushed =
                    instructions::push_version(&self.pool, &instruction_id, &file_text).await?;
                info!(
                    instruction_id = %instruction_id,
                    hash = &pushed.sha256[..8],
                    "pushed new instruction version"
                );
                pushed
            }
        };

        self.instructions_text = version.body.clone();
        let hash_prefix = version.sha256[..8].to_owned();
        if self.loaded_instruction_hash.as_deref() != Some(&version.sha256) {
            self.memory
                .append(format!("Loaded instruction version {hash_prefix}"));
            self.loaded_instruction_hash = Some(version.sha256);
        }
        debug!(instruction_id = %instruction_id, hash = %hash_prefix, "instructions loaded");
        Ok(())
    }

    /// Select among eligible ready tasks, claim one, execute it, and
    /// record the outcome.
    async fn work_cycle(&mut self) -> Result<()> {
        let ready_ids = scheduler::list_ready_tasks(&self.pool, &self.config.goal_id).await?;
        if ready_ids.is_empty() {
            debug!(goal_id = %self.config.goal_id, "no ready tasks");
            return Ok(());
        }

        let mut eligible = Vec::new();
        for task_id in &ready_ids {
            let Some(node) =
                dag::get_task_node(&self.pool, &self.config.goal_id, task_id).await?
            else {
                continue;
            };
            let role_ok = node
                .required_role()
                .is_none_or(|role| role == self.config.agent_role);
            if role_ok {
                eligible.push(node);
            }
        }
        if eligible.is_empty() {
            info!(
                agent = %self.config.agent_name,
                role = %self.config.agent_role,
                ready = ready_ids.len(),
                "no ready tasks eligible for this role"
            );
            return Ok(());
        }

        let selection = self
            .oracle
            .select_next_task(
                &eligible,
                &self.memory.snapshot(),
                &self.config.goal_id,
                &self.instructions_text,
            )
            .await?;
        let Some(selected) = selection.selected_task_id else {
            info!(
                justification = %selection.justification,
                "oracle declined to select a task"
            );
            return Ok(());
        };
        let Some(node) = eligible.into_iter().find(|n| n.id == selected) else {
            warn!(selected = %selected, "oracle selected a task outside the eligible set");
            return Ok(());
        };
        info!(
            task_id = %node.id,
            confidence = selection.confidence,
            justification = %selection.justification,
            "oracle selected task"
        );

        if !locks::acquire_lock(
            &self.pool,
            &node.id,
            &self.config.agent_name,
            self.config.lease_ttl,
        )
        .await?
        {
            debug!(task_id = %node.id, "lock held by another agent, moving on");
            return Ok(());
        }

        let outcome = self.run_claimed_task(&node).await;
        if let Err(e) =
            locks::release_lock(&self.pool, &node.id, &self.config.agent_name).await
        {
            warn!(task_id = %node.id, error = %e, "failed to release task lock");
        }
        outcome
    }

    /// Execute one claimed task and record the resulting transition.
    /// The caller holds the lock and releases it afterwards.
    async fn run_claimed_task(&mut self, node: &TaskNode) -> Result<()> {
        let base = state::get_task_state(&self.pool, &node.id)
            .await?
            .unwrap_or_else(|| TaskState::new(TaskStatus::Ready));
        let lease_expires =
            Utc::now() + chrono::Duration::milliseconds(self.config.lease_ttl.as_millis() as i64);
        state::update_task_state(
            &self.pool,
            &node.id,
            &base.as_running(&self.config.agent_name, lease_expires),
        )
        .await?;

        info!(task_id = %node.id, title = %node.title, "executing task");
        let execution = match self
            .oracle
            .execute_task(
                node,
                &self.config.goal_id,
                &self.instructions_text,
                &self.memory.snapshot(),
            )
            .await
        {
            Ok(execution) => execution,
            Err(err) => {
                return self.handle_execution_error(node, format!("{err:#}")).await;
            }
        };

        if !execution.follow_ups.is_empty() {
            debug!(
                task_id = %node.id,
                follow_ups = ?execution.follow_ups,
                "execution suggested follow-ups"
            );
        }

        match execution.status {
            ExecutionStatus::Done => {
                let summary = match self
                    .oracle
                    .summarize_task(
                        node,
                        &execution,
                        &self.config.goal_id,
                        &self.instructions_text,
                        &self.memory.snapshot(),
                    )
                    .await
                {
                    Ok(summary) => summary,
                    Err(err) => {
                        return self.handle_execution_error(node, format!("{err:#}")).await;
                    }
                };

                let status = node
                    .phase()
                    .map(Phase::completion_status)
                    .unwrap_or(TaskStatus::Done);
                state::update_task_state(
                    &self.pool,
                    &node.id,
                    &base.as_completed(status, &summary, execution.outputs.clone()),
                )
                .await?;
                info!(task_id = %node.id, status = %status, "task completed");
                self.memory
                    .append(format!("Completed {}: {summary}", node.id));
                self.snapshot_memory().await
            }
            ExecutionStatus::Failed if node.phase() == Some(Phase::Qa) => {
                let summary = non_empty_or(&execution.notes, || {
                    format!("QA review failed for {}", node.id)
                });
                self.handle_qa_failure(node, &summary).await
            }
            ExecutionStatus::Failed | ExecutionStatus::Blocked => {
                let error = non_empty_or(&execution.notes, || {
                    format!("execution reported status {}", execution.status)
                });
                self.handle_execution_error(node, error).await
            }
        }
    }

    pub(crate) async fn snapshot_memory(&self) -> Result<()> {
        agents::store_memory_snapshot(
            &self.pool,
            &self.config.agent_name,
            &self.memory.snapshot(),
        )
        .await
        .context("failed to persist memory snapshot")
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub(crate) fn oracle(&self) -> &Arc<dyn Oracle> {
        &self.oracle
    }

    pub(crate) fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub(crate) fn instructions_text(&self) -> &str {
        &self.instructions_text
    }
}

/// Use `value` unless it is blank, else the fallback.
fn non_empty_or(value: &str, fallback: impl FnOnce() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_owned()
    }
}
