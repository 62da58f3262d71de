//! CLI-backed oracle client.
//!
//! Invokes a configured provider executable with an argument vector ending
//! in `-p <prompt>`, captures stdout, and enforces the JSON response
//! contract with corrective retries. Calls are bounded by a deadline that
//! kills the subprocess (SIGTERM, brief wait, SIGKILL), and a provider
//! spending cap is handled by sleeping until the parsed local reset time
//! and retrying the same prompt.

use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{info, warn};

use drover_db::models::{GoalDag, TaskEdge, TaskNode};

use super::backoff::{detects_spending_cap, parse_reset_time, sleep_until_reset};
use super::prompt::{self, Prompt};
use super::{
    BackoffNotifier, ExecutionReport, ExecutionStatus, Oracle, RecoveryAssessment, TaskSelection,
};

/// Default timeout for metadata calls (selection, summaries, assessments).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(180);
/// Default timeout for task execution calls.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(900);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);
const MAX_JSON_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Supported provider CLIs, differing only in their permission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Claude,
    Codex,
}

impl Provider {
    /// Provider-specific arguments inserted before the prompt.
    pub fn profile_args(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["--dangerously-skip-permissions"],
            Self::Codex => &["--dangerously-bypass-approvals-and-sandbox"],
        }
    }

    /// The conventional executable name for the provider.
    pub fn default_executable(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            other => bail!("unknown oracle provider: {other:?}"),
        }
    }
}

/// Invocation parameters for the provider CLI.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub provider: Provider,
    /// Path or name of the provider executable.
    pub executable: String,
    /// Extra arguments appended before `-p <prompt>`.
    pub extra_args: Vec<String>,
    pub call_timeout: Duration,
    pub execute_timeout: Duration,
}

impl OracleConfig {
    pub fn new(provider: Provider, executable: impl Into<String>) -> Self {
        Self {
            provider,
            executable: executable.into(),
            extra_args: Vec::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Oracle implementation backed by a provider CLI subprocess.
pub struct CliOracle {
    config: OracleConfig,
    notifier: Option<Arc<dyn BackoffNotifier>>,
}

impl CliOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            config,
            notifier: None,
        }
    }

    /// Register a callback notified before every spending-cap sleep.
    pub fn with_notifier(mut self, notifier: Arc<dyn BackoffNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run one provider call, retrying internally across spending-cap
    /// windows. Returns trimmed stdout.
    async fn invoke(&self, prompt_text: &str, timeout: Duration, operation: &str) -> Result<String> {
        let meta = Prompt::from_text(prompt_text);
        info!(
            operation,
            prompt = %meta.id,
            chars = meta.char_count,
            tokens_estimate = meta.token_estimate,
            timeout_s = timeout.as_secs(),
            "invoking oracle"
        );

        loop {
            let (status_code, stdout, stderr) =
                self.invoke_once(prompt_text, &meta, timeout, operation).await?;

            let combined = format!("{stdout}\n{stderr}");
            if detects_spending_cap(&combined) {
                let Some(reset) = parse_reset_time(&combined) else {
                    bail!(
                        "spending cap reached with no parseable reset time for {operation} \
                         Prompt({})",
                        meta.id
                    );
                };
                let sleep = sleep_until_reset(Local::now(), reset);
                let resume_at = Utc::now()
                    + chrono::Duration::from_std(sleep).unwrap_or(chrono::Duration::zero());
                warn!(
                    operation,
                    prompt = %meta.id,
                    sleep_s = sleep.as_secs(),
                    resume_at = %resume_at,
                    "provider spending cap reached, sleeping until reset"
                );
                if let Some(notifier) = &self.notifier {
                    notifier.spending_cap_hit(resume_at, sleep).await;
                }
                tokio::time::sleep(sleep).await;
                continue;
            }

            if status_code != 0 {
                let detail = stderr.trim();
                bail!(
                    "oracle CLI failed for {operation} Prompt({}): {}",
                    meta.id,
                    if detail.is_empty() {
                        stdout.trim()
                    } else {
                        detail
                    }
                );
            }

            return Ok(stdout.trim().to_owned());
        }
    }

    /// Spawn the provider once and wait for it under the deadline,
    /// emitting a progress line every 30 seconds.
    async fn invoke_once(
        &self,
        prompt_text: &str,
        meta: &Prompt,
        timeout: Duration,
        operation: &str,
    ) -> Result<(i32, String, String)> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(self.config.provider.profile_args());
        cmd.args(&self.config.extra_args);
        cmd.arg("-p").arg(prompt_text);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let deadline = started + timeout;

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn oracle executable {:?} -- is it installed and on PATH?",
                self.config.executable
            )
        })?;

        let mut stdout_pipe = child.stdout.take().context("oracle stdout not piped")?;
        let mut stderr_pipe = child.stderr.take().context("oracle stderr not piped")?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let mut ticker = tokio::time::interval_at(started + PROGRESS_INTERVAL, PROGRESS_INTERVAL);
        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("failed to wait for oracle subprocess")?;
                }
                _ = ticker.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    info!(
                        operation,
                        prompt = %meta.id,
                        remaining_s = remaining.as_secs(),
                        "still waiting for oracle response"
                    );
                }
                _ = tokio::time::sleep_until(deadline) => {
                    terminate(&mut child).await;
                    bail!(
                        "oracle timed out after {}s for {operation} Prompt({})",
                        timeout.as_secs(),
                        meta.id
                    );
                }
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let code = status.code().unwrap_or(-1);
        info!(
            operation,
            prompt = %meta.id,
            chars = stdout.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            exit_code = code,
            "oracle response received"
        );
        Ok((code, stdout, stderr))
    }

    /// Invoke with the JSON contract enforced: up to three attempts, the
    /// later ones carrying a corrective preamble plus the malformed
    /// output.
    async fn invoke_json(
        &self,
        operation: &str,
        prompt_text: String,
        required_keys: &[&str],
        timeout: Duration,
    ) -> Result<Map<String, Value>> {
        let mut current = prompt_text.clone();
        let mut last_error = None;

        for attempt in 1..=MAX_JSON_ATTEMPTS {
            let raw = self.invoke(&current, timeout, operation).await?;
            let checked = prompt::extract_json_object(&raw)
                .and_then(|payload| prompt::validate_keys(&payload, required_keys).map(|()| payload));
            match checked {
                Ok(payload) => return Ok(payload),
                Err(err) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = MAX_JSON_ATTEMPTS,
                        error = %err,
                        response_len = raw.len(),
                        "invalid JSON response from oracle"
                    );
                    if attempt < MAX_JSON_ATTEMPTS {
                        current = prompt::repair_prompt(&prompt_text, &raw, required_keys);
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to obtain valid JSON response for {operation}"))),
            None => bail!("failed to obtain valid JSON response for {operation}"),
        }
    }
}

/// SIGTERM the child, wait briefly, then SIGKILL if it has not exited.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid refers to a child we spawned.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

fn string_field(payload: &Map<String, Value>, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

fn string_list(payload: &Map<String, Value>, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn confidence_field(payload: &Map<String, Value>, key: &str) -> f64 {
    payload
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Oracle implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Oracle for CliOracle {
    async fn create_goal_dag(&self, instructions: &str, goal_id: &str) -> Result<GoalDag> {
        let schema = json!({
            "goal_id": goal_id,
            "nodes": [{
                "id": "task-001",
                "title": "Describe the task",
                "priority": 10,
                "expected_artifacts": ["artifact/example"],
                "metadata": {},
            }],
            "edges": [{"source": "task-001", "target": "task-002"}],
        });
        let rendered = prompt::render_prompt(
            "You must derive a task DAG for the provided goal.",
            goal_id,
            instructions,
            None,
            &schema,
        );
        let mut payload = self
            .invoke_json(
                "create_goal_dag",
                rendered,
                &["goal_id", "nodes", "edges"],
                self.config.call_timeout,
            )
            .await?;

        let nodes: Vec<TaskNode> = serde_json::from_value(
            payload.remove("nodes").unwrap_or(Value::Array(Vec::new())),
        )
        .context("oracle DAG nodes did not match the node schema")?;
        let edges: Vec<TaskEdge> = serde_json::from_value(
            payload.remove("edges").unwrap_or(Value::Array(Vec::new())),
        )
        .context("oracle DAG edges did not match the edge schema")?;

        Ok(GoalDag::new(goal_id, nodes, edges)?)
    }

    async fn select_next_task(
        &self,
        ready_nodes: &[TaskNode],
        memory: &[String],
        goal_id: &str,
        instructions: &str,
    ) -> Result<TaskSelection> {
        let schema = json!({
            "selected_task_id": "task id or null",
            "justification": "reason",
            "confidence": 0.5,
        });
        let context = json!({
            "ready_tasks": ready_nodes,
            "memory": memory,
        });
        let rendered = prompt::render_prompt(
            "Given the ready tasks and memory, choose the next task to execute.",
            goal_id,
            instructions,
            Some(&context),
            &schema,
        );
        let payload = self
            .invoke_json(
                "select_next_task",
                rendered,
                &["selected_task_id", "justification", "confidence"],
                self.config.call_timeout,
            )
            .await?;

        let selected_task_id = payload
            .get("selected_task_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(TaskSelection {
            selected_task_id,
            justification: string_field(&payload, "justification"),
            confidence: confidence_field(&payload, "confidence"),
        })
    }

    async fn execute_task(
        &self,
        task: &TaskNode,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<ExecutionReport> {
        let schema = json!({
            "status": "done|failed|blocked",
            "outputs": ["artifact-path"],
            "notes": "execution notes",
            "follow_ups": ["task-id"],
        });
        let context = json!({
            "task": task,
            "memory": memory,
        });
        let rendered = prompt::render_prompt(
            "Plan concrete steps to execute the specified task and describe resulting artifacts.",
            goal_id,
            instructions,
            Some(&context),
            &schema,
        );
        let payload = self
            .invoke_json(
                "execute_task",
                rendered,
                &["status", "outputs", "notes", "follow_ups"],
                self.config.execute_timeout,
            )
            .await?;

        let status_raw = string_field(&payload, "status");
        let status: ExecutionStatus = status_raw
            .parse()
            .with_context(|| format!("oracle reported unknown execution status {status_raw:?}"))?;

        Ok(ExecutionReport {
            status,
            outputs: string_list(&payload, "outputs"),
            notes: string_field(&payload, "notes"),
            follow_ups: string_list(&payload, "follow_ups"),
        })
    }

    async fn summarize_task(
        &self,
        task: &TaskNode,
        execution: &ExecutionReport,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<String> {
        let schema = json!({"summary": "Concise summary text"});
        let context = json!({
            "task": {"id": task.id, "title": task.title},
            "execution": {
                "status": execution.status.to_string(),
                "outputs": execution.outputs,
                "notes": execution.notes,
                "follow_ups": execution.follow_ups,
            },
            "memory": memory,
        });
        let rendered = prompt::render_prompt(
            "Produce a concise summary (<=3 sentences) of the completed task for logging.",
            goal_id,
            instructions,
            Some(&context),
            &schema,
        );
        let payload = self
            .invoke_json("summarize_task", rendered, &["summary"], self.config.call_timeout)
            .await?;

        let summary = string_field(&payload, "summary").trim().to_owned();
        if summary.is_empty() {
            bail!("oracle returned an empty summary");
        }
        Ok(summary)
    }

    async fn assess_recovery(
        &self,
        task: &TaskNode,
        error: &str,
        goal_id: &str,
        instructions: &str,
        memory: &[String],
    ) -> Result<RecoveryAssessment> {
        let schema = json!({
            "recoverable": false,
            "reason": "why",
            "remediation_title": "short title",
            "remediation_steps": ["step"],
            "confidence": 0.5,
        });
        let context = json!({
            "task": task,
            "error": error,
            "memory": memory,
        });
        let rendered = prompt::render_prompt(
            "Classify whether the failed task can be recovered by a follow-up task.",
            goal_id,
            instructions,
            Some(&context),
            &schema,
        );
        let payload = self
            .invoke_json(
                "assess_recovery",
                rendered,
                &[
                    "recoverable",
                    "reason",
                    "remediation_title",
                    "remediation_steps",
                    "confidence",
                ],
                self.config.call_timeout,
            )
            .await?;

        Ok(RecoveryAssessment {
            recoverable: payload
                .get("recoverable")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reason: string_field(&payload, "reason"),
            remediation_title: string_field(&payload, "remediation_title"),
            remediation_steps: string_list(&payload, "remediation_steps"),
            confidence: confidence_field(&payload, "confidence"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
