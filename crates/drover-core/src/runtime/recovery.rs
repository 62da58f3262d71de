//! Failure handling: the recovery feedback loop for non-QA failures and
//! the QA remediation loop.
//!
//! Transient-looking errors are classified by a deterministic rule table
//! first; everything else is referred to the oracle's recoverability
//! assessment with a confidence floor. Recoverable failures synthesize a
//! development-phase recovery task that blocks the original; QA failures
//! synthesize a remediation task that blocks the QA node until a fix
//! lands.

use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use tracing::{info, warn};

use drover_db::models::{meta, TaskNode, TaskState, TaskStatus};
use drover_db::queries::{dag, scheduler, state};

use super::AgentRuntime;

/// Recovery tasks per original task before it is marked FAILED.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Minimum oracle confidence for a recoverable verdict to count.
pub const MIN_RECOVERY_CONFIDENCE: f64 = 0.75;
/// Review cycles before QA remediation escalates to the manager role.
const MAX_REVIEW_CYCLES_BEFORE_ESCALATION: u32 = 3;
/// Cap on the stored `last_error` field, in characters.
const LAST_ERROR_MAX_CHARS: usize = 600;

/// Error-text patterns that are always recoverable: transient
/// infrastructure and environment failures.
const TRANSIENT_PATTERNS: &[&str] = &[
    "spending cap reached",
    "rate limit",
    "timed out|timeout",
    "temporar(y|ily)",
    "network",
    "econnreset|enotfound|eai_again",
    "command not found|not found",
    "unsupported engine|requires node|node version",
];

fn transient_rules() -> &'static Vec<Regex> {
    static RULES: OnceLock<Vec<Regex>> = OnceLock::new();
    RULES.get_or_init(|| {
        TRANSIENT_PATTERNS
            .iter()
            .map(|pattern| {
                Regex::new(&format!("(?i){pattern}")).expect("transient rule must compile")
            })
            .collect()
    })
}

/// Whether the error text matches any deterministic transient-failure
/// rule.
pub fn matches_transient_rule(error: &str) -> bool {
    transient_rules().iter().any(|rule| rule.is_match(error))
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

enum ErrorClass {
    Recoverable {
        reason: String,
        remediation_title: Option<String>,
    },
    Fatal,
}

impl AgentRuntime {
    /// Handle a failed or blocked execution of a non-QA task (and thrown
    /// errors from any phase): classify, then either synthesize a
    /// recovery task or mark the task FAILED.
    pub(crate) async fn handle_execution_error(
        &mut self,
        node: &TaskNode,
        error: String,
    ) -> Result<()> {
        warn!(task_id = %node.id, error = %error, "task execution failed");

        let attempts = node.meta_u32(meta::RECOVERY_ATTEMPTS).unwrap_or(0);
        if attempts >= MAX_RECOVERY_ATTEMPTS {
            warn!(
                task_id = %node.id,
                attempts,
                "recovery attempts exhausted, marking task failed"
            );
            return self.record_fatal_failure(node, &error).await;
        }

        let class = self.classify_error(node, &error).await;
        let ErrorClass::Recoverable {
            reason,
            remediation_title,
        } = class
        else {
            return self.record_fatal_failure(node, &error).await;
        };

        let attempt = attempts + 1;
        let mut updated = node.clone();
        updated
            .metadata
            .insert(meta::RECOVERY_ATTEMPTS.to_owned(), attempt.to_string());
        updated
            .metadata
            .insert(meta::LAST_RECOVERY_REASON.to_owned(), reason.clone());
        dag::update_task_node(self.pool(), &self.config().goal_id, &updated).await?;

        let owner_role = updated
            .required_role()
            .unwrap_or(self.config().agent_role.as_str())
            .to_owned();
        let title = remediation_title
            .unwrap_or_else(|| format!("Recover {} after transient failure", node.id));
        let recovery_id = scheduler::create_recovery_task(
            self.pool(),
            &self.config().goal_id,
            &node.id,
            &owner_role,
            attempt,
            node.priority.saturating_add(2),
            &title,
        )
        .await?;

        let blocked = TaskState {
            status: TaskStatus::Blocked,
            owner: None,
            lease_expires: None,
            progress: Some(format!(
                "Recoverable failure on {}; created remediation task {recovery_id} \
                 (attempt {attempt}/{MAX_RECOVERY_ATTEMPTS}).",
                node.id
            )),
            artifacts: Vec::new(),
            last_error: Some(truncate_chars(&error, LAST_ERROR_MAX_CHARS)),
        };
        state::update_task_state(self.pool(), &node.id, &blocked).await?;
        info!(
            task_id = %node.id,
            recovery = %recovery_id,
            attempt,
            reason = %reason,
            "blocked task behind recovery work"
        );

        self.memory_mut().append(format!(
            "Recoverable failure {}: created {recovery_id} (attempt {attempt})",
            node.id
        ));
        self.snapshot_memory().await
    }

    /// QA remediation loop: bump the review cycle, synthesize a fix task
    /// for the responsible developer (escalating to the manager past the
    /// cycle limit), and block the QA node until the fix lands.
    pub(crate) async fn handle_qa_failure(
        &mut self,
        node: &TaskNode,
        summary: &str,
    ) -> Result<()> {
        let cycle = node.meta_u32(meta::REVIEW_CYCLE).unwrap_or(0) + 1;
        let mut updated = node.clone();
        updated
            .metadata
            .insert(meta::REVIEW_CYCLE.to_owned(), cycle.to_string());
        dag::update_task_node(self.pool(), &self.config().goal_id, &updated).await?;

        let mut dev_role = updated
            .meta(meta::DEV_ROLE)
            .unwrap_or(self.config().agent_role.as_str())
            .to_owned();
        if cycle > MAX_REVIEW_CYCLES_BEFORE_ESCALATION {
            if let Some(manager) = updated.meta(meta::MANAGER_ROLE) {
                info!(
                    task_id = %node.id,
                    cycle,
                    manager,
                    "review cycle limit exceeded, escalating remediation to manager"
                );
                dev_role = manager.to_owned();
            }
        }

        let remediation_id = scheduler::create_remediation_task(
            self.pool(),
            &self.config().goal_id,
            &node.id,
            &dev_role,
            cycle,
            node.priority.saturating_add(1),
        )
        .await?;

        let current = state::get_task_state(self.pool(), &node.id)
            .await?
            .unwrap_or_else(|| TaskState::new(TaskStatus::Ready));
        state::update_task_state(self.pool(), &node.id, &current.as_blocked(summary)).await?;
        info!(
            task_id = %node.id,
            remediation = %remediation_id,
            cycle,
            dev_role = %dev_role,
            "QA failed, blocked behind remediation"
        );

        self.memory_mut()
            .append(format!("QA failed {}: cycle {cycle}", node.id));
        self.snapshot_memory().await
    }

    /// Decide whether an error warrants a recovery task.
    async fn classify_error(&self, node: &TaskNode, error: &str) -> ErrorClass {
        if matches_transient_rule(error) {
            return ErrorClass::Recoverable {
                reason: "matched transient failure rule".to_owned(),
                remediation_title: None,
            };
        }

        match self
            .oracle()
            .assess_recovery(
                node,
                error,
                &self.config().goal_id,
                self.instructions_text(),
                &self.memory_snapshot(),
            )
            .await
        {
            Ok(assessment) => {
                if assessment.recoverable && assessment.confidence >= MIN_RECOVERY_CONFIDENCE {
                    let title = assessment.remediation_title.trim();
                    ErrorClass::Recoverable {
                        reason: assessment.reason,
                        remediation_title: if title.is_empty() {
                            None
                        } else {
                            Some(title.to_owned())
                        },
                    }
                } else {
                    ErrorClass::Fatal
                }
            }
            Err(e) => {
                warn!(task_id = %node.id, error = %e, "recovery assessment failed");
                ErrorClass::Fatal
            }
        }
    }

    /// Mark the task FAILED with its (truncated) error and note it in
    /// memory.
    async fn record_fatal_failure(&mut self, node: &TaskNode, error: &str) -> Result<()> {
        let truncated = truncate_chars(error, LAST_ERROR_MAX_CHARS);
        let current = state::get_task_state(self.pool(), &node.id)
            .await?
            .unwrap_or_else(|| TaskState::new(TaskStatus::Ready));
        state::update_task_state(self.pool(), &node.id, &current.as_failed(&truncated)).await?;
        self.memory_mut()
            .append(format!("Failed {}: {truncated}", node.id));
        self.snapshot_memory().await
    }
}
