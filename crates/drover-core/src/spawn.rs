//! Supervisor spawn adapter.
//!
//! The coordinator does not fork agents itself; it asks an external
//! supervisor (`<supervisor> spawn --name … --parent-pid … -- <argv…>`)
//! which prints the new PID on stdout. The adapter is a trait so tests
//! and dry runs can substitute a non-forking implementation.

use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::info;

/// A request to start one agent process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Supervisor-visible process name.
    pub name: String,
    /// PID the new process is parented under.
    pub parent_pid: u32,
    pub log_level: String,
    /// Full agent command line (program plus flags).
    pub argv: Vec<String>,
}

/// The spawned process.
#[derive(Debug, Clone)]
pub struct SpawnHandle {
    pub pid: u32,
    /// The full command that was run, for logging and diagnostics.
    pub command: Vec<String>,
}

/// Interface for spawning agents under external supervision.
#[async_trait]
pub trait SpawnAdapter: Send + Sync {
    async fn spawn_agent(&self, request: &SpawnRequest) -> Result<SpawnHandle>;
}

/// Extract the PID from supervisor stdout.
///
/// Accepts either a `Spawned process with PID: <n>` line or a bare
/// integer; otherwise the last numeric token wins.
pub fn parse_spawn_pid(stdout: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"Spawned process with PID:\s*(\d+)").expect("pid regex must compile")
    });

    if let Some(captures) = re.captures(stdout) {
        return captures.get(1)?.as_str().parse().ok();
    }
    stdout
        .split_whitespace()
        .filter_map(|token| token.parse::<u32>().ok())
        .next_back()
}

/// Adapter that shells out to the real supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSpawnAdapter {
    supervisor_bin: String,
}

impl SupervisorSpawnAdapter {
    pub fn new(supervisor_bin: impl Into<String>) -> Self {
        Self {
            supervisor_bin: supervisor_bin.into(),
        }
    }

    fn build_command(&self, request: &SpawnRequest) -> Vec<String> {
        let mut command = vec![
            self.supervisor_bin.clone(),
            "spawn".to_owned(),
            "--name".to_owned(),
            request.name.clone(),
            "--parent-pid".to_owned(),
            request.parent_pid.to_string(),
            "--log-level".to_owned(),
            request.log_level.clone(),
            "--".to_owned(),
        ];
        command.extend(request.argv.iter().cloned());
        command
    }
}

#[async_trait]
impl SpawnAdapter for SupervisorSpawnAdapter {
    async fn spawn_agent(&self, request: &SpawnRequest) -> Result<SpawnHandle> {
        let command = self.build_command(request);
        info!(name = %request.name, "spawning agent: {}", command.join(" "));

        let output = Command::new(&command[0])
            .args(&command[1..])
            .output()
            .await
            .with_context(|| format!("failed to run supervisor {:?}", self.supervisor_bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "supervisor spawn failed for {} (exit {:?}): {}",
                request.name,
                output.status.code(),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(pid) = parse_spawn_pid(&stdout) else {
            bail!(
                "supervisor did not report a PID for {}: {:?}",
                request.name,
                stdout.trim()
            );
        };

        Ok(SpawnHandle { pid, command })
    }
}

/// Dry-run adapter: logs the command and reports PID 0.
#[derive(Debug, Clone, Default)]
pub struct LoggingSpawnAdapter;

#[async_trait]
impl SpawnAdapter for LoggingSpawnAdapter {
    async fn spawn_agent(&self, request: &SpawnRequest) -> Result<SpawnHandle> {
        let command = SupervisorSpawnAdapter::new("supervisor").build_command(request);
        info!(name = %request.name, "(dry-run) would spawn agent: {}", command.join(" "));
        Ok(SpawnHandle { pid: 0, command })
    }
}
