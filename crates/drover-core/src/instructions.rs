//! Instruction document parsing.
//!
//! An instruction document is either a pure YAML mapping or a markdown
//! file with fenced ```yaml blocks, of which the first is authoritative.
//! It declares the agent fleet: one record per agent with its role, goal,
//! and file paths.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// Default goal id when a record names none.
pub const DEFAULT_GOAL_ID: &str = "goal-default";
/// Default poll cadence in seconds.
pub const DEFAULT_CADENCE_SECONDS: u64 = 5;

/// One agent declared by the instruction document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: String,
    /// Declared role, if any. [`AgentDescriptor::effective_role`] falls
    /// back to the name.
    pub role: Option<String>,
    pub goal_id: String,
    pub instructions_path: PathBuf,
    pub heartbeat_path: PathBuf,
    pub log_level: String,
    pub cadence_seconds: u64,
}

impl AgentDescriptor {
    /// The role string used for task gating: the declared role, else the
    /// agent name.
    pub fn effective_role(&self) -> &str {
        self.role.as_deref().unwrap_or(&self.name)
    }

    /// Ledger key for this agent's instruction versions.
    pub fn instruction_id(&self) -> String {
        format!("{}:{}", self.name, self.goal_id)
    }
}

/// Errors from instruction document parsing.
#[derive(Debug, Error)]
pub enum InstructionParseError {
    #[error("no YAML code block found and content is not valid YAML: {0}")]
    NotYaml(#[source] serde_yaml::Error),
    #[error("invalid YAML in code block: {0}")]
    InvalidBlock(#[source] serde_yaml::Error),
    #[error("instructions must contain a list of agents")]
    NotAList,
    #[error("agent record {index} is missing required field {field:?}")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate agent name {name:?}")]
    DuplicateName { name: String },
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    agents: Vec<RawAgent>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    name: Option<String>,
    role: Option<String>,
    goal: Option<String>,
    goal_id: Option<String>,
    instructions: Option<String>,
    heartbeat: Option<String>,
    #[serde(rename = "log-level", alias = "log_level")]
    log_level: Option<String>,
    #[serde(default)]
    cadence: Option<serde_yaml::Value>,
}

fn yaml_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```ya?ml\s*\n(.*?)\n```").expect("yaml block regex must compile")
    })
}

/// Parse an instruction document into agent descriptors.
///
/// Relative paths in the document resolve against `base_dir` (normally
/// the document's own directory).
pub fn parse_instruction_doc(
    text: &str,
    base_dir: &Path,
) -> Result<Vec<AgentDescriptor>, InstructionParseError> {
    let raw: RawDocument = match yaml_block_regex().captures(text) {
        Some(captures) => serde_yaml::from_str(captures.get(1).map(|m| m.as_str()).unwrap_or(""))
            .map_err(InstructionParseError::InvalidBlock)?,
        None => serde_yaml::from_str(text).map_err(InstructionParseError::NotYaml)?,
    };

    let mut descriptors = Vec::with_capacity(raw.agents.len());
    let mut seen = std::collections::HashSet::new();

    for (index, record) in raw.agents.into_iter().enumerate() {
        let name = record
            .name
            .filter(|n| !n.is_empty())
            .ok_or(InstructionParseError::MissingField {
                index,
                field: "name",
            })?;
        if !seen.insert(name.clone()) {
            return Err(InstructionParseError::DuplicateName { name });
        }

        let instructions = record.instructions.filter(|p| !p.is_empty()).ok_or(
            InstructionParseError::MissingField {
                index,
                field: "instructions",
            },
        )?;
        let heartbeat = record.heartbeat.filter(|p| !p.is_empty()).ok_or(
            InstructionParseError::MissingField {
                index,
                field: "heartbeat",
            },
        )?;

        descriptors.push(AgentDescriptor {
            name,
            role: record.role.filter(|r| !r.is_empty()),
            goal_id: record
                .goal
                .or(record.goal_id)
                .filter(|g| !g.is_empty())
                .unwrap_or_else(|| DEFAULT_GOAL_ID.to_owned()),
            instructions_path: base_dir.join(instructions),
            heartbeat_path: base_dir.join(heartbeat),
            log_level: record.log_level.unwrap_or_else(|| "INFO".to_owned()),
            cadence_seconds: parse_cadence(record.cadence.as_ref()),
        });
    }

    Ok(descriptors)
}

/// Read and parse an instruction document from disk.
pub fn read_instruction_doc(path: &Path) -> anyhow::Result<Vec<AgentDescriptor>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read instruction document {path:?}: {e}"))?;
    let base_dir = path.parent().unwrap_or(Path::new("."));
    Ok(parse_instruction_doc(&text, base_dir)?)
}

/// Normalize a cadence value: integers are taken as seconds, strings may
/// carry a trailing `s`. Invalid or absent values fall back to the
/// default; the floor is one second.
fn parse_cadence(value: Option<&serde_yaml::Value>) -> u64 {
    let parsed = match value {
        None => return DEFAULT_CADENCE_SECONDS,
        Some(serde_yaml::Value::Number(n)) => n.as_u64(),
        Some(serde_yaml::Value::String(s)) => {
            let trimmed = s.trim().to_lowercase();
            trimmed.strip_suffix('s').unwrap_or(&trimmed).parse().ok()
        }
        Some(_) => None,
    };
    parsed.unwrap_or(DEFAULT_CADENCE_SECONDS).max(1)
}
