//! Prompt construction and response-contract enforcement.
//!
//! Every oracle call renders a prompt from the same five sections (task
//! statement, goal id, instructions, context JSON, response schema) and
//! demands a JSON object with exactly the schema's keys. All functions
//! here are pure so the contract is testable without a subprocess.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Descriptor for a rendered prompt, used in log lines.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Stable short id (sha256 prefix of the text).
    pub id: String,
    pub text: String,
    pub char_count: usize,
    /// Crude chars/4 token estimate.
    pub token_estimate: usize,
}

impl Prompt {
    /// Build a prompt descriptor with a stable id and token estimate.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let digest = hex::encode(Sha256::digest(text.as_bytes()));
        let char_count = text.chars().count();
        Self {
            id: digest[..12].to_owned(),
            token_estimate: (char_count / 4).max(1),
            char_count,
            text,
        }
    }
}

/// Render a prompt from the standard sections.
///
/// `schema` is an example payload whose keys define the required response
/// shape; `context` is arbitrary JSON the operation wants the oracle to
/// see (ready tasks, memory, the node under execution).
pub fn render_prompt(
    task_statement: &str,
    goal_id: &str,
    instructions: &str,
    context: Option<&Value>,
    schema: &Value,
) -> String {
    let instructions = instructions.trim();
    let mut sections = vec![
        task_statement.to_owned(),
        format!("Goal ID: {goal_id}"),
        format!(
            "Instructions:\n{}",
            if instructions.is_empty() {
                "No instructions provided."
            } else {
                instructions
            }
        ),
    ];
    if let Some(context) = context {
        sections.push(format!(
            "Context:\n{}",
            serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string())
        ));
    }
    sections.push(format!(
        "Respond with strict JSON following this structure:\n{}\n\
         Output MUST be one JSON object only.\n\
         First character must be '{{' and last character must be '}}'.\n\
         Output MUST use exactly these keys; no additional keys.\n\
         Do not include commentary, markdown, code fences, or surrounding text.",
        serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string())
    ));
    sections.join("\n\n")
}

/// Violations of the oracle response contract.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("oracle returned empty output")]
    EmptyOutput,
    #[error("oracle output is not JSON: {snippet:?}")]
    NotJson { snippet: String },
    #[error("oracle returned JSON that is not an object")]
    NotAnObject,
    #[error("invalid response shape: missing keys {missing:?}, extra keys {extra:?}")]
    KeyMismatch {
        missing: Vec<String>,
        extra: Vec<String>,
    },
}

/// Parse raw oracle output into a JSON object, tolerating leading and
/// trailing noise by retrying on the outermost `{…}` slice.
pub fn extract_json_object(raw: &str) -> Result<Map<String, Value>, ContractError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ContractError::EmptyOutput);
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(_) => return Err(ContractError::NotAnObject),
        Err(_) => {}
    }

    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return match value {
                    Value::Object(map) => Ok(map),
                    _ => Err(ContractError::NotAnObject),
                };
            }
        }
    }

    Err(ContractError::NotJson {
        snippet: text.chars().take(120).collect(),
    })
}

/// Require the payload to contain exactly `required_keys`.
pub fn validate_keys(
    payload: &Map<String, Value>,
    required_keys: &[&str],
) -> Result<(), ContractError> {
    let mut missing: Vec<String> = required_keys
        .iter()
        .filter(|key| !payload.contains_key(**key))
        .map(|key| (*key).to_owned())
        .collect();
    let mut extra: Vec<String> = payload
        .keys()
        .filter(|key| !required_keys.contains(&key.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    missing.sort();
    extra.sort();
    Err(ContractError::KeyMismatch { missing, extra })
}

/// Build the corrective prompt sent after a contract violation.
pub fn repair_prompt(original_prompt: &str, bad_output: &str, required_keys: &[&str]) -> String {
    let mut keys: Vec<&str> = required_keys.to_vec();
    keys.sort_unstable();
    format!(
        "Your previous response violated the JSON contract.\n\
         Required keys (exactly): {keys:?}\n\
         Return exactly one JSON object. No prose, no markdown, no code fences.\n\
         If a value is unknown, use null or an empty string/list as appropriate.\n\n\
         Original prompt:\n{original_prompt}\n\n\
         Previous invalid output:\n{bad_output}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_descriptor_is_stable() {
        let a = Prompt::from_text("hello world");
        let b = Prompt::from_text("hello world");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 12);
        assert_eq!(a.char_count, 11);
        assert!(a.token_estimate >= 1);
    }

    #[test]
    fn render_includes_all_sections() {
        let rendered = render_prompt(
            "Choose the next task.",
            "goal-7",
            "build the thing",
            Some(&json!({"ready_tasks": []})),
            &json!({"selected_task_id": "task id or null"}),
        );
        assert!(rendered.contains("Choose the next task."));
        assert!(rendered.contains("Goal ID: goal-7"));
        assert!(rendered.contains("build the thing"));
        assert!(rendered.contains("ready_tasks"));
        assert!(rendered.contains("exactly these keys"));
    }

    #[test]
    fn render_handles_empty_instructions() {
        let rendered = render_prompt("Do.", "g", "   ", None, &json!({}));
        assert!(rendered.contains("No instructions provided."));
        assert!(!rendered.contains("Context:"));
    }

    #[test]
    fn extract_plain_object() {
        let map = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(map.get("a"), Some(&json!(1)));
    }

    #[test]
    fn extract_tolerates_surrounding_noise() {
        let raw = "Sure! Here is the JSON you asked for:\n{\"status\": \"done\"}\nHope that helps.";
        let map = extract_json_object(raw).unwrap();
        assert_eq!(map.get("status"), Some(&json!("done")));
    }

    #[test]
    fn extract_rejects_empty_output() {
        assert!(matches!(
            extract_json_object("   \n"),
            Err(ContractError::EmptyOutput)
        ));
    }

    #[test]
    fn extract_rejects_non_object_json() {
        assert!(matches!(
            extract_json_object("[1, 2, 3]"),
            Err(ContractError::NotAnObject)
        ));
    }

    #[test]
    fn extract_rejects_garbage() {
        assert!(matches!(
            extract_json_object("not json at all"),
            Err(ContractError::NotJson { .. })
        ));
    }

    #[test]
    fn validate_exact_keys() {
        let map = extract_json_object(r#"{"a": 1, "b": 2}"#).unwrap();
        assert!(validate_keys(&map, &["a", "b"]).is_ok());
    }

    #[test]
    fn validate_reports_missing_and_extra() {
        let map = extract_json_object(r#"{"a": 1, "z": 9}"#).unwrap();
        let err = validate_keys(&map, &["a", "b"]).unwrap_err();
        match err {
            ContractError::KeyMismatch { missing, extra } => {
                assert_eq!(missing, vec!["b"]);
                assert_eq!(extra, vec!["z"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn repair_prompt_embeds_original_and_bad_output() {
        let repaired = repair_prompt("ORIGINAL", "BAD {", &["b", "a"]);
        assert!(repaired.contains("ORIGINAL"));
        assert!(repaired.contains("BAD {"));
        assert!(repaired.contains(r#"["a", "b"]"#));
    }
}
