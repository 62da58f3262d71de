//! Operator directive channel: a line-oriented file read by each agent.
//!
//! The file is declarative state, not an event queue: it is re-read on
//! every poll and never truncated, so operators see the current effect of
//! their file rather than events they might have missed.

use std::path::Path;

/// A parsed operator directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Stop claiming work until RESUME.
    Pause,
    /// Clear a previous PAUSE.
    Resume,
    /// Reload the instruction file immediately.
    Reparse,
    /// Force a task back to READY and release any owned lock.
    DropTask { task_id: String },
    /// Rewrite a task's priority. The value is kept as written; the agent
    /// ignores non-numeric priorities.
    Elevate { task_id: String, priority: String },
    /// Empty the agent's memory and overwrite its snapshot.
    FlushMemory,
}

/// Parse directive text into an ordered directive list.
///
/// Blank lines and `#` comments are skipped. The first token is
/// case-insensitive; unknown commands and commands missing required
/// arguments are ignored.
pub fn parse(text: &str) -> Vec<Directive> {
    let mut directives = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let args: Vec<&str> = parts.collect();

        match command.to_uppercase().as_str() {
            "PAUSE" => directives.push(Directive::Pause),
            "RESUME" => directives.push(Directive::Resume),
            "REPARSE" => directives.push(Directive::Reparse),
            "FLUSH-MEMORY" => directives.push(Directive::FlushMemory),
            "DROP-TASK" => {
                if let Some(task_id) = args.first() {
                    directives.push(Directive::DropTask {
                        task_id: (*task_id).to_owned(),
                    });
                }
            }
            "ELEVATE" => {
                if let [task_id, priority, ..] = args.as_slice() {
                    directives.push(Directive::Elevate {
                        task_id: (*task_id).to_owned(),
                        priority: (*priority).to_owned(),
                    });
                }
            }
            _ => {}
        }
    }
    directives
}

/// Read and parse the directive file. A missing or unreadable file reads
/// as no directives; the file is never consumed or truncated.
pub fn read(path: &Path) -> Vec<Directive> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse(&text),
        Err(_) => Vec::new(),
    }
}
