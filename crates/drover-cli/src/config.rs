//! Operator configuration file.
//!
//! An optional TOML file supplies defaults for the store URL, oracle
//! invocation, and supervisor binary. Resolution order everywhere is:
//! CLI flag, then environment, then config file, then compiled default.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "drover.toml";

/// Parsed configuration file. Every section and field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub oracle: OracleSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleSection {
    pub provider: Option<String>,
    pub executable: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    pub binary: Option<String>,
}

impl ConfigFile {
    /// Load a config file. A missing file loads as all-defaults; a
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config {path:?}"));
            }
        };
        toml::from_str(&text).with_context(|| format!("invalid config file {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigFile::load(&dir.path().join("absent.toml")).unwrap();
        assert!(cfg.store.database_url.is_none());
        assert!(cfg.oracle.provider.is_none());
        assert!(cfg.supervisor.binary.is_none());
    }

    #[test]
    fn full_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        std::fs::write(
            &path,
            r#"
[store]
database_url = "sqlite:///var/lib/drover/store.db"

[oracle]
provider = "codex"
executable = "/usr/local/bin/codex"
extra_args = ["--model", "o4"]

[supervisor]
binary = "sysg"
"#,
        )
        .unwrap();
        let cfg = ConfigFile::load(&path).unwrap();
        assert_eq!(
            cfg.store.database_url.as_deref(),
            Some("sqlite:///var/lib/drover/store.db")
        );
        assert_eq!(cfg.oracle.provider.as_deref(), Some("codex"));
        assert_eq!(cfg.oracle.extra_args, vec!["--model", "o4"]);
        assert_eq!(cfg.supervisor.binary.as_deref(), Some("sysg"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drover.toml");
        std::fs::write(&path, "[store]\ndatabase_uri = \"oops\"\n").unwrap();
        assert!(ConfigFile::load(&path).is_err());
    }
}
