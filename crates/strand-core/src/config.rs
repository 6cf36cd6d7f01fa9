//! Configuration for Strand tools.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`STRAND__` prefix, `__` separator)
//! 2. Config file (`strand.toml`)
//! 3. Defaults

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StrandConfig {
    /// JSON snapshot file backing the local storage.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Bearer token (a `StrandToken` UID) used to stamp passports.
    #[serde(default)]
    pub token: Option<String>,

    /// Named base64 ed25519 public keys for hashed-prop comparisons.
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
}

fn default_snapshot_path() -> String {
    "./strand.json".to_string()
}

impl Default for StrandConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            token: None,
            public_keys: BTreeMap::new(),
            log_json: false,
        }
    }
}

impl StrandConfig {
    /// Load from `<file_prefix>.*` (optional) layered under `STRAND__*` env vars.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("STRAND")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: StrandConfig = cfg.try_deserialize()?;
        tracing::debug!(file_prefix, snapshot_path = %loaded.snapshot_path, "Config loaded");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StrandConfig::default();
        assert_eq!(config.snapshot_path, "./strand.json");
        assert!(config.token.is_none());
        assert!(config.public_keys.is_empty());
        assert!(!config.log_json);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand-test.toml");
        std::fs::write(
            &path,
            r#"
snapshot_path = "/tmp/graph.json"
token = "tok-1"
log_json = true

[public_keys]
main = "AAAA"
"#,
        )
        .unwrap();

        let prefix = dir.path().join("strand-test");
        let config = StrandConfig::load(prefix.to_str().unwrap()).unwrap();
        assert_eq!(config.snapshot_path, "/tmp/graph.json");
        assert_eq!(config.token.as_deref(), Some("tok-1"));
        assert_eq!(config.public_keys.get("main").map(String::as_str), Some("AAAA"));
        assert!(config.log_json);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("absent");
        let config = StrandConfig::load(prefix.to_str().unwrap()).unwrap();
        assert_eq!(config, StrandConfig::default());
    }
}
