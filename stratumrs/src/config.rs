//! Engine configuration.
//!
//! TOML with global defaults and per-connection overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global defaults applied to all connections unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-connection overrides (keyed by connection name).
    pub connections: HashMap<String, ConnectionConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub query: QueryConfig,
    pub execution: ExecutionConfig,
}

/// Query execution configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Upper bound on concurrent source fetches in a software join (default: 8).
    pub max_concurrent_fetches: usize,
}

/// Per-connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub query: Option<QueryConfig>,
    pub execution: Option<ExecutionConfig>,
    /// Treat the backend as join-incapable.
    pub disable_joins: bool,
    pub disable_staged_computation: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StratumError::Settings(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| StratumError::Settings(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `STRATUM_CONFIG` environment variable
    /// 2. `./stratum.toml`
    /// 3. `<config_dir>/stratum/config.toml`
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("STRATUM_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from STRATUM_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring STRATUM_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("stratum.toml") {
            tracing::info!("loaded config from ./stratum.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("stratum").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Resolved settings for a connection (overrides merged over defaults).
    pub fn for_connection(&self, name: &str) -> ResolvedConnectionConfig {
        let conn = self.connections.get(name);
        ResolvedConnectionConfig {
            timeout_ms: conn
                .and_then(|c| c.query.as_ref())
                .unwrap_or(&self.defaults.query)
                .timeout_ms,
            max_concurrent_fetches: conn
                .and_then(|c| c.execution.as_ref())
                .unwrap_or(&self.defaults.execution)
                .max_concurrent_fetches,
            disable_joins: conn.is_some_and(|c| c.disable_joins),
            disable_staged_computation: conn.is_some_and(|c| c.disable_staged_computation),
        }
    }
}

/// Fully resolved configuration for a connection (no Option fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnectionConfig {
    pub timeout_ms: u64,
    pub max_concurrent_fetches: usize,
    pub disable_joins: bool,
    pub disable_staged_computation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert_eq!(cfg.defaults.execution.max_concurrent_fetches, 8);
        let resolved = cfg.for_connection("anything");
        assert!(!resolved.disable_joins);
        assert!(!resolved.disable_staged_computation);
    }

    #[test]
    fn test_connection_override() {
        let toml = r#"
[defaults.query]
timeout_ms = 60000

[defaults.execution]
max_concurrent_fetches = 4

[connections.warehouse]
disable_joins = true

[connections.warehouse.query]
timeout_ms = 5000
"#;
        let cfg = EngineConfig::from_toml(toml).unwrap();

        let default_resolved = cfg.for_connection("main");
        assert_eq!(default_resolved.timeout_ms, 60_000);
        assert_eq!(default_resolved.max_concurrent_fetches, 4);
        assert!(!default_resolved.disable_joins);

        let warehouse = cfg.for_connection("warehouse");
        assert_eq!(warehouse.timeout_ms, 5_000);
        assert_eq!(warehouse.max_concurrent_fetches, 4);
        assert!(warehouse.disable_joins);
    }

    #[test]
    fn test_invalid_toml_is_a_settings_error() {
        let err = EngineConfig::from_toml("[defaults.query]\ntimeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, StratumError::Settings(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratum.toml");
        std::fs::write(&path, "[connections.db]\ndisable_staged_computation = true\n").unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert!(cfg.for_connection("db").disable_staged_computation);
        assert!(EngineConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
