//! Backend execution contract and the connection map.
//!
//! A backend executes one `BackendQuery` (or a staged plan) and returns rows.
//! The in-memory backend is always available; SQL engines sit behind
//! feature flags.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{EngineConfig, ResolvedConnectionConfig};
use crate::error::{Result, StratumError};
use crate::plan::{BackendQuery, StagedBackendPlan};
use crate::value::Row;

mod memory;

pub use memory::MemoryBackend;

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbBackend;

/// What a backend can push down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Dialect identifier, used to pick a grammar.
    pub name: String,
    pub supports_joins: bool,
    pub supports_staged_computation: bool,
}

impl Capabilities {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            supports_joins: true,
            supports_staged_computation: true,
        }
    }

    pub fn without_joins(mut self) -> Self {
        self.supports_joins = false;
        self
    }

    pub fn without_staged_computation(mut self) -> Self {
        self.supports_staged_computation = false;
        self
    }

    /// Apply per-connection switches from configuration.
    pub fn masked(&self, config: &ResolvedConnectionConfig) -> Self {
        Self {
            name: self.name.clone(),
            supports_joins: self.supports_joins && !config.disable_joins,
            supports_staged_computation: self.supports_staged_computation
                && !config.disable_staged_computation,
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn execute_query(&self, query: &BackendQuery) -> Result<Vec<Row>>;

    async fn execute_staged(&self, _plan: &StagedBackendPlan) -> Result<Vec<Row>> {
        Err(StratumError::Unsupported {
            backend: self.capabilities().name,
            operation: "staged computation".to_string(),
        })
    }
}

/// Backends keyed by connection name.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn Backend>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn Backend>) {
        self.connections.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.connections.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn Backend>> {
        self.get(name)
            .ok_or_else(|| StratumError::UnknownConnection(name.to_string()))
    }

    /// Backend capabilities narrowed by the connection's configuration.
    pub fn capabilities(&self, name: &str, config: &EngineConfig) -> Result<Capabilities> {
        let backend = self.require(name)?;
        Ok(backend.capabilities().masked(&config.for_connection(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_masks_capabilities() {
        let config = EngineConfig::from_toml(
            r#"
[connections.warehouse]
disable_joins = true
"#,
        )
        .unwrap();
        let mut manager = ConnectionManager::new();
        manager.insert("warehouse", Arc::new(MemoryBackend::new("duckdb")));
        manager.insert("main", Arc::new(MemoryBackend::new("duckdb")));

        let warehouse = manager.capabilities("warehouse", &config).unwrap();
        assert!(!warehouse.supports_joins);
        assert!(warehouse.supports_staged_computation);
        assert!(manager.capabilities("main", &config).unwrap().supports_joins);
        assert!(matches!(
            manager.capabilities("missing", &config),
            Err(StratumError::UnknownConnection(_))
        ));
    }
}
