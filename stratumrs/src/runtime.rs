//! Query entry point: normalize, plan, execute, post-process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Capabilities, ConnectionManager};
use crate::config::EngineConfig;
use crate::error::{ConfigError, Result, StratumError};
use crate::grammar::GrammarRegistry;
use crate::plan::{PlannedQuery, QueryPlan};
use crate::planner::QueryPlanner;
use crate::post_process::PostProcessor;
use crate::registry::SchemaRegistry;
use crate::render::SqlRenderer;
use crate::request::{normalize, NormalizedRequest, QueryRequest};
use crate::result::{ColumnKind, ColumnMeta, QueryResult};
use crate::software_join::SoftwareJoinExecutor;
use crate::value::{key_tuple, Row};

pub struct Engine {
    registry: Arc<SchemaRegistry>,
    connections: ConnectionManager,
    grammars: GrammarRegistry,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: Arc<SchemaRegistry>, connections: ConnectionManager) -> Self {
        Self {
            registry,
            connections,
            grammars: GrammarRegistry::with_defaults(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_grammars(mut self, grammars: GrammarRegistry) -> Self {
        self.grammars = grammars;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Connection of the request's first source; backend plans run there.
    fn connection_for(&self, request: &NormalizedRequest) -> Result<String> {
        let base = request
            .sources
            .first()
            .ok_or_else(|| ConfigError::Invalid("request touches no source".to_string()))?;
        self.registry
            .source(base)
            .map(|s| s.connection.clone())
            .ok_or_else(|| ConfigError::UnknownSource(base.clone()).into())
    }

    fn prepare(
        &self,
        request: &QueryRequest,
    ) -> Result<(NormalizedRequest, String, Capabilities, PlannedQuery)> {
        let normalized = normalize(&self.registry, request)?;
        let connection = self.connection_for(&normalized)?;
        let capabilities = self.connections.capabilities(&connection, &self.config)?;
        let planned = QueryPlanner::new(&self.registry).plan(&normalized, &capabilities)?;
        Ok((normalized, connection, capabilities, planned))
    }

    pub fn plan(&self, request: &QueryRequest) -> Result<PlannedQuery> {
        self.prepare(request).map(|(_, _, _, planned)| planned)
    }

    /// SQL the chosen plan would send, in the grammar of the backend.
    ///
    /// Software joins render one statement per source fetch.
    pub fn explain_sql(&self, request: &QueryRequest) -> Result<String> {
        let (_, _, capabilities, planned) = self.prepare(request)?;
        let grammar = self
            .grammars
            .get(&capabilities.name)
            .ok_or_else(|| StratumError::Unsupported {
                backend: capabilities.name.clone(),
                operation: "sql rendering".to_string(),
            })?;
        let renderer = SqlRenderer::new(grammar.as_ref());
        match &planned.plan {
            QueryPlan::SingleSource(query) => renderer.render_query(query),
            QueryPlan::Staged(staged) => renderer.render_staged(staged),
            QueryPlan::SoftwareJoin(plan) => {
                let mut statements = Vec::new();
                for fetch in &plan.fetches {
                    let sql = renderer.render_query(&fetch.query)?;
                    statements.push(format!("-- {}\n{sql};", fetch.source));
                }
                Ok(statements.join("\n\n"))
            }
        }
    }

    pub async fn run(&self, request: &QueryRequest) -> Result<QueryResult> {
        let start = Instant::now();
        let (normalized, connection, _, planned) = self.prepare(request)?;
        let settings = self.config.for_connection(&connection);

        let execution = self.execute(&planned.plan, &connection, settings.max_concurrent_fetches);
        // 0 disables the timeout.
        let rows = if settings.timeout_ms == 0 {
            execution.await?
        } else {
            tokio::time::timeout(Duration::from_millis(settings.timeout_ms), execution)
                .await
                .map_err(|_| StratumError::Timeout {
                    timeout_ms: settings.timeout_ms,
                })??
        };

        let rows = PostProcessor::new(&planned.post_levels).process(rows)?;
        let grouped = normalized.grouped_aliases();
        let columns: Vec<ColumnMeta> = planned
            .columns
            .iter()
            .filter_map(|name| {
                let kind = if grouped.contains(name) {
                    ColumnKind::Dimension
                } else if normalized.requested.contains(name) {
                    ColumnKind::Metric
                } else {
                    return None;
                };
                Some(ColumnMeta {
                    name: name.clone(),
                    kind,
                })
            })
            .collect();

        let mut rows: Vec<Row> = rows
            .into_iter()
            .map(|row| project(row, &columns))
            .collect();
        rows.sort_by_cached_key(|row| key_tuple(row, &grouped));

        tracing::info!(
            kind = ?planned.plan.kind(),
            rows = rows.len(),
            ms = start.elapsed().as_millis(),
            "query finished"
        );
        Ok(QueryResult {
            columns,
            rows,
            plan_kind: planned.plan.kind(),
        })
    }

    async fn execute(
        &self,
        plan: &QueryPlan,
        connection: &str,
        max_concurrent_fetches: usize,
    ) -> Result<Vec<Row>> {
        match plan {
            QueryPlan::SingleSource(query) => {
                self.connections.require(connection)?.execute_query(query).await
            }
            QueryPlan::Staged(staged) => {
                self.connections.require(connection)?.execute_staged(staged).await
            }
            QueryPlan::SoftwareJoin(plan) => {
                SoftwareJoinExecutor::new(&self.connections, max_concurrent_fetches)
                    .execute(plan)
                    .await
            }
        }
    }
}

/// Keep the output columns, in order, dropping helpers and internals.
fn project(mut row: Row, columns: &[ColumnMeta]) -> Row {
    columns
        .iter()
        .map(|c| {
            let value = row.remove(&c.name).unwrap_or(serde_json::Value::Null);
            (c.name.clone(), value)
        })
        .collect()
}
