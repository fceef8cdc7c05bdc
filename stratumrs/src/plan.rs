//! Plan shapes produced by the planner.
//!
//! A plan is data only; backends and the software join executor interpret it.

use serde::Serialize;

use crate::dependency::DependencyLevel;
use crate::expr::Expr;
use crate::join::{JoinPlan, JoinSpecification};
use crate::metrics::AggregationFn;
use crate::schema::{DimensionFilter, TimeSpec};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub name: String,
    pub table: String,
    pub primary_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionSelect {
    pub source: String,
    pub column: String,
    pub alias: String,
    pub time: Option<TimeSpec>,
    /// Filter-only dimensions constrain rows without being grouped on.
    pub grouped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSelect {
    pub source: String,
    pub column: String,
    pub function: AggregationFn,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedSelect {
    pub key: String,
    pub expr: Expr,
}

/// A filter bound to a dimension alias of the same query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterSpec {
    pub alias: String,
    pub filter: DimensionFilter,
}

/// One backend round trip: join, filter, group, aggregate, then evaluate
/// inline computed metrics in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendQuery {
    pub connection: String,
    /// `tables[0]` is the base; every other table is introduced by `joins`.
    pub tables: Vec<SourceRef>,
    pub joins: Vec<JoinSpecification>,
    pub dimensions: Vec<DimensionSelect>,
    pub aggregations: Vec<AggregateSelect>,
    pub filters: Vec<FilterSpec>,
    pub computed: Vec<ComputedSelect>,
}

impl BackendQuery {
    pub fn base(&self) -> Option<&SourceRef> {
        self.tables.first()
    }

    pub fn table(&self, source: &str) -> Option<&SourceRef> {
        self.tables.iter().find(|t| t.name == source)
    }

    pub fn grouped_dimensions(&self) -> impl Iterator<Item = &DimensionSelect> {
        self.dimensions.iter().filter(|d| d.grouped)
    }

    pub fn dimension(&self, alias: &str) -> Option<&DimensionSelect> {
        self.dimensions.iter().find(|d| d.alias == alias)
    }

    /// Output aliases in row order.
    pub fn output_columns(&self) -> Vec<String> {
        self.grouped_dimensions()
            .map(|d| d.alias.clone())
            .chain(self.aggregations.iter().map(|a| a.alias.clone()))
            .chain(self.computed.iter().map(|c| c.key.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeStage {
    pub index: usize,
    pub metrics: Vec<ComputedSelect>,
}

/// A single-source aggregation followed by layered computation, each stage
/// reading the previous stage's columns (a CTE chain in SQL backends).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagedBackendPlan {
    pub base: BackendQuery,
    pub stages: Vec<ComputeStage>,
}

impl StagedBackendPlan {
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns = self.base.output_columns();
        for stage in &self.stages {
            columns.extend(stage.metrics.iter().map(|m| m.key.clone()));
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFetch {
    pub source: String,
    pub query: BackendQuery,
}

/// Where a merged metric reads its per-source partial values from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Partial {
    Column(String),
    Avg { sum: String, count: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSpec {
    pub alias: String,
    pub source: String,
    pub function: AggregationFn,
    pub partial: Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoftwareJoinPlan {
    pub fetches: Vec<SourceFetch>,
    pub joins: JoinPlan,
    pub filters: Vec<FilterSpec>,
    /// Requested dimension aliases, in output order.
    pub group_by: Vec<String>,
    pub merges: Vec<MergeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPlan {
    SingleSource(BackendQuery),
    Staged(StagedBackendPlan),
    SoftwareJoin(SoftwareJoinPlan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    SingleSource,
    Staged,
    SoftwareJoin,
}

impl QueryPlan {
    pub fn kind(&self) -> PlanKind {
        match self {
            QueryPlan::SingleSource(_) => PlanKind::SingleSource,
            QueryPlan::Staged(_) => PlanKind::Staged,
            QueryPlan::SoftwareJoin(_) => PlanKind::SoftwareJoin,
        }
    }
}

/// Planner output: the plan plus what must happen after it executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedQuery {
    pub plan: QueryPlan,
    /// Computed metrics left for post-processing, in dependency order.
    pub post_levels: Vec<DependencyLevel>,
    /// Final column order: grouped dimension aliases, then metric keys.
    pub columns: Vec<String>,
}

/// Internal column carrying a join key through a per-source fetch.
///
/// The source name is length-prefixed so `a_b`.`c` and `a`.`b_c` stay apart.
pub(crate) fn key_alias(source: &str, column: &str) -> String {
    format!("__key_{}_{source}_{column}", source.len())
}

/// Internal column numbering the fetched rows of one source.
pub(crate) fn row_id_alias(source: &str) -> String {
    format!("__row_{source}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_aliases_do_not_collide_across_underscores() {
        assert_eq!(key_alias("orders", "id"), "__key_6_orders_id");
        assert_ne!(key_alias("a_b", "c"), key_alias("a", "b_c"));
    }
}
