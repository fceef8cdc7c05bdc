use std::collections::{BTreeSet, HashSet};

use crate::backend::Capabilities;
use crate::dependency::{DependencyLevel, DependencyResolver};
use crate::error::{ConfigError, Result, StratumError};
use crate::join::{JoinGraphBuilder, JoinPlan};
use crate::metrics::{AggregationFn, Metric};
use crate::plan::{
    key_alias, AggregateSelect, BackendQuery, ComputeStage, ComputedSelect, DimensionSelect,
    MergeSpec, Partial, PlannedQuery, QueryPlan, SoftwareJoinPlan, SourceFetch, SourceRef,
    StagedBackendPlan,
};
use crate::registry::SchemaRegistry;
use crate::request::NormalizedRequest;

/// Picks the plan shape for a normalized request.
///
/// Rules, first match wins:
/// 1. several sources on a backend without joins: software join
/// 2. one source, staged computation available and backend-computable
///    derived metrics: staged plan, one stage per dependency level
/// 3. backend joins available: one backend query
/// 4. otherwise: software join
///
/// Several sources that the join graph cannot connect are always an error.
pub struct QueryPlanner<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn plan(
        &self,
        request: &NormalizedRequest,
        capabilities: &Capabilities,
    ) -> Result<PlannedQuery> {
        let base = request
            .sources
            .first()
            .ok_or_else(|| ConfigError::Invalid("request touches no source".to_string()))?;
        let connection = self
            .registry
            .source(base)
            .map(|s| s.connection.clone())
            .ok_or_else(|| ConfigError::UnknownSource(base.clone()))?;

        let joins = JoinGraphBuilder::new(self.registry).build(&request.sources);
        if request.sources.len() > 1 {
            if let Some(missing) = joins.missing(&request.sources).first() {
                return Err(StratumError::JoinResolution {
                    source_name: missing.to_string(),
                    connected: joins.sources.clone(),
                });
            }
        }

        let resolver = DependencyResolver::new(&request.metrics);
        let classification = resolver.classify()?;
        let aggregated: HashSet<String> = request
            .metrics
            .iter()
            .filter(|m| !m.is_computed())
            .map(|m| m.key().to_string())
            .collect();
        let backend_computed: Vec<Metric> = classification
            .backend
            .iter()
            .filter(|m| m.is_computed())
            .cloned()
            .collect();
        let all_computed: Vec<Metric> = request
            .metrics
            .iter()
            .filter(|m| m.is_computed())
            .cloned()
            .collect();

        let multi_source = request.sources.len() > 1;
        let columns = output_columns(request);

        let staged = !multi_source
            && capabilities.supports_staged_computation
            && !backend_computed.is_empty();

        let planned = if multi_source && !capabilities.supports_joins {
            self.software_join(request, joins, &resolver, &aggregated, &all_computed, columns)?
        } else if staged {
            let levels = resolver.levelize(&backend_computed, &aggregated)?;
            let post_levels = post_levels(
                &resolver,
                &classification.software,
                &aggregated,
                &backend_computed,
            )?;
            let base = self.backend_query(&connection, request, &joins, Vec::new())?;
            let stages = levels
                .into_iter()
                .map(|level| ComputeStage {
                    index: level.index,
                    metrics: computed_selects(&level.metrics),
                })
                .collect();
            PlannedQuery {
                plan: QueryPlan::Staged(StagedBackendPlan { base, stages }),
                post_levels,
                columns,
            }
        } else if capabilities.supports_joins {
            let levels = resolver.levelize(&backend_computed, &aggregated)?;
            let inline: Vec<ComputedSelect> = levels
                .iter()
                .flat_map(|l| computed_selects(&l.metrics))
                .collect();
            let post_levels = post_levels(
                &resolver,
                &classification.software,
                &aggregated,
                &backend_computed,
            )?;
            let query = self.backend_query(&connection, request, &joins, inline)?;
            PlannedQuery {
                plan: QueryPlan::SingleSource(query),
                post_levels,
                columns,
            }
        } else {
            self.software_join(request, joins, &resolver, &aggregated, &all_computed, columns)?
        };

        tracing::debug!(
            kind = ?planned.plan.kind(),
            sources = request.sources.len(),
            post_levels = planned.post_levels.len(),
            backend = %capabilities.name,
            "planned query"
        );
        Ok(planned)
    }

    fn source_ref(&self, name: &str) -> Result<SourceRef> {
        let source = self
            .registry
            .source(name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))?;
        Ok(SourceRef {
            name: source.name.clone(),
            table: source.table.clone(),
            primary_keys: source.primary_keys.clone(),
        })
    }

    fn backend_query(
        &self,
        connection: &str,
        request: &NormalizedRequest,
        joins: &JoinPlan,
        computed: Vec<ComputedSelect>,
    ) -> Result<BackendQuery> {
        let tables = joins
            .sources
            .iter()
            .map(|name| self.source_ref(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(BackendQuery {
            connection: connection.to_string(),
            tables,
            joins: joins.specs.clone(),
            dimensions: request.dimensions.clone(),
            aggregations: request
                .metrics
                .iter()
                .filter_map(Metric::as_aggregation)
                .map(|agg| AggregateSelect {
                    source: agg.source.clone(),
                    column: agg.column.clone(),
                    function: agg.function,
                    alias: agg.key.clone(),
                })
                .collect(),
            filters: request.filters.clone(),
            computed,
        })
    }

    fn software_join(
        &self,
        request: &NormalizedRequest,
        joins: JoinPlan,
        resolver: &DependencyResolver<'_>,
        aggregated: &HashSet<String>,
        computed: &[Metric],
        columns: Vec<String>,
    ) -> Result<PlannedQuery> {
        let mut fetches = Vec::new();
        for source_name in &joins.sources {
            let source = self.source_ref(source_name)?;
            let connection = self
                .registry
                .source(source_name)
                .map(|s| s.connection.clone())
                .unwrap_or_default();

            let mut dimensions: Vec<DimensionSelect> = request
                .dimensions
                .iter()
                .filter(|d| &d.source == source_name)
                .map(|d| DimensionSelect {
                    grouped: true,
                    ..d.clone()
                })
                .collect();
            for column in join_key_columns(&joins, source_name)? {
                dimensions.push(DimensionSelect {
                    source: source_name.clone(),
                    alias: key_alias(source_name, &column),
                    column,
                    time: None,
                    grouped: true,
                });
            }

            let mut aggregations = Vec::new();
            for agg in request.metrics.iter().filter_map(Metric::as_aggregation) {
                if &agg.source != source_name {
                    continue;
                }
                if agg.function == AggregationFn::Avg {
                    let partials = [(AggregationFn::Sum, "sum"), (AggregationFn::Count, "count")];
                    for (function, suffix) in partials {
                        aggregations.push(AggregateSelect {
                            source: agg.source.clone(),
                            column: agg.column.clone(),
                            function,
                            alias: format!("{}__{suffix}", agg.key),
                        });
                    }
                } else {
                    aggregations.push(AggregateSelect {
                        source: agg.source.clone(),
                        column: agg.column.clone(),
                        function: agg.function,
                        alias: agg.key.clone(),
                    });
                }
            }

            fetches.push(SourceFetch {
                source: source_name.clone(),
                query: BackendQuery {
                    connection,
                    tables: vec![source],
                    joins: Vec::new(),
                    dimensions,
                    aggregations,
                    filters: Vec::new(),
                    computed: Vec::new(),
                },
            });
        }

        let merges = request
            .metrics
            .iter()
            .filter_map(Metric::as_aggregation)
            .map(|agg| MergeSpec {
                alias: agg.key.clone(),
                source: agg.source.clone(),
                function: agg.function,
                partial: if agg.function == AggregationFn::Avg {
                    Partial::Avg {
                        sum: format!("{}__sum", agg.key),
                        count: format!("{}__count", agg.key),
                    }
                } else {
                    Partial::Column(agg.key.clone())
                },
            })
            .collect();

        let post_levels = resolver.levelize(computed, aggregated)?;
        Ok(PlannedQuery {
            plan: QueryPlan::SoftwareJoin(SoftwareJoinPlan {
                fetches,
                joins,
                filters: request.filters.clone(),
                group_by: request.grouped_aliases(),
                merges,
            }),
            post_levels,
            columns,
        })
    }
}

fn computed_selects(metrics: &[Metric]) -> Vec<ComputedSelect> {
    metrics
        .iter()
        .filter_map(Metric::as_computed)
        .map(|m| ComputedSelect {
            key: m.key.clone(),
            expr: m.expr.clone(),
        })
        .collect()
}

/// Levels for software-classified computed metrics, reading backend values.
fn post_levels(
    resolver: &DependencyResolver<'_>,
    software: &[Metric],
    aggregated: &HashSet<String>,
    backend_computed: &[Metric],
) -> Result<Vec<DependencyLevel>> {
    let mut resolved = aggregated.clone();
    resolved.extend(backend_computed.iter().map(|m| m.key().to_string()));
    let software: Vec<Metric> = software.iter().filter(|m| m.is_computed()).cloned().collect();
    resolver.levelize(&software, &resolved)
}

/// Columns of `source` that join edges or cross-join predicates read.
fn join_key_columns(joins: &JoinPlan, source: &str) -> Result<Vec<String>> {
    let mut columns = BTreeSet::new();
    for spec in &joins.specs {
        let (from_col, to_col) = spec.columns()?;
        if spec.from == source {
            columns.insert(from_col.to_string());
        }
        if spec.to == source {
            columns.insert(to_col.to_string());
            if let Some(predicate) = spec.predicate() {
                columns.insert(predicate.column.clone());
            }
        }
    }
    Ok(columns.into_iter().collect())
}

fn output_columns(request: &NormalizedRequest) -> Vec<String> {
    request
        .grouped_aliases()
        .into_iter()
        .chain(request.metrics.iter().map(|m| m.key().to_string()))
        .collect()
}
