//! Query requests and their normalization against the registry.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::metrics::Metric;
use crate::plan::{DimensionSelect, FilterSpec};
use crate::registry::SchemaRegistry;
use crate::schema::{DimensionFilters, Granularity, TimeSpec, WhereClause};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<DimensionRef>,
    #[serde(default)]
    pub filters: Vec<RequestFilter>,
}

/// `"source.dimension"` or `{ dimension, granularity }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DimensionRef {
    Name(String),
    Detailed {
        dimension: String,
        #[serde(default)]
        granularity: Option<Granularity>,
    },
}

impl DimensionRef {
    pub fn reference(&self) -> &str {
        match self {
            DimensionRef::Name(name) => name,
            DimensionRef::Detailed { dimension, .. } => dimension,
        }
    }

    pub fn granularity(&self) -> Option<Granularity> {
        match self {
            DimensionRef::Name(_) => None,
            DimensionRef::Detailed { granularity, .. } => *granularity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestFilter {
    pub dimension: String,
    #[serde(default)]
    pub only: Option<Vec<Value>>,
    #[serde(default)]
    pub except: Option<Vec<Value>>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<WhereClause>,
}

impl RequestFilter {
    pub fn only(dimension: &str, values: Vec<Value>) -> Self {
        Self {
            dimension: dimension.to_string(),
            only: Some(values),
            except: None,
            where_clause: None,
        }
    }

    pub fn except(dimension: &str, values: Vec<Value>) -> Self {
        Self {
            except: Some(values),
            only: None,
            ..Self::only(dimension, Vec::new())
        }
    }

    pub fn where_clause(dimension: &str, clause: WhereClause) -> Self {
        Self {
            where_clause: Some(clause),
            only: None,
            ..Self::only(dimension, Vec::new())
        }
    }

    fn as_filters(&self) -> DimensionFilters {
        DimensionFilters {
            only: self.only.clone(),
            except: self.except.clone(),
            where_clause: self.where_clause.clone(),
        }
    }
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(mut self, key: &str) -> Self {
        self.metrics.push(key.to_string());
        self
    }

    pub fn dimension(mut self, reference: &str) -> Self {
        self.dimensions.push(DimensionRef::Name(reference.to_string()));
        self
    }

    pub fn time_dimension(mut self, reference: &str, granularity: Granularity) -> Self {
        self.dimensions.push(DimensionRef::Detailed {
            dimension: reference.to_string(),
            granularity: Some(granularity),
        });
        self
    }

    pub fn filter(mut self, filter: RequestFilter) -> Self {
        self.filters.push(filter);
        self
    }
}

/// A request resolved against the registry, ready for planning.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    /// Requested metrics followed by auto-included dependencies.
    pub metrics: Vec<Metric>,
    /// Keys the caller asked for; the rest are helpers.
    pub requested: Vec<String>,
    pub dimensions: Vec<DimensionSelect>,
    pub filters: Vec<FilterSpec>,
    /// Aggregation sources first, then dimension sources.
    pub sources: Vec<String>,
}

impl NormalizedRequest {
    pub fn grouped_aliases(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .filter(|d| d.grouped)
            .map(|d| d.alias.clone())
            .collect()
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.key() == key)
    }
}

pub fn dimension_alias(source: &str, dimension: &str, granularity: Option<Granularity>) -> String {
    match granularity {
        Some(g) => format!("{source}_{dimension}_{g}"),
        None => format!("{source}_{dimension}"),
    }
}

pub fn normalize(registry: &SchemaRegistry, request: &QueryRequest) -> Result<NormalizedRequest> {
    if request.metrics.is_empty() && request.dimensions.is_empty() {
        let reason = "request selects no metrics or dimensions".to_string();
        return Err(ConfigError::Invalid(reason).into());
    }

    let mut metrics: Vec<Metric> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for key in &request.metrics {
        if !seen.insert(key.clone()) {
            return Err(ConfigError::DuplicateMetric(key.clone()).into());
        }
        let metric = registry
            .metric(key)
            .ok_or_else(|| ConfigError::UnknownMetric(key.clone()))?;
        metrics.push(metric.clone());
    }
    // Pull in dependencies transitively, breadth first.
    let mut cursor = 0;
    while cursor < metrics.len() {
        let deps: Vec<String> = metrics[cursor].dependencies().to_vec();
        for dep in deps {
            if seen.insert(dep.clone()) {
                let metric = registry.metric(&dep).ok_or_else(|| ConfigError::UnknownDependency {
                    metric: metrics[cursor].key().to_string(),
                    dependency: dep.clone(),
                })?;
                metrics.push(metric.clone());
            }
        }
        cursor += 1;
    }

    let mut dimensions: Vec<DimensionSelect> = Vec::new();
    let mut filters: Vec<FilterSpec> = Vec::new();
    let mut used: Vec<(String, String)> = Vec::new();
    for dim_ref in &request.dimensions {
        let (source, name, dimension) = registry.resolve_dimension(dim_ref.reference())?;
        let time = dimension.time.map(|spec| TimeSpec {
            granularity: dim_ref.granularity().unwrap_or(spec.granularity),
            precision: spec.precision,
        });
        if time.is_none() && dim_ref.granularity().is_some() {
            return Err(ConfigError::Invalid(format!(
                "dimension {} is not a time dimension",
                dim_ref.reference()
            ))
            .into());
        }
        let alias = dimension_alias(&source.name, name, time.map(|t| t.granularity));
        if dimensions.iter().any(|d| d.alias == alias) {
            continue;
        }
        filters.extend(dimension.filters.to_filters().into_iter().map(|filter| FilterSpec {
            alias: alias.clone(),
            filter,
        }));
        used.push((dim_ref.reference().to_string(), alias.clone()));
        dimensions.push(DimensionSelect {
            source: source.name.clone(),
            column: dimension.column.clone(),
            alias,
            time,
            grouped: true,
        });
    }

    for request_filter in &request.filters {
        let existing = used
            .iter()
            .find(|(reference, _)| *reference == request_filter.dimension);
        let alias = match existing {
            Some((_, alias)) => alias.clone(),
            None => {
                let (source, name, dimension) =
                    registry.resolve_dimension(&request_filter.dimension)?;
                let granularity = dimension.time.map(|t| t.granularity);
                let alias = dimension_alias(&source.name, name, granularity);
                filters.extend(dimension.filters.to_filters().into_iter().map(|filter| FilterSpec {
                    alias: alias.clone(),
                    filter,
                }));
                used.push((request_filter.dimension.clone(), alias.clone()));
                dimensions.push(DimensionSelect {
                    source: source.name.clone(),
                    column: dimension.column.clone(),
                    alias: alias.clone(),
                    time: dimension.time,
                    grouped: false,
                });
                alias
            }
        };
        filters.extend(
            request_filter
                .as_filters()
                .to_filters()
                .into_iter()
                .map(|filter| FilterSpec {
                    alias: alias.clone(),
                    filter,
                }),
        );
    }

    let mut sources: Vec<String> = Vec::new();
    let aggregation_sources = metrics
        .iter()
        .filter_map(|m| m.as_aggregation().map(|a| a.source.as_str()));
    let dimension_sources = dimensions.iter().map(|d| d.source.as_str());
    for source in aggregation_sources.chain(dimension_sources) {
        if !sources.iter().any(|s| s == source) {
            sources.push(source.to_string());
        }
    }

    Ok(NormalizedRequest {
        requested: request.metrics.clone(),
        metrics,
        dimensions,
        filters,
        sources,
    })
}
