use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use serde::Deserialize;

use crate::dependency::DependencyResolver;
use crate::error::{ConfigError, Result, StratumError};
use crate::metrics::Metric;
use crate::schema::{Dimension, Relation, RelationKind, Source};

/// Compiled schema and metric catalog.
///
/// Built once (from parts or a directory) and passed to the planner and
/// engine by reference. Construction validates every cross-reference, so
/// planning can rely on sources, relations and dependencies existing.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    sources: BTreeMap<String, Source>,
    metrics: HashMap<String, Metric>,
    metric_order: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricFile {
    metrics: Vec<Metric>,
}

impl SchemaRegistry {
    pub fn from_parts(sources: Vec<Source>, metrics: Vec<Metric>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for source in sources {
            if by_name.contains_key(&source.name) {
                return Err(ConfigError::DuplicateSource(source.name).into());
            }
            by_name.insert(source.name.clone(), source);
        }

        let sources = compile_relations(by_name)?;

        let mut registry = SchemaRegistry {
            sources,
            metrics: HashMap::new(),
            metric_order: Vec::new(),
        };
        for metric in metrics {
            registry.insert_metric(metric)?;
        }
        registry.validate_metrics()?;
        tracing::debug!(
            sources = registry.sources.len(),
            metrics = registry.metrics.len(),
            "compiled schema registry"
        );
        Ok(registry)
    }

    /// Load `sources/*.yml` (one source per file) and `metrics/*.yml`
    /// (a `metrics:` list per file) under `root`.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let mut sources = Vec::new();
        for path in yaml_files(root.join("sources"))? {
            let contents = fs::read_to_string(&path)?;
            let source: Source = serde_yaml::from_str(&contents)?;
            sources.push(source);
        }
        let mut metrics = Vec::new();
        let metrics_dir = root.join("metrics");
        if metrics_dir.exists() {
            for path in yaml_files(metrics_dir)? {
                let contents = fs::read_to_string(&path)?;
                let file: MetricFile = serde_yaml::from_str(&contents)?;
                metrics.extend(file.metrics);
            }
        }
        tracing::info!(
            path = %root.display(),
            sources = sources.len(),
            metrics = metrics.len(),
            "loaded schema definitions"
        );
        Self::from_parts(sources, metrics)
    }

    fn insert_metric(&mut self, metric: Metric) -> Result<()> {
        let key = metric.key().to_string();
        if self.metrics.contains_key(&key) {
            return Err(ConfigError::DuplicateMetric(key).into());
        }
        self.metric_order.push(key.clone());
        self.metrics.insert(key, metric);
        Ok(())
    }

    fn validate_metrics(&self) -> Result<()> {
        for key in &self.metric_order {
            let metric = &self.metrics[key];
            let source = self
                .sources
                .get(metric.source())
                .ok_or_else(|| ConfigError::UnknownSource(metric.source().to_string()))?;
            if let Some(agg) = metric.as_aggregation() {
                if !source.has_column(&agg.column) {
                    return Err(ConfigError::UnknownColumn {
                        source_name: source.name.clone(),
                        column: agg.column.clone(),
                    }
                    .into());
                }
            }
            for dep in metric.dependencies() {
                if !self.metrics.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        metric: key.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }

        // Levelizing the whole catalog rejects cycles at construction time.
        let all: Vec<Metric> = self.metrics().cloned().collect();
        let resolver = DependencyResolver::new(&all);
        let resolved: HashSet<String> = all
            .iter()
            .filter(|m| !m.is_computed())
            .map(|m| m.key().to_string())
            .collect();
        let computed: Vec<Metric> = all.iter().filter(|m| m.is_computed()).cloned().collect();
        resolver.levelize(&computed, &resolved)?;
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.get(name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn metric(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key)
    }

    /// Metrics in registration order.
    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.metric_order.iter().map(|k| &self.metrics[k])
    }

    pub fn dimension(&self, source: &str, name: &str) -> Result<(&Source, &Dimension)> {
        let src = self
            .source(source)
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;
        let dim = src.dimension(name).ok_or_else(|| ConfigError::UnknownDimension {
            source_name: source.to_string(),
            dimension: name.to_string(),
        })?;
        Ok((src, dim))
    }

    /// Resolve a `"source.dimension"` reference.
    pub fn resolve_dimension(&self, reference: &str) -> Result<(&Source, &str, &Dimension)> {
        let (source, name) = reference.split_once('.').ok_or_else(|| {
            StratumError::Config(ConfigError::Invalid(format!(
                "dimension reference {reference} must look like source.dimension"
            )))
        })?;
        let (src, dim) = self.dimension(source, name)?;
        let (name, _) = src
            .dimensions
            .get_key_value(name)
            .ok_or_else(|| ConfigError::UnknownDimension {
                source_name: source.to_string(),
                dimension: name.to_string(),
            })?;
        Ok((src, name.as_str(), dim))
    }
}

fn yaml_files(dir: PathBuf) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(ConfigError::Invalid(format!("directory not found: {}", dir.display())).into());
    }
    let mut files = Vec::new();
    for pattern in ["yml", "yaml"] {
        for entry in glob(&format!("{}/*.{pattern}", dir.display()))
            .map_err(|e| StratumError::Other(e.into()))?
            .flatten()
        {
            files.push(entry);
        }
    }
    files.sort();
    Ok(files)
}

/// Validate relation targets, expand pivot relations into two edges through
/// the pivot source and add inverse edges for symmetric traversal.
fn compile_relations(mut sources: BTreeMap<String, Source>) -> Result<BTreeMap<String, Source>> {
    let mut pivot_edges: Vec<(String, String, Relation)> = Vec::new();

    for source in sources.values_mut() {
        let mut expanded = BTreeMap::new();
        for (name, relation) in std::mem::take(&mut source.relations) {
            match &relation.kind {
                RelationKind::BelongsToMany {
                    pivot,
                    pivot_local_key,
                    pivot_related_key,
                    local_key,
                    related_key,
                } => {
                    expanded.insert(
                        format!("{name}_pivot"),
                        Relation::has_many(pivot, local_key, pivot_local_key),
                    );
                    pivot_edges.push((
                        pivot.clone(),
                        format!("{}_{name}", source.name),
                        Relation::belongs_to(&relation.target, pivot_related_key, related_key),
                    ));
                }
                _ => {
                    expanded.insert(name, relation);
                }
            }
        }
        source.relations = expanded;
    }

    for (pivot, name, relation) in pivot_edges {
        let pivot_source = sources.get_mut(&pivot).ok_or_else(|| {
            ConfigError::Invalid(format!("pivot source {pivot} is not registered"))
        })?;
        pivot_source.relations.entry(name).or_insert(relation);
    }

    let mut inverses: Vec<(String, String, Relation)> = Vec::new();
    for source in sources.values() {
        for (name, relation) in &source.relations {
            let target = sources.get(&relation.target).ok_or_else(|| {
                ConfigError::UnknownRelationTarget {
                    source_name: source.name.clone(),
                    relation: name.clone(),
                    target: relation.target.clone(),
                }
            })?;
            let declares_back = target.relations.values().any(|r| r.target == source.name);
            if declares_back || target.name == source.name {
                continue;
            }
            if let Some(inverse) = relation.inverse(&source.name) {
                let inverse_name = format!("{}_{name}_inverse", source.name);
                inverses.push((target.name.clone(), inverse_name, inverse));
            }
        }
    }
    for (target, name, relation) in inverses {
        if let Some(source) = sources.get_mut(&target) {
            // Two declared edges into the same source yield one inverse.
            if !source.relations.values().any(|r| r.target == relation.target) {
                source.relations.insert(name, relation);
            }
        }
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AggregationFn;

    fn orders_and_items() -> Vec<Source> {
        vec![
            Source::new("orders", "main")
                .with_relation("items", Relation::has_many("order_items", "id", "order_id")),
            Source::new("order_items", "main"),
        ]
    }

    #[test]
    fn adds_inverse_edges() {
        let registry = SchemaRegistry::from_parts(orders_and_items(), vec![]).unwrap();
        let items = registry.source("order_items").unwrap();
        let inverse = items
            .relations
            .values()
            .find(|r| r.target == "orders")
            .expect("inverse edge");
        assert!(inverse.inferred);
        assert_eq!(inverse.join_columns().unwrap(), ("order_id", "id"));
    }

    #[test]
    fn expands_pivot_relations() {
        let sources = vec![
            Source::new("posts", "main")
                .with_relation(
                    "tags",
                    Relation::belongs_to_many("tags", "post_tags", "post_id", "tag_id"),
                ),
            Source::new("post_tags", "main").with_primary_keys(&["post_id", "tag_id"]),
            Source::new("tags", "main"),
        ];
        let registry = SchemaRegistry::from_parts(sources, vec![]).unwrap();
        let posts = registry.source("posts").unwrap();
        assert_eq!(posts.relations["tags_pivot"].target, "post_tags");
        let pivot = registry.source("post_tags").unwrap();
        assert_eq!(pivot.relations["posts_tags"].target, "tags");
        assert_eq!(
            pivot.relations["posts_tags"].join_columns().unwrap(),
            ("tag_id", "id")
        );
    }

    #[test]
    fn rejects_unknown_relation_target() {
        let sources = vec![Source::new("orders", "main")
            .with_relation("customer", Relation::belongs_to("customers", "customer_id", "id"))];
        let err = SchemaRegistry::from_parts(sources, vec![]).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::UnknownRelationTarget { .. })
        ));
    }

    #[test]
    fn rejects_metric_cycles() {
        let metrics = vec![
            Metric::computed("a", "orders", "b + 1").unwrap(),
            Metric::computed("b", "orders", "a + 1").unwrap(),
        ];
        let err = SchemaRegistry::from_parts(orders_and_items(), metrics).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn rejects_unknown_columns_when_catalogued() {
        let mut orders = Source::new("orders", "main");
        orders.columns = vec!["id".to_string(), "total".to_string()];
        let metrics = vec![Metric::aggregation("tax", "orders", "tax", AggregationFn::Sum)];
        let err = SchemaRegistry::from_parts(vec![orders], metrics).unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn resolves_dimension_references() {
        let sources = vec![
            Source::new("orders", "main").with_dimension("status", Dimension::column("status")),
        ];
        let registry = SchemaRegistry::from_parts(sources, vec![]).unwrap();
        let (source, name, dim) = registry.resolve_dimension("orders.status").unwrap();
        assert_eq!(
            (source.name.as_str(), name, dim.column.as_str()),
            ("orders", "status", "status")
        );
        assert!(registry.resolve_dimension("orders.missing").is_err());
        assert!(registry.resolve_dimension("status").is_err());
    }
}
