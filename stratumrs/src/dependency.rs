//! Classification of metrics into backend- and software-computed sets, and
//! layering of computed metrics into dependency levels.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::{ConfigError, Result};
use crate::metrics::Metric;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub backend: Vec<Metric>,
    pub software: Vec<Metric>,
}

/// Computed metrics whose dependencies are all satisfied by earlier levels
/// or by already materialized values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyLevel {
    pub index: usize,
    pub metrics: Vec<Metric>,
}

impl DependencyLevel {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(Metric::key)
    }
}

#[derive(Clone, Copy)]
enum Visit {
    InProgress,
    Done(bool),
}

pub struct DependencyResolver<'a> {
    by_key: HashMap<&'a str, &'a Metric>,
    order: &'a [Metric],
}

impl<'a> DependencyResolver<'a> {
    /// `metrics` is the full set known to the request (requested plus
    /// auto-included dependencies).
    pub fn new(metrics: &'a [Metric]) -> Self {
        Self {
            by_key: metrics.iter().map(|m| (m.key(), m)).collect(),
            order: metrics,
        }
    }

    pub fn classify(&self) -> Result<Classification> {
        let mut memo: HashMap<&str, Visit> = HashMap::new();
        let mut out = Classification::default();
        for metric in self.order {
            if self.backend_eligible(metric, &mut memo)? {
                out.backend.push(metric.clone());
            } else {
                out.software.push(metric.clone());
            }
        }
        Ok(out)
    }

    fn backend_eligible(
        &self,
        metric: &'a Metric,
        memo: &mut HashMap<&'a str, Visit>,
    ) -> Result<bool> {
        let key = metric.key();
        match memo.get(key) {
            Some(Visit::Done(result)) => return Ok(*result),
            Some(Visit::InProgress) => {
                return Err(ConfigError::DependencyCycle {
                    metric: key.to_string(),
                }
                .into())
            }
            None => {}
        }
        let Some(computed) = metric.as_computed() else {
            memo.insert(key, Visit::Done(true));
            return Ok(true);
        };

        memo.insert(key, Visit::InProgress);
        // Every dependency is visited even after one fails so cycles behind
        // it are still reported.
        let mut eligible = true;
        for dep in &computed.dependencies {
            match self.by_key.get(dep.as_str()).copied() {
                Some(dep_metric) => {
                    let dep_ok = self.backend_eligible(dep_metric, memo)?;
                    eligible &= dep_ok && dep_metric.source() == computed.source;
                }
                None => eligible = false,
            }
        }
        memo.insert(key, Visit::Done(eligible));
        Ok(eligible)
    }

    /// Layer `computed` so each metric sits strictly above its computed
    /// dependencies. `resolved` holds keys already available as values.
    pub fn levelize(
        &self,
        computed: &[Metric],
        resolved: &HashSet<String>,
    ) -> Result<Vec<DependencyLevel>> {
        let pending_keys: HashSet<&str> = computed.iter().map(Metric::key).collect();
        let mut available: HashSet<&str> = resolved.iter().map(String::as_str).collect();
        let mut remaining: Vec<&Metric> = computed.iter().collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&Metric>, Vec<&Metric>) = remaining
                .into_iter()
                .partition(|m| m.dependencies().iter().all(|d| available.contains(d.as_str())));
            if ready.is_empty() {
                return Err(unplaceable(&blocked, &pending_keys, &available).into());
            }
            for metric in &ready {
                available.insert(metric.key());
            }
            levels.push(DependencyLevel {
                index: levels.len(),
                metrics: ready.into_iter().cloned().collect(),
            });
            remaining = blocked;
        }
        Ok(levels)
    }
}

fn unplaceable(
    blocked: &[&Metric],
    computed: &HashSet<&str>,
    available: &HashSet<&str>,
) -> ConfigError {
    for metric in blocked {
        if let Some(dep) = metric
            .dependencies()
            .iter()
            .find(|d| !available.contains(d.as_str()) && !computed.contains(d.as_str()))
        {
            return ConfigError::UnknownDependency {
                metric: metric.key().to_string(),
                dependency: dep.clone(),
            };
        }
    }
    ConfigError::DependencyCycle {
        metric: blocked.first().map(|m| m.key().to_string()).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratumError;
    use crate::metrics::AggregationFn;

    fn catalog() -> Vec<Metric> {
        vec![
            Metric::aggregation("revenue", "orders", "total", AggregationFn::Sum),
            Metric::aggregation("order_count", "orders", "id", AggregationFn::Count),
            Metric::aggregation("item_price", "order_items", "price", AggregationFn::Sum),
            Metric::computed("aov", "orders", "revenue / order_count").unwrap(),
            Metric::computed("aov_doubled", "orders", "aov * 2").unwrap(),
            Metric::computed("price_share", "orders", "item_price / revenue").unwrap(),
        ]
    }

    fn keys(metrics: &[Metric]) -> Vec<&str> {
        metrics.iter().map(Metric::key).collect()
    }

    #[test]
    fn classifies_by_source_and_recursion() {
        let metrics = catalog();
        let class = DependencyResolver::new(&metrics).classify().unwrap();
        assert_eq!(
            keys(&class.backend),
            vec!["revenue", "order_count", "item_price", "aov", "aov_doubled"]
        );
        assert_eq!(keys(&class.software), vec!["price_share"]);
    }

    #[test]
    fn software_taint_propagates() {
        let mut metrics = catalog();
        metrics.push(Metric::computed("share_pct", "orders", "price_share * 100").unwrap());
        let class = DependencyResolver::new(&metrics).classify().unwrap();
        assert!(keys(&class.software).contains(&"share_pct"));
    }

    #[test]
    fn unresolved_dependency_is_software() {
        let metrics = vec![Metric::computed("ratio", "orders", "a / b").unwrap()];
        let class = DependencyResolver::new(&metrics).classify().unwrap();
        assert_eq!(keys(&class.software), vec!["ratio"]);
    }

    #[test]
    fn detects_cycles_when_classifying() {
        let metrics = vec![
            Metric::computed("a", "orders", "b + 1").unwrap(),
            Metric::computed("b", "orders", "a + 1").unwrap(),
        ];
        let err = DependencyResolver::new(&metrics).classify().unwrap_err();
        assert!(matches!(err, StratumError::Config(ConfigError::DependencyCycle { .. })));
    }

    #[test]
    fn levels_are_strictly_ordered_and_total() {
        let metrics = catalog();
        let computed: Vec<Metric> = metrics.iter().filter(|m| m.is_computed()).cloned().collect();
        let resolved: HashSet<String> = ["revenue", "order_count", "item_price"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let levels = DependencyResolver::new(&metrics).levelize(&computed, &resolved).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].keys().collect::<Vec<_>>(), vec!["aov", "price_share"]);
        assert_eq!(levels[1].keys().collect::<Vec<_>>(), vec!["aov_doubled"]);
        let total: usize = levels.iter().map(|l| l.metrics.len()).sum();
        assert_eq!(total, computed.len());
    }

    #[test]
    fn backend_materialized_metrics_count_as_resolved() {
        let metrics = catalog();
        let computed = vec![metrics[4].clone()];
        let resolved: HashSet<String> = ["aov".to_string()].into_iter().collect();
        let levels = DependencyResolver::new(&metrics).levelize(&computed, &resolved).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].index, 0);
    }

    #[test]
    fn unplaceable_metrics_are_fatal() {
        let metrics = vec![Metric::computed("x", "orders", "missing * 2").unwrap()];
        let err = DependencyResolver::new(&metrics)
            .levelize(&metrics, &HashSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            StratumError::Config(ConfigError::UnknownDependency { .. })
        ));

        let cyclic = vec![
            Metric::computed("a", "orders", "b").unwrap(),
            Metric::computed("b", "orders", "a").unwrap(),
        ];
        let err = DependencyResolver::new(&cyclic)
            .levelize(&cyclic, &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, StratumError::Config(ConfigError::DependencyCycle { .. })));
    }
}
