//! Metric definitions: aggregations over one source column, or computed
//! expressions over other metrics.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::{ConfigError, Result};
use crate::expr::{parse_expr, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationFn {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

impl AggregationFn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregationFn::Sum => "SUM",
            AggregationFn::Count => "COUNT",
            AggregationFn::Avg => "AVG",
            AggregationFn::Min => "MIN",
            AggregationFn::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationMetric {
    pub key: String,
    pub source: String,
    pub column: String,
    pub function: AggregationFn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputedMetric {
    pub key: String,
    /// Owning source, used for plan placement.
    pub source: String,
    pub expression: String,
    #[serde(skip)]
    pub expr: Expr,
    pub dependencies: Vec<String>,
}

/// The resolved metric variant the planner works with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metric {
    Aggregation(AggregationMetric),
    Computed(ComputedMetric),
}

impl Metric {
    pub fn aggregation(key: &str, source: &str, column: &str, function: AggregationFn) -> Self {
        Metric::Aggregation(AggregationMetric {
            key: key.to_string(),
            source: source.to_string(),
            column: column.to_string(),
            function,
        })
    }

    /// Build a computed metric; dependencies default to the keys the expression references.
    pub fn computed(key: &str, source: &str, expression: &str) -> Result<Self> {
        ComputedMetric::new(key, source, expression, None).map(Metric::Computed)
    }

    pub fn key(&self) -> &str {
        match self {
            Metric::Aggregation(m) => &m.key,
            Metric::Computed(m) => &m.key,
        }
    }

    /// Source that owns the metric: the aggregated source or the computed metric's placement.
    pub fn source(&self) -> &str {
        match self {
            Metric::Aggregation(m) => &m.source,
            Metric::Computed(m) => &m.source,
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            Metric::Aggregation(_) => &[],
            Metric::Computed(m) => &m.dependencies,
        }
    }

    pub fn as_aggregation(&self) -> Option<&AggregationMetric> {
        match self {
            Metric::Aggregation(m) => Some(m),
            Metric::Computed(_) => None,
        }
    }

    pub fn as_computed(&self) -> Option<&ComputedMetric> {
        match self {
            Metric::Computed(m) => Some(m),
            Metric::Aggregation(_) => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self, Metric::Computed(_))
    }
}

impl ComputedMetric {
    pub fn new(
        key: &str,
        source: &str,
        expression: &str,
        dependencies: Option<Vec<String>>,
    ) -> Result<Self> {
        let expr = parse_expr(expression).map_err(|e| ConfigError::InvalidExpression {
            metric: key.to_string(),
            reason: e.to_string(),
        })?;
        let references = expr.references();
        let dependencies = match dependencies {
            Some(declared) => {
                if let Some(undeclared) = references.iter().find(|r| !declared.contains(r)) {
                    return Err(ConfigError::InvalidExpression {
                        metric: key.to_string(),
                        reason: format!(
                            "{undeclared} is referenced but not declared as a dependency"
                        ),
                    }
                    .into());
                }
                declared
            }
            None => references,
        };
        if dependencies.iter().any(|d| d == key) {
            return Err(ConfigError::DependencyCycle {
                metric: key.to_string(),
            }
            .into());
        }
        Ok(ComputedMetric {
            key: key.to_string(),
            source: source.to_string(),
            expression: expression.to_string(),
            expr,
            dependencies,
        })
    }
}

impl<'de> Deserialize<'de> for Metric {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
        enum Raw {
            Aggregation {
                key: String,
                source: String,
                column: String,
                function: AggregationFn,
            },
            Computed {
                key: String,
                source: String,
                expression: String,
                #[serde(default)]
                dependencies: Option<Vec<String>>,
            },
        }

        match Raw::deserialize(deserializer)? {
            Raw::Aggregation {
                key,
                source,
                column,
                function,
            } => Ok(Metric::aggregation(&key, &source, &column, function)),
            Raw::Computed {
                key,
                source,
                expression,
                dependencies,
            } => ComputedMetric::new(&key, &source, &expression, dependencies)
                .map(Metric::Computed)
                .map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computed_dependencies_default_to_references() {
        let metric = Metric::computed("aov", "orders", "revenue / NULLIF(order_count, 0)").unwrap();
        assert_eq!(metric.dependencies(), ["revenue", "order_count"]);
    }

    #[test]
    fn undeclared_reference_is_rejected() {
        let err = ComputedMetric::new("aov", "orders", "a / b", Some(vec!["a".to_string()]))
            .unwrap_err();
        assert!(err.to_string().contains("b is referenced"));
    }

    #[test]
    fn deserializes_tagged_metrics() {
        let yaml = r#"
- type: aggregation
  key: revenue
  source: orders
  column: total
  function: sum
- type: computed
  key: doubled
  source: orders
  expression: revenue * 2
"#;
        let metrics: Vec<Metric> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[1].dependencies(), ["revenue"]);
    }
}
