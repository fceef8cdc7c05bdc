//! Evaluation of computed metrics over fetched rows.

use serde_json::Value;

use crate::dependency::DependencyLevel;
use crate::error::{ConfigError, Result, StratumError};
use crate::expr::{EvalError, Expr};
use crate::value::{float_value, Row};

/// Evaluate `expr` against `row` and store the result under `key`.
///
/// Division by zero and null operands produce null; a referenced key absent
/// from the row is an error.
pub(crate) fn evaluate_into(row: &mut Row, key: &str, expr: &Expr) -> Result<()> {
    let value = expr
        .evaluate(|name| row.get(name))
        .map_err(|err| match err {
            EvalError::MissingRef(dependency) => StratumError::MissingValue {
                metric: key.to_string(),
                dependency,
            },
            other => StratumError::from(ConfigError::InvalidExpression {
                metric: key.to_string(),
                reason: other.to_string(),
            }),
        })?;
    row.insert(key.to_string(), value.map(float_value).unwrap_or(Value::Null));
    Ok(())
}

/// Applies dependency levels of computed metrics in order.
pub struct PostProcessor<'a> {
    levels: &'a [DependencyLevel],
}

impl<'a> PostProcessor<'a> {
    pub fn new(levels: &'a [DependencyLevel]) -> Self {
        Self { levels }
    }

    pub fn process(&self, mut rows: Vec<Row>) -> Result<Vec<Row>> {
        for level in self.levels {
            for metric in level.metrics.iter().filter_map(|m| m.as_computed()) {
                for row in rows.iter_mut() {
                    evaluate_into(row, &metric.key, &metric.expr)?;
                }
            }
            tracing::trace!(level = level.index, rows = rows.len(), "post-processed level");
        }
        Ok(rows)
    }
}
