//! Running aggregate state shared by the in-memory backend and the
//! software join's merge step.

use std::cmp::Ordering;

use serde_json::Value;

use crate::metrics::AggregationFn;
use crate::value::{as_f64, compare_values, float_value};

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum { int: i64, float: f64, all_int: bool, seen: bool },
    Count(i64),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
}

impl Accumulator {
    pub fn new(function: AggregationFn) -> Self {
        match function {
            AggregationFn::Sum => Accumulator::Sum {
                int: 0,
                float: 0.0,
                all_int: true,
                seen: false,
            },
            AggregationFn::Count => Accumulator::Count(0),
            AggregationFn::Min => Accumulator::Min(None),
            AggregationFn::Max => Accumulator::Max(None),
            AggregationFn::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
        }
    }

    /// Feed one raw column value. Nulls are ignored by every function.
    pub fn update(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match self {
            Accumulator::Sum {
                int,
                float,
                all_int,
                seen,
            } => {
                let Some(f) = as_f64(value) else { return };
                *seen = true;
                *float += f;
                match value.as_i64().and_then(|v| int.checked_add(v)) {
                    Some(next) if *all_int => *int = next,
                    _ => *all_int = false,
                }
            }
            Accumulator::Count(n) => *n += 1,
            Accumulator::Min(current) => keep(current, value, Ordering::Less),
            Accumulator::Max(current) => keep(current, value, Ordering::Greater),
            Accumulator::Avg { sum, count } => {
                if let Some(f) = as_f64(value) {
                    *sum += f;
                    *count += 1;
                }
            }
        }
    }

    /// Fold an already aggregated partial into the state.
    ///
    /// Counts add up, sums add up, min/max compare. Averages cannot be merged
    /// from their final value; use [`Accumulator::merge_avg`] with the
    /// partial sum and count instead.
    pub fn merge_partial(&mut self, partial: &Value) {
        match self {
            Accumulator::Count(n) => {
                if let Some(v) = partial.as_i64().or_else(|| as_f64(partial).map(|f| f as i64)) {
                    *n += v;
                }
            }
            _ => self.update(partial),
        }
    }

    pub fn merge_avg(&mut self, partial_sum: &Value, partial_count: &Value) {
        if let Accumulator::Avg { sum, count } = self {
            if let (Some(s), Some(c)) = (as_f64(partial_sum), as_f64(partial_count)) {
                *sum += s;
                *count += c as i64;
            }
        }
    }

    pub fn finish(&self) -> Value {
        match self {
            Accumulator::Sum { seen: false, .. } => Value::Null,
            Accumulator::Sum {
                int, all_int: true, ..
            } => Value::from(*int),
            Accumulator::Sum { float, .. } => float_value(*float),
            Accumulator::Count(n) => Value::from(*n),
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone().unwrap_or(Value::Null),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { sum, count } => float_value(*sum / *count as f64),
        }
    }
}

fn keep(current: &mut Option<Value>, candidate: &Value, wanted: Ordering) {
    let replace = match current {
        None => true,
        Some(existing) => compare_values(candidate, existing) == wanted,
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(function: AggregationFn, values: &[Value]) -> Value {
        let mut acc = Accumulator::new(function);
        values.iter().for_each(|v| acc.update(v));
        acc.finish()
    }

    #[test]
    fn sum_keeps_integers_when_possible() {
        assert_eq!(run(AggregationFn::Sum, &[json!(1), json!(2)]), json!(3));
        assert_eq!(run(AggregationFn::Sum, &[json!(1), json!(2.5)]), json!(3.5));
        assert_eq!(run(AggregationFn::Sum, &[Value::Null]), Value::Null);
    }

    #[test]
    fn count_ignores_nulls() {
        assert_eq!(
            run(AggregationFn::Count, &[json!(1), Value::Null, json!("x")]),
            json!(2)
        );
        assert_eq!(run(AggregationFn::Count, &[]), json!(0));
    }

    #[test]
    fn min_max_and_avg() {
        let values = [json!(4), json!(1), json!(7)];
        assert_eq!(run(AggregationFn::Min, &values), json!(1));
        assert_eq!(run(AggregationFn::Max, &values), json!(7));
        assert_eq!(run(AggregationFn::Avg, &values), json!(4.0));
        assert_eq!(run(AggregationFn::Avg, &[]), Value::Null);
    }

    #[test]
    fn merges_partials() {
        let mut count = Accumulator::new(AggregationFn::Count);
        count.merge_partial(&json!(3));
        count.merge_partial(&json!(2));
        assert_eq!(count.finish(), json!(5));

        let mut avg = Accumulator::new(AggregationFn::Avg);
        avg.merge_avg(&json!(10), &json!(2));
        avg.merge_avg(&json!(20), &json!(3));
        assert_eq!(avg.finish(), json!(6.0));
    }
}
