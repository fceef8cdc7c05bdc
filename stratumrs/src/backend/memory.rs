//! In-process backend over rows held in memory.
//!
//! Executes a `BackendQuery` natively: nested-loop inner joins over the raw
//! rows, then filtering, grouping and aggregation. Each aggregate reads a
//! given source row at most once per group, which keeps fan-out joins from
//! inflating sums and counts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, Timelike};
use serde_json::Value;

use crate::aggregate::Accumulator;
use crate::error::{ConfigError, Result, StratumError};
use crate::plan::{BackendQuery, ComputedSelect, SourceRef, StagedBackendPlan};
use crate::post_process::evaluate_into;
use crate::schema::{Granularity, TimeSpec};
use crate::value::{Row, ScalarKey};

use super::{Backend, Capabilities};

#[derive(Debug, Clone)]
pub struct MemoryBackend {
    capabilities: Capabilities,
    tables: HashMap<String, Vec<Row>>,
    latency: Option<Duration>,
}

struct Group {
    dimensions: Vec<Value>,
    accumulators: Vec<Accumulator>,
    seen: Vec<HashSet<usize>>,
}

impl MemoryBackend {
    /// Backend reporting `name` as its dialect, with joins and staging enabled.
    pub fn new(name: &str) -> Self {
        Self {
            capabilities: Capabilities::new(name),
            tables: HashMap::new(),
            latency: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_table(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.insert_table(table, rows);
        self
    }

    /// Delay every execution; useful to exercise timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_table(&mut self, table: &str, rows: Vec<Row>) {
        self.tables.insert(table.to_string(), rows);
    }

    fn rows_for(&self, table: &SourceRef) -> Result<&[Row]> {
        self.tables
            .get(&table.table)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                StratumError::execution(&table.name, format!("table {} not found", table.table))
            })
    }

    /// Execute synchronously; the async trait methods wrap this.
    pub fn run_query(&self, query: &BackendQuery) -> Result<Vec<Row>> {
        let base = query
            .base()
            .ok_or_else(|| StratumError::execution(&query.connection, "query selects no table"))?;
        let positions: HashMap<&str, usize> = query
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        let position = |source: &str| -> Result<usize> {
            positions.get(source).copied().ok_or_else(|| {
                StratumError::execution(source, format!("source {source} is not part of the query"))
            })
        };
        let data = query
            .tables
            .iter()
            .map(|t| self.rows_for(t))
            .collect::<Result<Vec<_>>>()?;

        let width = query.tables.len();
        let mut joined: Vec<Vec<Option<usize>>> = (0..data[0].len())
            .map(|i| {
                let mut slots = vec![None; width];
                slots[0] = Some(i);
                slots
            })
            .collect();

        for spec in &query.joins {
            let (from_col, to_col) = spec.columns()?;
            let from_pos = position(&spec.from)?;
            let to_pos = position(&spec.to)?;
            let targets = data[to_pos];
            let mut next = Vec::new();
            for slots in joined {
                let Some(from_idx) = slots[from_pos] else {
                    continue;
                };
                let left = data[from_pos][from_idx].get(from_col).unwrap_or(&Value::Null);
                if left.is_null() {
                    continue;
                }
                let key = ScalarKey::from_value(left);
                let accepts = |target: &Row| {
                    let right = target.get(to_col).unwrap_or(&Value::Null);
                    !right.is_null()
                        && ScalarKey::from_value(right) == key
                        && spec.predicate().map_or(true, |p| {
                            p.matches(target.get(&p.column).unwrap_or(&Value::Null))
                        })
                };
                match slots[to_pos] {
                    // Already joined through another path: the edge only filters.
                    Some(existing) => {
                        if accepts(&targets[existing]) {
                            next.push(slots);
                        }
                    }
                    None => {
                        for (idx, target) in targets.iter().enumerate() {
                            if accepts(target) {
                                let mut extended = slots.clone();
                                extended[to_pos] = Some(idx);
                                next.push(extended);
                            }
                        }
                    }
                }
            }
            joined = next;
        }

        let dim_positions = query
            .dimensions
            .iter()
            .map(|d| position(&d.source))
            .collect::<Result<Vec<_>>>()?;
        let agg_positions = query
            .aggregations
            .iter()
            .map(|a| position(&a.source))
            .collect::<Result<Vec<_>>>()?;
        let filter_slots = query
            .filters
            .iter()
            .map(|f| {
                query
                    .dimensions
                    .iter()
                    .position(|d| d.alias == f.alias)
                    .ok_or_else(|| {
                        StratumError::from(ConfigError::Invalid(format!(
                            "filter on {} has no matching dimension",
                            f.alias
                        )))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let grouped: Vec<usize> = query
            .dimensions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.grouped)
            .map(|(i, _)| i)
            .collect();

        let mut groups: BTreeMap<Vec<ScalarKey>, Group> = BTreeMap::new();
        'rows: for slots in &joined {
            let mut values = Vec::with_capacity(query.dimensions.len());
            for (dim, pos) in query.dimensions.iter().zip(&dim_positions) {
                let raw = slots[*pos]
                    .and_then(|i| data[*pos][i].get(&dim.column))
                    .cloned()
                    .unwrap_or(Value::Null);
                values.push(match dim.time {
                    Some(spec) => bucket_time(&raw, spec),
                    None => raw,
                });
            }
            for (filter, slot) in query.filters.iter().zip(&filter_slots) {
                if !filter.filter.matches(&values[*slot]) {
                    continue 'rows;
                }
            }

            let key: Vec<ScalarKey> = grouped
                .iter()
                .map(|i| ScalarKey::from_value(&values[*i]))
                .collect();
            let group = groups.entry(key).or_insert_with(|| new_group(query, &grouped, &values));
            for (idx, (agg, pos)) in query.aggregations.iter().zip(&agg_positions).enumerate() {
                let Some(row_idx) = slots[*pos] else {
                    continue;
                };
                if group.seen[idx].insert(row_idx) {
                    let value = data[*pos][row_idx].get(&agg.column).unwrap_or(&Value::Null);
                    group.accumulators[idx].update(value);
                }
            }
        }

        if groups.is_empty() && grouped.is_empty() && !query.aggregations.is_empty() {
            groups.insert(Vec::new(), new_group(query, &grouped, &[]));
        }

        let mut rows = Vec::with_capacity(groups.len());
        for group in groups.into_values() {
            let mut row = Row::new();
            for (i, value) in grouped.iter().zip(group.dimensions) {
                row.insert(query.dimensions[*i].alias.clone(), value);
            }
            for (agg, acc) in query.aggregations.iter().zip(&group.accumulators) {
                row.insert(agg.alias.clone(), acc.finish());
            }
            rows.push(row);
        }
        apply_computed(&mut rows, &query.computed)?;
        tracing::debug!(
            base = %base.name,
            joined = joined.len(),
            rows = rows.len(),
            "memory query"
        );
        Ok(rows)
    }
}

fn new_group(query: &BackendQuery, grouped: &[usize], values: &[Value]) -> Group {
    Group {
        dimensions: grouped
            .iter()
            .map(|i| values.get(*i).cloned().unwrap_or(Value::Null))
            .collect(),
        accumulators: query
            .aggregations
            .iter()
            .map(|a| Accumulator::new(a.function))
            .collect(),
        seen: vec![HashSet::new(); query.aggregations.len()],
    }
}

fn apply_computed(rows: &mut [Row], computed: &[ComputedSelect]) -> Result<()> {
    for select in computed {
        for row in rows.iter_mut() {
            evaluate_into(row, &select.key, &select.expr)?;
        }
    }
    Ok(())
}

fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.naive_utc())
                .ok()
                .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
                .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok())
                .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc()),
        _ => None,
    }
}

/// Truncate a timestamp or date to its bucket label.
///
/// Labels: hour `YYYY-MM-DD HH:00:00`, day `YYYY-MM-DD`, week the Monday
/// starting it, month `YYYY-MM`, year `YYYY`. Unparseable values bucket to null.
pub(crate) fn bucket_time(value: &Value, spec: TimeSpec) -> Value {
    let Some(ts) = parse_timestamp(value) else {
        return Value::Null;
    };
    let date = ts.date();
    let label = match spec.effective_granularity() {
        Granularity::Hour => format!("{} {:02}:00:00", date.format("%Y-%m-%d"), ts.hour()),
        Granularity::Day => date.format("%Y-%m-%d").to_string(),
        Granularity::Week => {
            let offset = u64::from(date.weekday().num_days_from_monday());
            let monday = date.checked_sub_days(Days::new(offset)).unwrap_or(date);
            monday.format("%Y-%m-%d").to_string()
        }
        Granularity::Month => format!("{:04}-{:02}", date.year(), date.month()),
        Granularity::Year => format!("{:04}", date.year()),
    };
    Value::String(label)
}

#[async_trait]
impl Backend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn execute_query(&self, query: &BackendQuery) -> Result<Vec<Row>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let start = Instant::now();
        let rows = self.run_query(query)?;
        tracing::debug!(
            rows = rows.len(),
            ms = start.elapsed().as_millis(),
            "memory execute_query"
        );
        Ok(rows)
    }

    async fn execute_staged(&self, plan: &StagedBackendPlan) -> Result<Vec<Row>> {
        if !self.capabilities.supports_staged_computation {
            return Err(StratumError::Unsupported {
                backend: self.capabilities.name.clone(),
                operation: "staged computation".to_string(),
            });
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut rows = self.run_query(&plan.base)?;
        for stage in &plan.stages {
            apply_computed(&mut rows, &stage.metrics)?;
            tracing::trace!(stage = stage.index, metrics = stage.metrics.len(), "memory stage");
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::JoinSpecification;
    use crate::metrics::AggregationFn;
    use crate::plan::{AggregateSelect, DimensionSelect, FilterSpec};
    use crate::schema::{DimensionFilter, Relation, TimePrecision};
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new("duckdb")
            .with_table(
                "orders",
                vec![
                    row(json!({
                        "id": 1, "total": 100, "status": "US", "created_at": "2024-03-14 10:30:00"
                    })),
                    row(json!({
                        "id": 2, "total": 200, "status": "CA", "created_at": "2024-03-20 08:00:00"
                    })),
                    row(json!({
                        "id": 3, "total": 50, "status": "US", "created_at": "2024-04-02 12:00:00"
                    })),
                ],
            )
            .with_table(
                "order_items",
                vec![
                    row(json!({"id": 10, "order_id": 1, "price": 50})),
                    row(json!({"id": 11, "order_id": 1, "price": 25})),
                    row(json!({"id": 12, "order_id": 3, "price": 5})),
                ],
            )
    }

    fn table(name: &str) -> SourceRef {
        SourceRef {
            name: name.to_string(),
            table: name.to_string(),
            primary_keys: vec!["id".to_string()],
        }
    }

    fn dim(source: &str, column: &str, alias: &str) -> DimensionSelect {
        DimensionSelect {
            source: source.to_string(),
            column: column.to_string(),
            alias: alias.to_string(),
            time: None,
            grouped: true,
        }
    }

    fn agg(source: &str, column: &str, function: AggregationFn, alias: &str) -> AggregateSelect {
        AggregateSelect {
            source: source.to_string(),
            column: column.to_string(),
            function,
            alias: alias.to_string(),
        }
    }

    #[test]
    fn joined_aggregates_ignore_fan_out() {
        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("orders"), table("order_items")],
            joins: vec![JoinSpecification::new(
                "orders",
                "order_items",
                "items",
                Relation::has_many("order_items", "id", "order_id"),
            )],
            dimensions: vec![dim("orders", "status", "orders_status")],
            aggregations: vec![
                agg("orders", "total", AggregationFn::Sum, "orders_total"),
                agg("order_items", "price", AggregationFn::Sum, "items_price"),
                agg("order_items", "id", AggregationFn::Count, "item_count"),
            ],
            filters: vec![],
            computed: vec![],
        };
        let rows = backend().run_query(&query).unwrap();
        assert_eq!(
            rows,
            vec![row(json!({
                "orders_status": "US",
                "orders_total": 150,
                "items_price": 80,
                "item_count": 3
            }))]
        );
    }

    #[test]
    fn filters_and_time_buckets() {
        let mut created = dim("orders", "created_at", "orders_created_month");
        created.time = Some(TimeSpec {
            granularity: Granularity::Month,
            precision: TimePrecision::Timestamp,
        });
        let mut status = dim("orders", "status", "orders_status");
        status.grouped = false;
        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("orders")],
            joins: vec![],
            dimensions: vec![created, status],
            aggregations: vec![agg("orders", "total", AggregationFn::Sum, "revenue")],
            filters: vec![FilterSpec {
                alias: "orders_status".to_string(),
                filter: DimensionFilter::Only(vec![json!("US")]),
            }],
            computed: vec![],
        };
        let rows = backend().run_query(&query).unwrap();
        assert_eq!(
            rows,
            vec![
                row(json!({"orders_created_month": "2024-03", "revenue": 100})),
                row(json!({"orders_created_month": "2024-04", "revenue": 50})),
            ]
        );
    }

    #[test]
    fn totals_without_dimensions_always_return_a_row() {
        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("orders")],
            joins: vec![],
            dimensions: vec![],
            aggregations: vec![agg("orders", "total", AggregationFn::Sum, "revenue")],
            filters: vec![],
            computed: vec![],
        };
        let empty = MemoryBackend::new("duckdb").with_table("orders", vec![]);
        assert_eq!(empty.run_query(&query).unwrap(), vec![row(json!({"revenue": null}))]);
    }

    #[test]
    fn buckets_follow_granularity_and_precision() {
        let ts = json!("2024-03-14T10:30:00Z");
        let spec = |granularity, precision| TimeSpec {
            granularity,
            precision,
        };
        assert_eq!(
            bucket_time(&ts, spec(Granularity::Hour, TimePrecision::Timestamp)),
            json!("2024-03-14 10:00:00")
        );
        assert_eq!(
            bucket_time(&ts, spec(Granularity::Hour, TimePrecision::Date)),
            json!("2024-03-14")
        );
        assert_eq!(
            bucket_time(&ts, spec(Granularity::Week, TimePrecision::Timestamp)),
            json!("2024-03-11")
        );
        assert_eq!(
            bucket_time(&json!("2024-03-14"), spec(Granularity::Year, TimePrecision::Date)),
            json!("2024")
        );
        assert_eq!(
            bucket_time(&json!("not a date"), spec(Granularity::Day, TimePrecision::Date)),
            Value::Null
        );
    }

    #[tokio::test]
    async fn missing_tables_are_execution_errors() {
        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("customers")],
            joins: vec![],
            dimensions: vec![],
            aggregations: vec![],
            filters: vec![],
            computed: vec![],
        };
        let err = backend().execute_query(&query).await.unwrap_err();
        assert!(matches!(err, StratumError::Execution { .. }));
    }
}
