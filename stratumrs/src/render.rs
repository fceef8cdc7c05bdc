//! SQL text for backend plans.
//!
//! Single-table queries render flat. Joined queries aggregate each metric
//! source over its distinct primary keys per dimension tuple, so one-to-many
//! joins never inflate totals:
//!
//! ```text
//! WITH joined AS (SELECT dims, primary keys FROM base JOIN ... WHERE filters),
//!      m_orders AS (SELECT dims, SUM(..)
//!                   FROM (SELECT DISTINCT dims, pk FROM joined) JOIN orders ...),
//!      m_items  AS (...)
//! SELECT ... FROM m_orders JOIN m_items ON dims match
//! ```

use std::collections::{HashMap, HashSet};

use crate::error::{ConfigError, Result};
use crate::expr::{ArithOp, Expr};
use crate::grammar::Grammar;
use crate::plan::{BackendQuery, ComputedSelect, DimensionSelect, FilterSpec, StagedBackendPlan};
use crate::schema::DimensionFilter;

pub struct SqlRenderer<'g> {
    grammar: &'g dyn Grammar,
}

impl<'g> SqlRenderer<'g> {
    pub fn new(grammar: &'g dyn Grammar) -> Self {
        Self { grammar }
    }

    pub fn render_query(&self, query: &BackendQuery) -> Result<String> {
        self.render_select(query, true)
    }

    /// Render the base query and one CTE per stage, each adding that stage's
    /// computed columns on top of the previous one.
    pub fn render_staged(&self, plan: &StagedBackendPlan) -> Result<String> {
        let mut ctes = vec![format!(
            "{} AS (\n{}\n)",
            self.q("stage_0"),
            self.render_select(&plan.base, false)?
        )];
        for (i, stage) in plan.stages.iter().enumerate() {
            let columns = self.computed_columns(&stage.metrics, &|name| Ok(self.q(name)))?;
            ctes.push(format!(
                "{} AS (\nSELECT *, {}\nFROM {}\n)",
                self.q(&format!("stage_{}", i + 1)),
                columns.join(", "),
                self.q(&format!("stage_{i}"))
            ));
        }
        let last = self.q(&format!("stage_{}", plan.stages.len()));
        let order = self.order_by(plan.base.grouped_dimensions().map(|d| self.q(&d.alias)));
        Ok(format!("WITH {}\nSELECT * FROM {last}{order}", ctes.join(",\n")))
    }

    fn q(&self, ident: &str) -> String {
        self.grammar.quote_ident(ident)
    }

    fn column(&self, source: &str, column: &str) -> String {
        format!("{}.{}", self.q(source), self.q(column))
    }

    fn dimension_expr(&self, dim: &DimensionSelect) -> String {
        let column = self.column(&dim.source, &dim.column);
        match dim.time {
            Some(spec) => self
                .grammar
                .format_time_bucket(&column, spec.granularity, spec.precision),
            None => column,
        }
    }

    fn filter_sql(&self, expr: &str, filter: &DimensionFilter) -> String {
        match filter {
            DimensionFilter::Only(values) if values.is_empty() => "1 = 0".to_string(),
            DimensionFilter::Only(values) => {
                format!("{expr} IN ({})", self.grammar.render_literal(&values.clone().into()))
            }
            DimensionFilter::Except(values) if values.is_empty() => "1 = 1".to_string(),
            DimensionFilter::Except(values) => format!(
                "({expr} IS NULL OR {expr} NOT IN ({}))",
                self.grammar.render_literal(&values.clone().into())
            ),
            DimensionFilter::Where(clause) => format!(
                "{expr} {} {}",
                clause.op.as_sql(),
                self.grammar.render_literal(&clause.value)
            ),
        }
    }

    fn where_clause(
        &self,
        query: &BackendQuery,
        filters: &[FilterSpec],
        extra: Vec<String>,
    ) -> Result<String> {
        let mut conditions = extra;
        for filter in filters {
            let dim = query.dimension(&filter.alias).ok_or_else(|| {
                let reason = format!("filter on {} has no matching dimension", filter.alias);
                ConfigError::Invalid(reason)
            })?;
            conditions.push(self.filter_sql(&self.dimension_expr(dim), &filter.filter));
        }
        Ok(if conditions.is_empty() {
            String::new()
        } else {
            format!("\nWHERE {}", conditions.join("\n  AND "))
        })
    }

    fn order_by(&self, exprs: impl Iterator<Item = String>) -> String {
        let items: Vec<String> = exprs.map(|e| self.grammar.order_nulls_first(&e)).collect();
        if items.is_empty() {
            String::new()
        } else {
            format!("\nORDER BY {}", items.join(", "))
        }
    }

    fn aggregate_expr(&self, function: crate::metrics::AggregationFn, column: &str) -> String {
        format!("{}({column})", function.sql_name())
    }

    fn computed_columns(
        &self,
        computed: &[ComputedSelect],
        base: &dyn Fn(&str) -> Result<String>,
    ) -> Result<Vec<String>> {
        let mut rendered: HashMap<&str, String> = HashMap::new();
        let mut columns = Vec::new();
        for select in computed {
            let sql = render_expr(&select.expr, &|name| match rendered.get(name) {
                Some(sql) => Ok(sql.clone()),
                None => base(name),
            })?;
            columns.push(format!("{sql} AS {}", self.q(&select.key)));
            rendered.insert(select.key.as_str(), sql);
        }
        Ok(columns)
    }

    /// FROM clause with joins; edges into an already joined table become conditions.
    fn from_clause(&self, query: &BackendQuery) -> Result<(String, Vec<String>)> {
        let base = query
            .base()
            .ok_or_else(|| ConfigError::Invalid("query selects no table".to_string()))?;
        let mut sql = format!("FROM {} AS {}", self.q(&base.table), self.q(&base.name));
        let mut joined: HashSet<&str> = HashSet::from([base.name.as_str()]);
        let mut extra = Vec::new();
        for spec in &query.joins {
            let (from_col, to_col) = spec.columns()?;
            let mut on = vec![format!(
                "{} = {}",
                self.column(&spec.from, from_col),
                self.column(&spec.to, to_col)
            )];
            if let Some(p) = spec.predicate() {
                on.push(format!(
                    "{} {} {}",
                    self.column(&spec.to, &p.column),
                    p.op.as_sql(),
                    self.grammar.render_literal(&p.value)
                ));
            }
            if joined.contains(spec.to.as_str()) {
                extra.extend(on);
                continue;
            }
            let table = query
                .table(&spec.to)
                .ok_or_else(|| ConfigError::UnknownSource(spec.to.clone()))?;
            sql.push_str(&format!(
                "\nJOIN {} AS {} ON {}",
                self.q(&table.table),
                self.q(&table.name),
                on.join(" AND ")
            ));
            joined.insert(spec.to.as_str());
        }
        Ok((sql, extra))
    }

    fn render_select(&self, query: &BackendQuery, ordered: bool) -> Result<String> {
        if !query.joins.is_empty() {
            return self.render_joined(query, ordered);
        }
        let grouped: Vec<&DimensionSelect> = query.grouped_dimensions().collect();
        let mut columns: Vec<String> = grouped
            .iter()
            .map(|d| format!("{} AS {}", self.dimension_expr(d), self.q(&d.alias)))
            .collect();
        let mut aggregates: HashMap<&str, String> = HashMap::new();
        for agg in &query.aggregations {
            let sql = self.aggregate_expr(agg.function, &self.column(&agg.source, &agg.column));
            columns.push(format!("{sql} AS {}", self.q(&agg.alias)));
            aggregates.insert(agg.alias.as_str(), sql);
        }
        columns.extend(self.computed_columns(&query.computed, &|name| {
            aggregates
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownMetric(name.to_string()).into())
        })?);

        let (from, extra) = self.from_clause(query)?;
        let filters = self.where_clause(query, &query.filters, extra)?;
        let distinct = query.aggregations.is_empty() && query.computed.is_empty();
        let group_by = if distinct || grouped.is_empty() {
            String::new()
        } else {
            let exprs: Vec<String> = grouped.iter().map(|d| self.dimension_expr(d)).collect();
            format!("\nGROUP BY {}", exprs.join(", "))
        };
        let order = if ordered {
            self.order_by(grouped.iter().map(|d| self.q(&d.alias)))
        } else {
            String::new()
        };
        Ok(format!(
            "SELECT {}{}\n{from}{filters}{group_by}{order}",
            if distinct { "DISTINCT " } else { "" },
            columns.join(", ")
        ))
    }

    fn render_joined(&self, query: &BackendQuery, ordered: bool) -> Result<String> {
        let grouped: Vec<&DimensionSelect> = query.grouped_dimensions().collect();
        let dim_aliases: Vec<String> = grouped.iter().map(|d| self.q(&d.alias)).collect();

        // Metric sources in first-use order.
        let mut metric_sources: Vec<&str> = Vec::new();
        for agg in &query.aggregations {
            if !metric_sources.contains(&agg.source.as_str()) {
                metric_sources.push(agg.source.as_str());
            }
        }

        let mut joined_columns: Vec<String> = grouped
            .iter()
            .map(|d| format!("{} AS {}", self.dimension_expr(d), self.q(&d.alias)))
            .collect();
        let mut pk_aliases: HashMap<&str, Vec<(String, String)>> = HashMap::new();
        for source in metric_sources.iter().copied() {
            let table = query
                .table(source)
                .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;
            let mut keys = Vec::new();
            for (i, pk) in table.primary_keys.iter().enumerate() {
                let alias = format!("__pk_{source}_{i}");
                joined_columns.push(format!("{} AS {}", self.column(source, pk), self.q(&alias)));
                keys.push((pk.clone(), alias));
            }
            pk_aliases.insert(source, keys);
        }
        if joined_columns.is_empty() {
            joined_columns.push("1 AS \"__one\"".to_string());
        }

        let (from, extra) = self.from_clause(query)?;
        let filters = self.where_clause(query, &query.filters, extra)?;
        let mut ctes = vec![format!(
            "{} AS (\nSELECT {}\n{from}{filters}\n)",
            self.q("joined"),
            joined_columns.join(", ")
        )];

        if metric_sources.is_empty() {
            let order = if ordered {
                self.order_by(dim_aliases.iter().cloned())
            } else {
                String::new()
            };
            return Ok(format!(
                "WITH {}\nSELECT DISTINCT {}\nFROM {}{order}",
                ctes.join(",\n"),
                dim_aliases.join(", "),
                self.q("joined")
            ));
        }

        let mut aggregates: HashMap<&str, String> = HashMap::new();
        let mut final_columns: Vec<String> = Vec::new();
        let first_cte = self.q(&format!("m_{}", metric_sources[0]));
        for alias in &dim_aliases {
            final_columns.push(format!("{first_cte}.{alias}"));
        }

        for source in metric_sources.iter().copied() {
            let cte = self.q(&format!("m_{source}"));
            let table = query
                .table(source)
                .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))?;
            let keys = pk_aliases.get(source).map(Vec::as_slice).unwrap_or_default();
            let distinct_cols: Vec<String> = dim_aliases
                .iter()
                .cloned()
                .chain(keys.iter().map(|(_, alias)| self.q(alias)))
                .collect();
            let on: Vec<String> = keys
                .iter()
                .map(|(pk, alias)| {
                    format!("{} = {}.{}", self.column(source, pk), self.q("d"), self.q(alias))
                })
                .collect();
            let from_distinct: Vec<String> = dim_aliases
                .iter()
                .map(|a| format!("{}.{a}", self.q("d")))
                .collect();
            let mut select = from_distinct.clone();
            for agg in query.aggregations.iter().filter(|a| a.source == source) {
                let sql = self.aggregate_expr(agg.function, &self.column(source, &agg.column));
                select.push(format!("{sql} AS {}", self.q(&agg.alias)));
                let reference = format!("{cte}.{}", self.q(&agg.alias));
                final_columns.push(reference.clone());
                aggregates.insert(agg.alias.as_str(), reference);
            }
            let group_by = if dim_aliases.is_empty() {
                String::new()
            } else {
                format!("\nGROUP BY {}", from_distinct.join(", "))
            };
            ctes.push(format!(
                "{cte} AS (\nSELECT {}\nFROM (SELECT DISTINCT {} FROM {}) AS {}\n\
                 JOIN {} AS {} ON {}{group_by}\n)",
                select.join(", "),
                distinct_cols.join(", "),
                self.q("joined"),
                self.q("d"),
                self.q(&table.table),
                self.q(source),
                on.join(" AND ")
            ));
        }

        final_columns.extend(self.computed_columns(&query.computed, &|name| {
            aggregates
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownMetric(name.to_string()).into())
        })?);

        let mut from = format!("FROM {first_cte}");
        for source in metric_sources.iter().skip(1) {
            let cte = self.q(&format!("m_{source}"));
            if dim_aliases.is_empty() {
                from.push_str(&format!("\nCROSS JOIN {cte}"));
            } else {
                let on: Vec<String> = dim_aliases
                    .iter()
                    .map(|a| {
                        self.grammar
                            .null_safe_eq(&format!("{first_cte}.{a}"), &format!("{cte}.{a}"))
                    })
                    .collect();
                from.push_str(&format!("\nJOIN {cte} ON {}", on.join(" AND ")));
            }
        }
        let order = if ordered {
            self.order_by(dim_aliases.iter().map(|a| format!("{first_cte}.{a}")))
        } else {
            String::new()
        };
        Ok(format!(
            "WITH {}\nSELECT {}\n{from}{order}",
            ctes.join(",\n"),
            final_columns.join(", ")
        ))
    }
}

/// Render an arithmetic expression; `resolve` supplies SQL for metric references.
pub(crate) fn render_expr(expr: &Expr, resolve: &dyn Fn(&str) -> Result<String>) -> Result<String> {
    Ok(match expr {
        Expr::Number { value } => value.to_string(),
        Expr::MetricRef { name } => resolve(name)?,
        Expr::Negate { expr } => format!("(-{})", render_expr(expr, resolve)?),
        Expr::Binary { op, left, right } => {
            let l = render_expr(left, resolve)?;
            let r = render_expr(right, resolve)?;
            match op {
                ArithOp::Add => format!("({l} + {r})"),
                ArithOp::Subtract => format!("({l} - {r})"),
                ArithOp::Multiply => format!("({l} * {r})"),
                ArithOp::Divide => format!("({l} * 1.0 / NULLIF({r}, 0))"),
            }
        }
        Expr::Func { func, args } => {
            let args = args
                .iter()
                .map(|a| render_expr(a, resolve))
                .collect::<Result<Vec<_>>>()?;
            format!("{}({})", func.sql_name(), args.join(", "))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expr;
    use crate::grammar::{DuckDbGrammar, MySqlGrammar};
    use crate::join::JoinSpecification;
    use crate::metrics::AggregationFn;
    use crate::plan::{AggregateSelect, ComputeStage, SourceRef};
    use crate::schema::Relation;
    use serde_json::json;

    fn table(name: &str) -> SourceRef {
        SourceRef {
            name: name.to_string(),
            table: format!("{name}_tbl"),
            primary_keys: vec!["id".to_string()],
        }
    }

    fn status() -> DimensionSelect {
        DimensionSelect {
            source: "orders".to_string(),
            column: "status".to_string(),
            alias: "orders_status".to_string(),
            time: None,
            grouped: true,
        }
    }

    fn sum(source: &str, column: &str, alias: &str) -> AggregateSelect {
        AggregateSelect {
            source: source.to_string(),
            column: column.to_string(),
            function: AggregationFn::Sum,
            alias: alias.to_string(),
        }
    }

    fn single_source() -> BackendQuery {
        BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("orders")],
            joins: vec![],
            dimensions: vec![status()],
            aggregations: vec![sum("orders", "total", "revenue"), sum("orders", "qty", "units")],
            filters: vec![FilterSpec {
                alias: "orders_status".to_string(),
                filter: DimensionFilter::Except(vec![json!("void")]),
            }],
            computed: vec![ComputedSelect {
                key: "per_unit".to_string(),
                expr: parse_expr("revenue / units").unwrap(),
            }],
        }
    }

    #[test]
    fn renders_flat_single_source_query() {
        let sql = SqlRenderer::new(&DuckDbGrammar).render_query(&single_source()).unwrap();
        assert_eq!(
            sql,
            "SELECT \"orders\".\"status\" AS \"orders_status\", SUM(\"orders\".\"total\") AS \"revenue\", \
SUM(\"orders\".\"qty\") AS \"units\", (SUM(\"orders\".\"total\") * 1.0 / NULLIF(SUM(\"orders\".\"qty\"), 0)) AS \"per_unit\"\n\
FROM \"orders_tbl\" AS \"orders\"\n\
WHERE (\"orders\".\"status\" IS NULL OR \"orders\".\"status\" NOT IN ('void'))\n\
GROUP BY \"orders\".\"status\"\n\
ORDER BY \"orders_status\" ASC NULLS FIRST"
        );
    }

    #[test]
    fn renders_staged_cte_chain() {
        let mut base = single_source();
        base.computed.clear();
        let plan = StagedBackendPlan {
            base,
            stages: vec![
                ComputeStage {
                    index: 0,
                    metrics: vec![ComputedSelect {
                        key: "per_unit".to_string(),
                        expr: parse_expr("revenue / units").unwrap(),
                    }],
                },
                ComputeStage {
                    index: 1,
                    metrics: vec![ComputedSelect {
                        key: "per_unit_pct".to_string(),
                        expr: parse_expr("per_unit * 100").unwrap(),
                    }],
                },
            ],
        };
        let sql = SqlRenderer::new(&DuckDbGrammar).render_staged(&plan).unwrap();
        assert!(sql.starts_with("WITH \"stage_0\" AS (\nSELECT \"orders\".\"status\""));
        assert!(sql.contains(
            "\"stage_1\" AS (\nSELECT *, (\"revenue\" * 1.0 / NULLIF(\"units\", 0)) AS \"per_unit\"\n\
             FROM \"stage_0\"\n)"
        ));
        assert!(sql.contains(
            "SELECT *, (\"per_unit\" * 100) AS \"per_unit_pct\"\nFROM \"stage_1\""
        ));
        assert!(sql.ends_with(
            "SELECT * FROM \"stage_2\"\nORDER BY \"orders_status\" ASC NULLS FIRST"
        ));
    }

    #[test]
    fn joined_queries_aggregate_per_source_over_distinct_keys() {
        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![table("orders"), table("order_items")],
            joins: vec![JoinSpecification::new(
                "orders",
                "order_items",
                "items",
                Relation::has_many("order_items", "id", "order_id"),
            )],
            dimensions: vec![status()],
            aggregations: vec![
                sum("orders", "total", "orders_total"),
                sum("order_items", "price", "items_price"),
            ],
            filters: vec![],
            computed: vec![],
        };
        let sql = SqlRenderer::new(&MySqlGrammar).render_query(&query).unwrap();
        assert!(sql.contains(
            "JOIN `order_items_tbl` AS `order_items` ON `orders`.`id` = `order_items`.`order_id`"
        ));
        assert!(sql.contains("`orders`.`id` AS `__pk_orders_0`"));
        assert!(sql.contains(
            "FROM (SELECT DISTINCT `orders_status`, `__pk_order_items_0` FROM `joined`) AS `d`"
        ));
        assert!(sql.contains(
            "JOIN `m_order_items` ON `m_orders`.`orders_status` <=> `m_order_items`.`orders_status`"
        ));
        assert!(sql.ends_with("ORDER BY `m_orders`.`orders_status` ASC"));
    }

    #[test]
    fn dimension_only_queries_are_distinct() {
        let mut query = single_source();
        query.aggregations.clear();
        query.computed.clear();
        query.filters.clear();
        let sql = SqlRenderer::new(&DuckDbGrammar).render_query(&query).unwrap();
        assert!(sql.starts_with("SELECT DISTINCT \"orders\".\"status\" AS \"orders_status\""));
        assert!(!sql.contains("GROUP BY"));
    }
}
