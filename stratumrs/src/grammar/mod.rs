//! SQL grammars for backend plans.
//!
//! A grammar renders identifiers, literals and the few pieces that differ
//! between engines. Grammars are looked up by name in a `GrammarRegistry`
//! built at startup; engines that share a dialect share one instance.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::schema::{Granularity, TimePrecision};

mod duckdb;
mod mysql;
mod postgres;
mod sqlite;

pub use duckdb::DuckDbGrammar;
pub use mysql::MySqlGrammar;
pub use postgres::PostgresGrammar;
pub use sqlite::SqliteGrammar;

pub trait Grammar: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Expression labelling `column` with its time bucket.
    ///
    /// Labels are text: `YYYY-MM-DD HH:00:00` for hours, `YYYY-MM-DD` for
    /// days and weeks (the Monday), `YYYY-MM` for months, `YYYY` for years.
    fn format_time_bucket(
        &self,
        column: &str,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> String;

    fn null_safe_eq(&self, left: &str, right: &str) -> String {
        format!("{left} IS NOT DISTINCT FROM {right}")
    }

    /// Ascending sort key with nulls first.
    fn order_nulls_first(&self, expr: &str) -> String {
        format!("{expr} ASC NULLS FIRST")
    }

    fn render_literal(&self, value: &Value) -> String {
        ansi_literal(value)
    }
}

/// Standard SQL literal; arrays render as a comma list for `IN (...)`.
pub(crate) fn ansi_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Array(items) => items.iter().map(ansi_literal).collect::<Vec<_>>().join(", "),
        Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
    }
}

/// Hour buckets fall back to days on date-only columns.
pub(crate) fn effective(granularity: Granularity, precision: TimePrecision) -> Granularity {
    crate::schema::TimeSpec {
        granularity,
        precision,
    }
    .effective_granularity()
}

/// Name-keyed grammar lookup, injected into the engine.
#[derive(Clone, Default)]
pub struct GrammarRegistry {
    grammars: HashMap<String, Arc<dyn Grammar>>,
}

impl GrammarRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// postgres, duckdb, sqlite, mysql; mariadb shares the mysql instance.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("postgres", Arc::new(PostgresGrammar));
        registry.register("duckdb", Arc::new(DuckDbGrammar));
        registry.register("sqlite", Arc::new(SqliteGrammar));
        let mysql: Arc<dyn Grammar> = Arc::new(MySqlGrammar);
        registry.register("mysql", mysql.clone());
        registry.register("mariadb", mysql);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, grammar: Arc<dyn Grammar>) {
        self.grammars.insert(name.into().to_ascii_lowercase(), grammar);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Grammar>> {
        self.grammars.get(&name.to_ascii_lowercase()).cloned()
    }
}
