use crate::schema::{Granularity, TimePrecision};

use super::{ansi_literal, effective, Grammar};

/// MySQL and MariaDB.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlGrammar;

impl Grammar for MySqlGrammar {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn format_time_bucket(
        &self,
        column: &str,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> String {
        match effective(granularity, precision) {
            Granularity::Hour => format!("DATE_FORMAT({column}, '%Y-%m-%d %H:00:00')"),
            Granularity::Day => format!("DATE_FORMAT({column}, '%Y-%m-%d')"),
            Granularity::Week => {
                format!("DATE_FORMAT(DATE_SUB({column}, INTERVAL WEEKDAY({column}) DAY), '%Y-%m-%d')")
            }
            Granularity::Month => format!("DATE_FORMAT({column}, '%Y-%m')"),
            Granularity::Year => format!("DATE_FORMAT({column}, '%Y')"),
        }
    }

    fn null_safe_eq(&self, left: &str, right: &str) -> String {
        format!("{left} <=> {right}")
    }

    fn order_nulls_first(&self, expr: &str) -> String {
        // MySQL sorts nulls first on ASC and lacks NULLS FIRST.
        format!("{expr} ASC")
    }

    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => {
                format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
            }
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| self.render_literal(v))
                .collect::<Vec<_>>()
                .join(", "),
            serde_json::Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            other => ansi_literal(other),
        }
    }
}
