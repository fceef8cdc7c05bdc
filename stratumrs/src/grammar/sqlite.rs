use crate::schema::{Granularity, TimePrecision};

use super::{effective, Grammar};

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteGrammar;

impl Grammar for SqliteGrammar {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn format_time_bucket(
        &self,
        column: &str,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> String {
        match effective(granularity, precision) {
            Granularity::Hour => format!("strftime('%Y-%m-%d %H:00:00', {column})"),
            Granularity::Day => format!("strftime('%Y-%m-%d', {column})"),
            // 'weekday 0' moves to the next Sunday (or stays), six days back is Monday.
            Granularity::Week => format!("date({column}, 'weekday 0', '-6 days')"),
            Granularity::Month => format!("strftime('%Y-%m', {column})"),
            Granularity::Year => format!("strftime('%Y', {column})"),
        }
    }

    fn null_safe_eq(&self, left: &str, right: &str) -> String {
        format!("{left} IS {right}")
    }
}
