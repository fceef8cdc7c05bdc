use crate::schema::{Granularity, TimePrecision};

use super::{effective, Grammar};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbGrammar;

impl Grammar for DuckDbGrammar {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn format_time_bucket(
        &self,
        column: &str,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> String {
        let cast = match precision {
            TimePrecision::Timestamp => format!("CAST({column} AS TIMESTAMP)"),
            TimePrecision::Date => format!("CAST({column} AS DATE)"),
        };
        match effective(granularity, precision) {
            Granularity::Hour => {
                format!("strftime(date_trunc('hour', {cast}), '%Y-%m-%d %H:00:00')")
            }
            Granularity::Day => format!("strftime({cast}, '%Y-%m-%d')"),
            Granularity::Week => format!("strftime(date_trunc('week', {cast}), '%Y-%m-%d')"),
            Granularity::Month => format!("strftime({cast}, '%Y-%m')"),
            Granularity::Year => format!("strftime({cast}, '%Y')"),
        }
    }
}
