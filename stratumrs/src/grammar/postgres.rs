use crate::schema::{Granularity, TimePrecision};

use super::{effective, Grammar};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresGrammar;

impl Grammar for PostgresGrammar {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn format_time_bucket(
        &self,
        column: &str,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> String {
        match effective(granularity, precision) {
            Granularity::Hour => {
                format!("to_char(date_trunc('hour', {column}), 'YYYY-MM-DD HH24:00:00')")
            }
            Granularity::Day => format!("to_char({column}, 'YYYY-MM-DD')"),
            Granularity::Week => format!("to_char(date_trunc('week', {column}), 'YYYY-MM-DD')"),
            Granularity::Month => format!("to_char({column}, 'YYYY-MM')"),
            Granularity::Year => format!("to_char({column}, 'YYYY')"),
        }
    }
}
