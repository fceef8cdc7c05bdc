//! DuckDB backend: renders plans with `DuckDbGrammar` and runs them on a
//! small connection pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use super::{Backend, Capabilities};
use crate::error::{Result, StratumError};
use crate::grammar::DuckDbGrammar;
use crate::plan::{BackendQuery, StagedBackendPlan};
use crate::render::SqlRenderer;
use crate::value::Row;

/// Rows read on the blocking pool plus the connection to return.
type Fetched = (Vec<Row>, duckdb::Connection);

#[derive(Clone)]
pub struct DuckDbBackend {
    database_path: PathBuf,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), max_concurrency = 16, "creating DuckDB backend");
        Self {
            database_path: path,
            limiter: Arc::new(Semaphore::new(16)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| StratumError::execution("duckdb", format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            tracing::trace!(pool_remaining = guard.len(), "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new DuckDB connection");
        Ok(duckdb::Connection::open(self.database_path.clone())?)
    }

    /// Run statements that return no rows (DDL, loads).
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let conn = tokio::task::spawn_blocking(move || -> Result<duckdb::Connection> {
            conn.execute_batch(&sql)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StratumError::execution("duckdb", format!("task join error: {e}")))??;
        self.pool.lock().await.push(conn);
        Ok(())
    }

    /// Run raw SQL and return rows keyed by column name.
    pub async fn execute_sql(&self, sql: &str) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let (rows, conn) = tokio::task::spawn_blocking(move || -> Result<Fetched> {
            let start = Instant::now();
            let rows = {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows_iter = stmt.query([])?;
                let stmt_ref = rows_iter
                    .as_ref()
                    .ok_or_else(|| StratumError::execution("duckdb", "statement missing"))?;
                let mut column_names = Vec::new();
                for idx in 0..stmt_ref.column_count() {
                    column_names.push(stmt_ref.column_name(idx)?.to_string());
                }
                let mut rows = Vec::new();
                while let Some(row) = rows_iter.next()? {
                    let mut map = Map::new();
                    for (idx, name) in column_names.iter().enumerate() {
                        map.insert(name.clone(), duck_value_to_json(row.get_ref(idx)?.to_owned()));
                    }
                    rows.push(map);
                }
                rows
            };
            tracing::debug!(
                rows = rows.len(),
                ms = start.elapsed().as_millis(),
                "duckdb execute_sql"
            );
            Ok((rows, conn))
        })
        .await
        .map_err(|e| StratumError::execution("duckdb", format!("task join error: {e}")))??;

        self.pool.lock().await.push(conn);
        Ok(rows)
    }
}

#[async_trait]
impl Backend for DuckDbBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::new("duckdb")
    }

    async fn execute_query(&self, query: &BackendQuery) -> Result<Vec<Row>> {
        let sql = SqlRenderer::new(&DuckDbGrammar).render_query(query)?;
        self.execute_sql(&sql).await
    }

    async fn execute_staged(&self, plan: &StagedBackendPlan) -> Result<Vec<Row>> {
        let sql = SqlRenderer::new(&DuckDbGrammar).render_staged(plan)?;
        self.execute_sql(&sql).await
    }
}

fn epoch_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)?.checked_add_signed(chrono::Duration::days(days.into()))
}

fn timestamp_string(unit: TimeUnit, t: i64) -> Option<String> {
    let micros = match unit {
        TimeUnit::Second => t.checked_mul(1_000_000)?,
        TimeUnit::Millisecond => t.checked_mul(1_000)?,
        TimeUnit::Microsecond => t,
        TimeUnit::Nanosecond => t / 1_000,
    };
    DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string())
}

fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        // SUM over integers widens to HUGEINT.
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => timestamp_string(unit, t)
            .map(Value::String)
            .unwrap_or(Value::Null),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => epoch_date(d)
            .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval { months, days, nanos } => {
            Value::String(format!("{months} months {days} days {nanos} nanos"))
        }
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duck_value_to_json).collect())
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Map(entries) => Value::Array(
            entries
                .iter()
                .map(|(k, v)| {
                    Value::Array(vec![
                        duck_value_to_json(k.clone()),
                        duck_value_to_json(v.clone()),
                    ])
                })
                .collect(),
        ),
        DuckValue::Union(inner) => duck_value_to_json(*inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AggregationFn;
    use crate::plan::{AggregateSelect, DimensionSelect, SourceRef};

    #[tokio::test]
    async fn runs_rendered_queries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DuckDbBackend::new(dir.path().join("test.duckdb")).with_max_concurrency(2);
        backend
            .execute_batch(
                "CREATE TABLE orders (id INTEGER, country VARCHAR, total INTEGER);
                 INSERT INTO orders VALUES (1, 'US', 100), (2, 'US', 50), (3, 'CA', 70);",
            )
            .await
            .unwrap();

        let query = BackendQuery {
            connection: "main".to_string(),
            tables: vec![SourceRef {
                name: "orders".to_string(),
                table: "orders".to_string(),
                primary_keys: vec!["id".to_string()],
            }],
            joins: vec![],
            dimensions: vec![DimensionSelect {
                source: "orders".to_string(),
                column: "country".to_string(),
                alias: "orders_country".to_string(),
                time: None,
                grouped: true,
            }],
            aggregations: vec![AggregateSelect {
                source: "orders".to_string(),
                column: "total".to_string(),
                function: AggregationFn::Sum,
                alias: "revenue".to_string(),
            }],
            filters: vec![],
            computed: vec![],
        };
        let rows = backend.execute_query(&query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["orders_country"], Value::from("CA"));
        assert_eq!(rows[0]["revenue"], Value::from(70));
        assert_eq!(rows[1]["revenue"], Value::from(150));
    }
}
