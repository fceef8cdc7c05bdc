//! Join engine for backends that cannot join, or sources on separate fetches.
//!
//! Every source is fetched independently (pre-aggregated to its own
//! dimensions and join keys), then the rows are hash-joined, filtered and
//! re-aggregated here. Results match what a native inner join would return.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::aggregate::Accumulator;
use crate::backend::ConnectionManager;
use crate::error::{Result, StratumError};
use crate::join::JoinSpecification;
use crate::plan::{key_alias, row_id_alias, MergeSpec, Partial, SoftwareJoinPlan};
use crate::value::{key_tuple, Row, ScalarKey};

pub struct SoftwareJoinExecutor<'a> {
    connections: &'a ConnectionManager,
    max_concurrent_fetches: usize,
}

impl<'a> SoftwareJoinExecutor<'a> {
    pub fn new(connections: &'a ConnectionManager, max_concurrent_fetches: usize) -> Self {
        Self {
            connections,
            max_concurrent_fetches: max_concurrent_fetches.max(1),
        }
    }

    pub async fn execute(&self, plan: &SoftwareJoinPlan) -> Result<Vec<Row>> {
        let start = Instant::now();
        let mut fetched = self.fetch_all(plan).await?;

        let base = plan
            .joins
            .sources
            .first()
            .or_else(|| plan.fetches.first().map(|f| &f.source))
            .ok_or_else(|| StratumError::execution("", "software join has no sources"))?;
        let mut rows = fetched.remove(base).unwrap_or_default();
        let mut joined: HashSet<&str> = HashSet::from([base.as_str()]);

        for spec in &plan.joins.specs {
            let targets = fetched.get(&spec.to).map(Vec::as_slice).unwrap_or_default();
            rows = if joined.contains(spec.to.as_str()) {
                filter_edge(rows, spec)?
            } else {
                hash_join(rows, targets, spec)?
            };
            joined.insert(spec.to.as_str());
        }
        let joined_rows = rows.len();

        rows.retain(|row| {
            plan.filters.iter().all(|f| {
                f.filter
                    .matches(row.get(&f.alias).unwrap_or(&Value::Null))
            })
        });

        let output = aggregate(&rows, &plan.group_by, &plan.merges);
        tracing::debug!(
            sources = plan.fetches.len(),
            joined = joined_rows,
            filtered = rows.len(),
            rows = output.len(),
            ms = start.elapsed().as_millis(),
            "software join"
        );
        Ok(output)
    }

    /// Run all per-source fetches concurrently; the first failure drops the rest.
    async fn fetch_all(&self, plan: &SoftwareJoinPlan) -> Result<HashMap<String, Vec<Row>>> {
        let limiter = Semaphore::new(plan.fetches.len().clamp(1, self.max_concurrent_fetches));
        let fetches = plan.fetches.iter().map(|fetch| {
            let limiter = &limiter;
            async move {
                let backend = self.connections.require(&fetch.query.connection)?;
                let _permit = limiter.acquire().await.map_err(|e| {
                    StratumError::execution(&fetch.source, format!("fetch limiter closed: {e}"))
                })?;
                let start = Instant::now();
                let mut rows = backend.execute_query(&fetch.query).await.map_err(|e| {
                    tracing::warn!(source = %fetch.source, error = %e, "source fetch failed");
                    e
                })?;
                let id_alias = row_id_alias(&fetch.source);
                for (i, row) in rows.iter_mut().enumerate() {
                    row.insert(id_alias.clone(), Value::from(i as u64));
                }
                tracing::debug!(
                    source = %fetch.source,
                    rows = rows.len(),
                    ms = start.elapsed().as_millis(),
                    "fetched source"
                );
                Ok::<_, StratumError>((fetch.source.clone(), rows))
            }
        });
        Ok(try_join_all(fetches).await?.into_iter().collect())
    }
}

fn edge_aliases(spec: &JoinSpecification) -> Result<(String, String)> {
    let (from_col, to_col) = spec.columns()?;
    Ok((key_alias(&spec.from, from_col), key_alias(&spec.to, to_col)))
}

fn predicate_holds(spec: &JoinSpecification, target: &Row) -> bool {
    spec.predicate().map_or(true, |p| {
        p.matches(target.get(&key_alias(&spec.to, &p.column)).unwrap_or(&Value::Null))
    })
}

fn join_key(row: &Row, alias: &str) -> Option<ScalarKey> {
    row.get(alias)
        .filter(|v| !v.is_null())
        .map(ScalarKey::from_value)
}

/// Inner hash join: index `targets` by key, probe with every accumulated row.
fn hash_join(rows: Vec<Row>, targets: &[Row], spec: &JoinSpecification) -> Result<Vec<Row>> {
    let (from_alias, to_alias) = edge_aliases(spec)?;
    let mut index: HashMap<ScalarKey, Vec<&Row>> = HashMap::new();
    for target in targets {
        if !predicate_holds(spec, target) {
            continue;
        }
        if let Some(key) = join_key(target, &to_alias) {
            index.entry(key).or_default().push(target);
        }
    }

    let mut out = Vec::new();
    for row in rows {
        let Some(matches) = join_key(&row, &from_alias).and_then(|k| index.get(&k)) else {
            continue;
        };
        for target in matches {
            let mut merged = row.clone();
            merged.extend(target.iter().map(|(k, v)| (k.clone(), v.clone())));
            out.push(merged);
        }
    }
    Ok(out)
}

/// An edge into a source that is already joined only constrains rows.
fn filter_edge(mut rows: Vec<Row>, spec: &JoinSpecification) -> Result<Vec<Row>> {
    let (from_alias, to_alias) = edge_aliases(spec)?;
    rows.retain(|row| {
        let left = join_key(row, &from_alias);
        let right = join_key(row, &to_alias);
        let (Some(left), Some(right)) = (left, right) else {
            return false;
        };
        left == right && predicate_holds(spec, row)
    });
    Ok(rows)
}

struct MergeGroup {
    dimensions: Vec<Value>,
    accumulators: Vec<Accumulator>,
    seen: Vec<HashSet<ScalarKey>>,
}

/// Group by the requested dimensions and fold each source's partials once
/// per fetched sub-row, so join multiplicity never double counts.
fn aggregate(rows: &[Row], group_by: &[String], merges: &[MergeSpec]) -> Vec<Row> {
    let new_group = |dimensions: Vec<Value>| MergeGroup {
        dimensions,
        accumulators: merges.iter().map(|m| Accumulator::new(m.function)).collect(),
        seen: vec![HashSet::new(); merges.len()],
    };
    let id_aliases: Vec<String> = merges.iter().map(|m| row_id_alias(&m.source)).collect();

    let mut groups: BTreeMap<Vec<ScalarKey>, MergeGroup> = BTreeMap::new();
    for row in rows {
        let key = key_tuple(row, group_by);
        let group = groups.entry(key).or_insert_with(|| {
            new_group(
                group_by
                    .iter()
                    .map(|alias| row.get(alias).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
        });
        for (idx, merge) in merges.iter().enumerate() {
            let Some(row_id) = join_key(row, &id_aliases[idx]) else {
                continue;
            };
            if !group.seen[idx].insert(row_id) {
                continue;
            }
            let acc = &mut group.accumulators[idx];
            match &merge.partial {
                Partial::Column(alias) => acc.merge_partial(row.get(alias).unwrap_or(&Value::Null)),
                Partial::Avg { sum, count } => acc.merge_avg(
                    row.get(sum).unwrap_or(&Value::Null),
                    row.get(count).unwrap_or(&Value::Null),
                ),
            }
        }
    }

    if groups.is_empty() && group_by.is_empty() && !merges.is_empty() {
        groups.insert(Vec::new(), new_group(Vec::new()));
    }

    groups
        .into_values()
        .map(|group| {
            let mut out = Row::new();
            for (alias, value) in group_by.iter().zip(group.dimensions) {
                out.insert(alias.clone(), value);
            }
            for (merge, acc) in merges.iter().zip(&group.accumulators) {
                out.insert(merge.alias.clone(), acc.finish());
            }
            out
        })
        .collect()
}
