//! Immutable description of sources, relations and dimensions.
//!
//! The registry builds these once; planning and execution only read them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::value::{compare_values, ScalarKey};

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub name: String,
    /// Host/provider tag, informational only.
    pub provider: Option<String>,
    /// Connection name; sources are joinable only when these match exactly.
    pub connection: String,
    /// Physical table name.
    pub table: String,
    /// Primary key columns. Supports composite keys.
    pub primary_keys: Vec<String>,
    /// Optional column catalog. When empty, column references are not checked.
    pub columns: Vec<String>,
    pub relations: BTreeMap<String, Relation>,
    pub dimensions: BTreeMap<String, Dimension>,
    pub description: Option<String>,
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Raw {
            name: String,
            #[serde(default)]
            provider: Option<String>,
            connection: String,
            #[serde(default)]
            table: Option<String>,
            #[serde(default)]
            primary_key: Option<String>,
            #[serde(default)]
            primary_keys: Option<Vec<String>>,
            #[serde(default)]
            columns: Vec<String>,
            #[serde(default)]
            relations: BTreeMap<String, Relation>,
            #[serde(default)]
            dimensions: BTreeMap<String, Dimension>,
            description: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let primary_keys = match (raw.primary_keys, raw.primary_key) {
            (Some(keys), _) => keys,
            (None, Some(key)) => vec![key],
            (None, None) => vec!["id".to_string()],
        };
        if primary_keys.is_empty() {
            return Err(de::Error::custom("primary_keys must not be empty"));
        }

        Ok(Source {
            table: raw.table.unwrap_or_else(|| raw.name.clone()),
            name: raw.name,
            provider: raw.provider,
            connection: raw.connection,
            primary_keys,
            columns: raw.columns,
            relations: raw.relations,
            dimensions: raw.dimensions,
            description: raw.description,
        })
    }
}

impl Source {
    /// Minimal source on `connection` whose table shares its name and whose key is `id`.
    pub fn new(name: impl Into<String>, connection: impl Into<String>) -> Self {
        let name = name.into();
        Source {
            table: name.clone(),
            name,
            provider: None,
            connection: connection.into(),
            primary_keys: vec!["id".to_string()],
            columns: Vec::new(),
            relations: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            description: None,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_primary_keys(mut self, keys: &[&str]) -> Self {
        self.primary_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    pub fn with_dimension(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        self.dimensions.insert(name.into(), dimension);
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }
}

/// Directed edge from the declaring source to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub target: String,
    #[serde(flatten)]
    pub kind: RelationKind,
    /// Set on edges the registry derived for symmetric traversal.
    #[serde(skip)]
    pub inferred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationKind {
    /// from.foreign_key = to.owner_key
    BelongsTo {
        foreign_key: String,
        #[serde(default = "default_key")]
        owner_key: String,
    },
    /// from.local_key = to.foreign_key
    HasMany {
        #[serde(default = "default_key")]
        local_key: String,
        foreign_key: String,
    },
    /// from.local_key = pivot.pivot_local_key, pivot.pivot_related_key = to.related_key
    BelongsToMany {
        pivot: String,
        pivot_local_key: String,
        pivot_related_key: String,
        #[serde(default = "default_key")]
        local_key: String,
        #[serde(default = "default_key")]
        related_key: String,
    },
    /// from.left_key = to.right_key, optionally narrowed by a predicate on target rows.
    CrossJoin {
        left_key: String,
        right_key: String,
        #[serde(default)]
        predicate: Option<JoinPredicate>,
    },
}

fn default_key() -> String {
    "id".to_string()
}

impl Relation {
    pub fn belongs_to(target: &str, foreign_key: &str, owner_key: &str) -> Self {
        Self::declared(
            target,
            RelationKind::BelongsTo {
                foreign_key: foreign_key.to_string(),
                owner_key: owner_key.to_string(),
            },
        )
    }

    pub fn has_many(target: &str, local_key: &str, foreign_key: &str) -> Self {
        Self::declared(
            target,
            RelationKind::HasMany {
                local_key: local_key.to_string(),
                foreign_key: foreign_key.to_string(),
            },
        )
    }

    pub fn belongs_to_many(
        target: &str,
        pivot: &str,
        pivot_local_key: &str,
        pivot_related_key: &str,
    ) -> Self {
        Self::declared(
            target,
            RelationKind::BelongsToMany {
                pivot: pivot.to_string(),
                pivot_local_key: pivot_local_key.to_string(),
                pivot_related_key: pivot_related_key.to_string(),
                local_key: default_key(),
                related_key: default_key(),
            },
        )
    }

    pub fn cross_join(target: &str, left_key: &str, right_key: &str) -> Self {
        Self::declared(
            target,
            RelationKind::CrossJoin {
                left_key: left_key.to_string(),
                right_key: right_key.to_string(),
                predicate: None,
            },
        )
    }

    pub fn with_predicate(mut self, predicate: JoinPredicate) -> Self {
        if let RelationKind::CrossJoin { predicate: p, .. } = &mut self.kind {
            *p = Some(predicate);
        }
        self
    }

    fn declared(target: &str, kind: RelationKind) -> Self {
        Relation {
            target: target.to_string(),
            kind,
            inferred: false,
        }
    }

    /// Equality columns as (from column, to column).
    ///
    /// Pivot relations are expanded into two edges by the registry, so they
    /// never reach a join specification.
    pub fn join_columns(&self) -> Result<(&str, &str)> {
        match &self.kind {
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
            } => Ok((foreign_key, owner_key)),
            RelationKind::HasMany {
                local_key,
                foreign_key,
            } => Ok((local_key, foreign_key)),
            RelationKind::CrossJoin {
                left_key,
                right_key,
                ..
            } => Ok((left_key, right_key)),
            RelationKind::BelongsToMany { pivot, .. } => Err(ConfigError::Invalid(format!(
                "pivot relation through {pivot} must be expanded before joining"
            ))
            .into()),
        }
    }

    pub fn predicate(&self) -> Option<&JoinPredicate> {
        match &self.kind {
            RelationKind::CrossJoin { predicate, .. } => predicate.as_ref(),
            _ => None,
        }
    }

    /// The edge walking this relation backwards, when one can be expressed.
    pub fn inverse(&self, origin: &str) -> Option<Relation> {
        let kind = match &self.kind {
            RelationKind::BelongsTo {
                foreign_key,
                owner_key,
            } => RelationKind::HasMany {
                local_key: owner_key.clone(),
                foreign_key: foreign_key.clone(),
            },
            RelationKind::HasMany {
                local_key,
                foreign_key,
            } => RelationKind::BelongsTo {
                foreign_key: foreign_key.clone(),
                owner_key: local_key.clone(),
            },
            RelationKind::CrossJoin {
                left_key,
                right_key,
                predicate: None,
            } => RelationKind::CrossJoin {
                left_key: right_key.clone(),
                right_key: left_key.clone(),
                predicate: None,
            },
            RelationKind::CrossJoin { .. } | RelationKind::BelongsToMany { .. } => return None,
        };
        Some(Relation {
            target: origin.to_string(),
            kind,
            inferred: true,
        })
    }
}

/// Extra predicate on the target rows of a cross-domain join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinPredicate {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl JoinPredicate {
    pub fn matches(&self, value: &Value) -> bool {
        self.op.compare(value, &self.value)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dimension {
    pub column: String,
    pub filters: DimensionFilters,
    pub time: Option<TimeSpec>,
    pub description: Option<String>,
}

impl<'de> Deserialize<'de> for Dimension {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(Dimension::column(s)),
            other => {
                #[derive(Deserialize)]
                #[serde(deny_unknown_fields)]
                struct Full {
                    column: String,
                    #[serde(default)]
                    only: Option<Vec<Value>>,
                    #[serde(default)]
                    except: Option<Vec<Value>>,
                    #[serde(default, rename = "where")]
                    where_clause: Option<WhereClause>,
                    #[serde(default)]
                    granularity: Option<Granularity>,
                    #[serde(default)]
                    precision: Option<TimePrecision>,
                    description: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                let time = match (full.granularity, full.precision) {
                    (None, None) => None,
                    (granularity, precision) => Some(TimeSpec {
                        granularity: granularity.unwrap_or(Granularity::Day),
                        precision: precision.unwrap_or(TimePrecision::Timestamp),
                    }),
                };
                Ok(Dimension {
                    column: full.column,
                    filters: DimensionFilters {
                        only: full.only,
                        except: full.except,
                        where_clause: full.where_clause,
                    },
                    time,
                    description: full.description,
                })
            }
        }
    }
}

impl Dimension {
    pub fn column(column: impl Into<String>) -> Self {
        Dimension {
            column: column.into(),
            filters: DimensionFilters::default(),
            time: None,
            description: None,
        }
    }

    pub fn time(
        column: impl Into<String>,
        granularity: Granularity,
        precision: TimePrecision,
    ) -> Self {
        Dimension {
            time: Some(TimeSpec {
                granularity,
                precision,
            }),
            ..Dimension::column(column)
        }
    }

    pub fn with_filters(mut self, filters: DimensionFilters) -> Self {
        self.filters = filters;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub granularity: Granularity,
    pub precision: TimePrecision,
}

impl TimeSpec {
    /// Date-only columns cannot be bucketed finer than a day.
    pub fn effective_granularity(&self) -> Granularity {
        match (self.granularity, self.precision) {
            (Granularity::Hour, TimePrecision::Date) => Granularity::Day,
            (g, _) => g,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePrecision {
    Timestamp,
    Date,
}

/// Filter set as declared on a dimension or in a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionFilters {
    #[serde(default)]
    pub only: Option<Vec<Value>>,
    #[serde(default)]
    pub except: Option<Vec<Value>>,
    #[serde(default, rename = "where")]
    pub where_clause: Option<WhereClause>,
}

impl DimensionFilters {
    pub fn is_empty(&self) -> bool {
        self.only.is_none() && self.except.is_none() && self.where_clause.is_none()
    }

    pub fn to_filters(&self) -> Vec<DimensionFilter> {
        let mut out = Vec::new();
        if let Some(values) = &self.only {
            out.push(DimensionFilter::Only(values.clone()));
        }
        if let Some(values) = &self.except {
            out.push(DimensionFilter::Except(values.clone()));
        }
        if let Some(clause) = &self.where_clause {
            out.push(DimensionFilter::Where(clause.clone()));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhereClause {
    pub op: FilterOp,
    pub value: Value,
}

/// One normalized filter on a dimension value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DimensionFilter {
    Only(Vec<Value>),
    Except(Vec<Value>),
    Where(WhereClause),
}

impl DimensionFilter {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            DimensionFilter::Only(values) => contains_value(values, value),
            DimensionFilter::Except(values) => !contains_value(values, value),
            DimensionFilter::Where(clause) => clause.op.compare(value, &clause.value),
        }
    }
}

fn contains_value(values: &[Value], value: &Value) -> bool {
    let key = ScalarKey::from_value(value);
    values.iter().any(|v| ScalarKey::from_value(v) == key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
}

impl FilterOp {
    /// SQL-style comparison: anything compared with null is false.
    pub fn compare(&self, left: &Value, right: &Value) -> bool {
        if left.is_null() || right.is_null() {
            return false;
        }
        let ord = compare_values(left, right);
        match self {
            FilterOp::Eq => ord.is_eq(),
            FilterOp::Neq => ord.is_ne(),
            FilterOp::Gt => ord.is_gt(),
            FilterOp::Gte => ord.is_ge(),
            FilterOp::Lt => ord.is_lt(),
            FilterOp::Lte => ord.is_le(),
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Neq => "<>",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_source_yaml() {
        let yaml = r#"
name: orders
connection: main
primary_key: id
relations:
  items:
    target: order_items
    kind: has_many
    foreign_key: order_id
dimensions:
  status: status
  created:
    column: created_at
    granularity: month
    precision: date
  country:
    column: country
    except: ["XX"]
"#;
        let source: Source = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.table, "orders");
        assert_eq!(source.primary_keys, vec!["id"]);
        let items = &source.relations["items"];
        assert_eq!(items.target, "order_items");
        assert_eq!(items.join_columns().unwrap(), ("id", "order_id"));
        let created = &source.dimensions["created"];
        assert_eq!(
            created.time,
            Some(TimeSpec {
                granularity: Granularity::Month,
                precision: TimePrecision::Date
            })
        );
        assert_eq!(source.dimensions["status"].column, "status");
        assert_eq!(
            source.dimensions["country"].filters.except,
            Some(vec![json!("XX")])
        );
    }

    #[test]
    fn inverse_swaps_keys() {
        let rel = Relation::has_many("order_items", "id", "order_id");
        let inverse = rel.inverse("orders").unwrap();
        assert_eq!(inverse.target, "orders");
        assert!(inverse.inferred);
        assert_eq!(inverse.join_columns().unwrap(), ("order_id", "id"));
    }

    #[test]
    fn filters_follow_sql_null_semantics() {
        let only = DimensionFilter::Only(vec![json!("US"), json!("CA")]);
        assert!(only.matches(&json!("US")));
        assert!(!only.matches(&json!("DE")));
        let gt = DimensionFilter::Where(WhereClause {
            op: FilterOp::Gt,
            value: json!(10),
        });
        assert!(gt.matches(&json!(11.5)));
        assert!(!gt.matches(&Value::Null));
    }
}
