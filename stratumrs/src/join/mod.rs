//! Join discovery: shortest relation paths and the greedy multi-source graph.

use serde::Serialize;

use crate::error::Result;
use crate::schema::{JoinPredicate, Relation};

mod graph;
mod path;

pub use graph::JoinGraphBuilder;
pub use path::JoinPathFinder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
}

/// One edge of a join: `from` is already part of the join, `to` is brought in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinSpecification {
    pub from: String,
    pub to: String,
    pub relation_name: String,
    pub relation: Relation,
    pub join_type: JoinType,
}

impl JoinSpecification {
    pub fn new(from: &str, to: &str, relation_name: &str, relation: Relation) -> Self {
        JoinSpecification {
            from: from.to_string(),
            to: to.to_string(),
            relation_name: relation_name.to_string(),
            relation,
            join_type: JoinType::Inner,
        }
    }

    /// (from column, to column) equality pair.
    pub fn columns(&self) -> Result<(&str, &str)> {
        self.relation.join_columns()
    }

    pub fn predicate(&self) -> Option<&JoinPredicate> {
        self.relation.predicate()
    }
}

/// Ordered join edges plus the sources they connect.
///
/// Edges are unique per (from, to) and ordered so every edge's `from` is
/// connected before it is applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JoinPlan {
    pub specs: Vec<JoinSpecification>,
    pub sources: Vec<String>,
}

impl JoinPlan {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn connects(&self, source: &str) -> bool {
        self.sources.iter().any(|s| s == source)
    }

    pub(crate) fn contains_edge(&self, from: &str, to: &str) -> bool {
        self.specs.iter().any(|s| s.from == from && s.to == to)
    }

    /// Requested sources the plan failed to connect, in input order.
    pub fn missing<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .filter(|s| !self.connects(s))
            .map(String::as_str)
            .collect()
    }
}
