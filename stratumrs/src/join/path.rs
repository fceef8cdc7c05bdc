use std::collections::{HashSet, VecDeque};

use crate::registry::SchemaRegistry;

use super::JoinSpecification;

/// Breadth-first search over the relation graph.
pub struct JoinPathFinder<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> JoinPathFinder<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Shortest path (by hop count) from `from` to `to`.
    ///
    /// `Some(vec![])` when both are the same source; `None` when either is
    /// unknown, the connections differ, or no path exists.
    pub fn find(&self, from: &str, to: &str) -> Option<Vec<JoinSpecification>> {
        if from == to {
            return Some(Vec::new());
        }
        let start = self.registry.source(from)?;
        let goal = self.registry.source(to)?;
        if start.connection != goal.connection {
            tracing::debug!(from, to, "sources live on different connections");
            return None;
        }

        let mut visited: HashSet<&str> = HashSet::from([start.name.as_str()]);
        let mut queue: VecDeque<(&str, Vec<JoinSpecification>)> = VecDeque::new();
        queue.push_back((start.name.as_str(), Vec::new()));

        while let Some((current, path)) = queue.pop_front() {
            let Some(source) = self.registry.source(current) else {
                continue;
            };
            for (name, relation) in &source.relations {
                let Some(target) = self.registry.source(&relation.target) else {
                    continue;
                };
                if target.connection != start.connection || visited.contains(target.name.as_str()) {
                    continue;
                }
                let mut next = path.clone();
                next.push(JoinSpecification::new(current, &target.name, name, relation.clone()));
                if target.name == to {
                    return Some(next);
                }
                visited.insert(target.name.as_str());
                queue.push_back((target.name.as_str(), next));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Relation, Source};

    fn chain() -> SchemaRegistry {
        // a -> b -> c -> d, plus a shortcut a -> d
        let sources = vec![
            Source::new("a", "main")
                .with_relation("to_b", Relation::belongs_to("b", "b_id", "id"))
                .with_relation("to_d", Relation::belongs_to("d", "d_id", "id")),
            Source::new("b", "main").with_relation("to_c", Relation::belongs_to("c", "c_id", "id")),
            Source::new("c", "main").with_relation("to_d", Relation::belongs_to("d", "d_id", "id")),
            Source::new("d", "main"),
            Source::new("e", "other"),
        ];
        SchemaRegistry::from_parts(sources, vec![]).unwrap()
    }

    #[test]
    fn same_source_is_empty_path() {
        let registry = chain();
        assert_eq!(JoinPathFinder::new(&registry).find("a", "a"), Some(vec![]));
    }

    #[test]
    fn prefers_fewest_hops() {
        let registry = chain();
        let path = JoinPathFinder::new(&registry).find("a", "d").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].relation_name, "to_d");
    }

    #[test]
    fn walks_inferred_edges_backwards() {
        let registry = chain();
        let path = JoinPathFinder::new(&registry).find("c", "b").unwrap();
        assert_eq!(path.len(), 1);
        assert!(path[0].relation.inferred);
        assert_eq!(path[0].columns().unwrap(), ("id", "c_id"));
    }

    #[test]
    fn different_connections_have_no_path() {
        let registry = chain();
        assert_eq!(JoinPathFinder::new(&registry).find("a", "e"), None);
        assert_eq!(JoinPathFinder::new(&registry).find("a", "missing"), None);
    }
}
