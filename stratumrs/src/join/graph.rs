use crate::registry::SchemaRegistry;

use super::{JoinPathFinder, JoinPlan};

/// Greedy union of shortest paths from already-connected sources.
///
/// Not a minimal Steiner tree: each target is attached through the first
/// connected source (in connection order) that reaches it.
pub struct JoinGraphBuilder<'a> {
    finder: JoinPathFinder<'a>,
}

impl<'a> JoinGraphBuilder<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            finder: JoinPathFinder::new(registry),
        }
    }

    pub fn build(&self, sources: &[String]) -> JoinPlan {
        let mut plan = JoinPlan::default();
        let Some(seed) = sources.first() else {
            return plan;
        };
        plan.sources.push(seed.clone());

        for target in sources.iter().skip(1) {
            if plan.connects(target) {
                continue;
            }
            let found = plan
                .sources
                .iter()
                .find_map(|connected| self.finder.find(connected, target));
            let Some(path) = found else {
                tracing::debug!(target = %target, "no join path from connected sources");
                continue;
            };
            for spec in path {
                if plan.contains_edge(&spec.from, &spec.to) {
                    continue;
                }
                if !plan.connects(&spec.to) {
                    plan.sources.push(spec.to.clone());
                }
                plan.specs.push(spec);
            }
            if !plan.connects(target) {
                plan.sources.push(target.clone());
            }
        }
        plan
    }
}
