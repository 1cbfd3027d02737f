//! Stage ordering. Stages form a DAG over their declared dependencies and
//! run in a topological order, ties broken by declaration order.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use mirror_core::Package;
use thiserror::Error;

use crate::stages::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no stages selected")]
    Empty,
    #[error("package {0} is registered more than once")]
    Duplicate(Package),
    #[error("stage {stage} depends on unknown package {dependency}")]
    UnknownDependency { stage: Package, dependency: Package },
    #[error("stage dependencies form a cycle through {0:?}")]
    Cycle(Vec<Package>),
    #[error("no stage registered for package {0}")]
    NotRegistered(Package),
}

#[derive(Clone)]
pub struct PipelinePlan {
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for PipelinePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelinePlan")
            .field("order", &self.order())
            .finish()
    }
}

impl PipelinePlan {
    /// Full plan. Every dependency must name a registered stage.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self, PlanError> {
        let edges = stages
            .iter()
            .map(|s| (s.package(), s.depends_on().to_vec()))
            .collect::<Vec<_>>();
        let order = topo_sort(&edges)?;
        Ok(Self::ordered(stages, order))
    }

    /// Plan restricted to `selected`. Dependencies outside the selection are
    /// assumed satisfied by earlier runs and ignored.
    pub fn only(stages: Vec<Arc<dyn Stage>>, selected: &[Package]) -> Result<Self, PlanError> {
        if selected.is_empty() {
            return Err(PlanError::Empty);
        }
        for package in selected {
            if !stages.iter().any(|s| s.package() == *package) {
                return Err(PlanError::NotRegistered(*package));
            }
        }
        let kept = stages
            .into_iter()
            .filter(|s| selected.contains(&s.package()))
            .collect::<Vec<_>>();
        let edges = kept
            .iter()
            .map(|s| {
                let deps = s
                    .depends_on()
                    .iter()
                    .copied()
                    .filter(|d| selected.contains(d))
                    .collect();
                (s.package(), deps)
            })
            .collect::<Vec<_>>();
        let order = topo_sort(&edges)?;
        Ok(Self::ordered(kept, order))
    }

    fn ordered(stages: Vec<Arc<dyn Stage>>, order: Vec<usize>) -> Self {
        let stages = order
            .into_iter()
            .map(|idx| Arc::clone(&stages[idx]))
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    pub fn order(&self) -> Vec<Package> {
        self.stages.iter().map(|s| s.package()).collect()
    }
}

/// Kahn's algorithm over declaration indices.
fn topo_sort(nodes: &[(Package, Vec<Package>)]) -> Result<Vec<usize>, PlanError> {
    if nodes.is_empty() {
        return Err(PlanError::Empty);
    }
    let mut index = HashMap::with_capacity(nodes.len());
    for (idx, (package, _)) in nodes.iter().enumerate() {
        if index.insert(*package, idx).is_some() {
            return Err(PlanError::Duplicate(*package));
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents = vec![Vec::new(); nodes.len()];
    for (idx, (package, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            let Some(&dep_idx) = index.get(dep) else {
                return Err(PlanError::UnknownDependency {
                    stage: *package,
                    dependency: *dep,
                });
            };
            indegree[idx] += 1;
            dependents[dep_idx].push(idx);
        }
    }

    let mut ready = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(idx, _)| idx)
        .collect::<BTreeSet<_>>();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(idx, _)| nodes[idx].0)
            .collect();
        return Err(PlanError::Cycle(stuck));
    }
    Ok(order)
}
