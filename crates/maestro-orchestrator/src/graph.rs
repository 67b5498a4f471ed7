//! Dependency graph over the sub-tasks of a plan.
//!
//! Construction runs Kahn's algorithm, so a successfully built graph is a
//! proof that the plan admits a topological order.

use crate::types::SubTask;
use maestro_core::{GraphReason, MaestroError, MaestroResult};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Validated dependency DAG of a plan's sub-tasks.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    order: Vec<Uuid>,
    dependencies: HashMap<Uuid, Vec<Uuid>>,
    dependents: HashMap<Uuid, Vec<Uuid>>,
    weights: HashMap<Uuid, f64>,
}

impl TaskGraph {
    /// Build the graph, rejecting unknown dependencies and cycles.
    ///
    /// Ties in the topological order follow the input order, which keeps
    /// plans deterministic.
    pub fn build(subtasks: &[SubTask]) -> MaestroResult<Self> {
        let position: HashMap<Uuid, usize> = subtasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();

        let mut dependencies: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();

        for task in subtasks {
            let mut deps = Vec::with_capacity(task.dependencies.len());
            for dep in &task.dependencies {
                if *dep == task.id {
                    return Err(MaestroError::Graph(GraphReason::CycleDetected));
                }
                if !position.contains_key(dep) {
                    return Err(MaestroError::Graph(GraphReason::UnknownDependency));
                }
                if !deps.contains(dep) {
                    deps.push(*dep);
                    dependents.entry(*dep).or_default().push(task.id);
                }
            }
            in_degree.insert(task.id, deps.len());
            dependencies.insert(task.id, deps);
        }

        let mut queue: VecDeque<Uuid> = subtasks
            .iter()
            .filter(|t| in_degree.get(&t.id) == Some(&0))
            .map(|t| t.id)
            .collect();
        let mut order = Vec::with_capacity(subtasks.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            let mut released = Vec::new();
            for next in dependents.get(&id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg -= 1;
                    if *deg == 0 {
                        released.push(*next);
                    }
                }
            }
            released.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            queue.extend(released);
        }

        if order.len() != subtasks.len() {
            return Err(MaestroError::Graph(GraphReason::CycleDetected));
        }

        let weights = subtasks.iter().map(|t| (t.id, t.estimated_hours)).collect();
        Ok(Self {
            order,
            dependencies,
            dependents,
            weights,
        })
    }

    /// Sub-task ids in dependency order.
    pub fn topological_order(&self) -> &[Uuid] {
        &self.order
    }

    /// Number of sub-tasks.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no sub-tasks.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: Uuid) -> &[Uuid] {
        self.dependencies.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Sub-tasks that directly depend on `id`.
    pub fn dependents_of(&self, id: Uuid) -> &[Uuid] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every node that transitively depends on `id`, in topological order.
    pub fn downstream_of(&self, id: Uuid) -> Vec<Uuid> {
        let mut reached = HashSet::new();
        let mut frontier = vec![id];
        while let Some(node) = frontier.pop() {
            for next in self.dependents_of(node) {
                if reached.insert(*next) {
                    frontier.push(*next);
                }
            }
        }
        self.order
            .iter()
            .filter(|n| reached.contains(*n))
            .copied()
            .collect()
    }

    /// Nodes with no dependencies.
    pub fn roots(&self) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.dependencies_of(**id).is_empty())
            .copied()
            .collect()
    }

    /// Longest weighted path through the graph and its length in hours.
    pub fn critical_path(&self) -> (Vec<Uuid>, f64) {
        let mut dist: HashMap<Uuid, f64> = HashMap::with_capacity(self.order.len());
        let mut prev: HashMap<Uuid, Uuid> = HashMap::new();

        for id in &self.order {
            let mut best: Option<(Uuid, f64)> = None;
            for dep in self.dependencies_of(*id) {
                let d = dist.get(dep).copied().unwrap_or(0.0);
                if best.map_or(true, |(_, b)| d > b) {
                    best = Some((*dep, d));
                }
            }
            let weight = self.weights.get(id).copied().unwrap_or(0.0);
            let total = weight + best.map_or(0.0, |(_, d)| d);
            if let Some((dep, _)) = best {
                prev.insert(*id, dep);
            }
            dist.insert(*id, total);
        }

        let mut end: Option<(Uuid, f64)> = None;
        for id in &self.order {
            let d = dist.get(id).copied().unwrap_or(0.0);
            if end.map_or(true, |(_, best)| d > best) {
                end = Some((*id, d));
            }
        }

        let Some((mut cursor, length)) = end else {
            return (Vec::new(), 0.0);
        };
        let mut path = vec![cursor];
        while let Some(p) = prev.get(&cursor) {
            path.push(*p);
            cursor = *p;
        }
        path.reverse();
        (path, length)
    }
}
