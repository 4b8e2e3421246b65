//! In-memory dependency graph mirroring the `task_dependencies` table.
//!
//! The durable store is the source of truth for resolution state; this graph
//! exists so handlers can answer "what becomes ready if task X completes"
//! without a database round trip per edge, and so cycles are rejected before
//! they are ever persisted.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// A dependency edge would close a cycle back to an ancestor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("adding dependency {depends_on} -> {task_id} would create a cycle")]
pub struct CycleError {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A directed acyclic graph of task dependencies.
///
/// `edges[task_id]` holds the set of task IDs that `task_id` depends on;
/// `dependents[task_id]` is the reverse index.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<Uuid, HashSet<Uuid>>,
    dependents: HashMap<Uuid, HashSet<Uuid>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with no dependencies yet, so it shows up in
    /// `dependencies_of`/`dependents_of` even before any edge touches it.
    pub fn add_node(&mut self, task_id: Uuid) {
        self.edges.entry(task_id).or_default();
        self.dependents.entry(task_id).or_default();
    }

    /// Add a dependency edge: `task_id` depends on `depends_on`.
    ///
    /// Rejects the edge with [`CycleError`] if `depends_on` is already
    /// (transitively) a dependent of `task_id`, i.e. the edge would close a
    /// cycle.
    pub fn add_edge(&mut self, task_id: Uuid, depends_on: Uuid) -> Result<(), CycleError> {
        if task_id == depends_on || self.reaches(depends_on, task_id) {
            return Err(CycleError {
                task_id,
                depends_on,
            });
        }

        self.add_node(task_id);
        self.add_node(depends_on);
        self.edges.get_mut(&task_id).unwrap().insert(depends_on);
        self.dependents
            .get_mut(&depends_on)
            .unwrap()
            .insert(task_id);
        Ok(())
    }

    /// Whether `from` can reach `to` by following dependency edges forward
    /// (i.e. `to` is a dependency of `from`, directly or transitively).
    fn reaches(&self, from: Uuid, to: Uuid) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(deps) = self.edges.get(&node) {
                stack.extend(deps.iter().copied());
            }
        }
        false
    }

    pub fn dependencies_of(&self, task_id: Uuid) -> Vec<Uuid> {
        self.edges
            .get(&task_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, task_id: Uuid) -> Vec<Uuid> {
        self.dependents
            .get(&task_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a task and all edges touching it, e.g. once it has reached a
    /// terminal state and its dependents have been notified.
    pub fn remove_node(&mut self, task_id: Uuid) {
        if let Some(deps) = self.edges.remove(&task_id) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(&task_id);
                }
            }
        }
        if let Some(dependents) = self.dependents.remove(&task_id) {
            for dependent in dependents {
                if let Some(set) = self.edges.get_mut(&dependent) {
                    set.remove(&task_id);
                }
            }
        }
    }

    /// Topologically sort a subset of tasks (e.g. the tasks in a single
    /// delegation batch) restricted to edges within that subset. Returns
    /// `None` if the subset contains a cycle (should be unreachable given
    /// `add_edge`'s guard, but checked defensively here since callers may
    /// pass an externally-constructed task list).
    pub fn topological_sort(&self, tasks: &[Uuid]) -> Option<Vec<Uuid>> {
        let set: HashSet<Uuid> = tasks.iter().copied().collect();
        let mut in_degree: HashMap<Uuid, usize> = tasks.iter().map(|id| (*id, 0)).collect();

        for &task_id in tasks {
            for dep in self.dependencies_of(task_id) {
                if set.contains(&dep) {
                    *in_degree.get_mut(&task_id).unwrap() += 1;
                }
            }
        }

        let mut ready: std::collections::VecDeque<Uuid> = tasks
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(tasks.len());

        while let Some(task_id) = ready.pop_front() {
            sorted.push(task_id);
            for dependent in self.dependents_of(task_id) {
                if let Some(count) = in_degree.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        (sorted.len() == tasks.len()).then_some(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn add_edge_tracks_both_directions() {
        let mut graph = DependencyGraph::new();
        let a = id();
        let b = id();
        graph.add_edge(b, a).unwrap();

        assert_eq!(graph.dependencies_of(b), vec![a]);
        assert_eq!(graph.dependents_of(a), vec![b]);
    }

    #[test]
    fn rejects_direct_cycle() {
        let mut graph = DependencyGraph::new();
        let a = id();
        let err = graph.add_edge(a, a).unwrap_err();
        assert_eq!(err.task_id, a);
    }

    #[test]
    fn rejects_transitive_cycle() {
        let mut graph = DependencyGraph::new();
        let a = id();
        let b = id();
        let c = id();
        graph.add_edge(b, a).unwrap(); // b depends on a
        graph.add_edge(c, b).unwrap(); // c depends on b
        assert!(graph.add_edge(a, c).is_err()); // a depends on c would close the loop
    }

    #[test]
    fn remove_node_cleans_up_edges() {
        let mut graph = DependencyGraph::new();
        let a = id();
        let b = id();
        graph.add_edge(b, a).unwrap();
        graph.remove_node(a);

        assert!(graph.dependencies_of(b).is_empty());
    }

    #[test]
    fn topological_sort_orders_dependencies_first() {
        let mut graph = DependencyGraph::new();
        let a = id();
        let b = id();
        let c = id();
        graph.add_edge(b, a).unwrap();
        graph.add_edge(c, b).unwrap();

        let sorted = graph.topological_sort(&[c, b, a]).unwrap();
        let pos = |id: Uuid| sorted.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }
}
