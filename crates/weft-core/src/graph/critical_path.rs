//! Depth and critical path.
//!
//! Both walk the graph leaves-first (Kahn's algorithm over the reverse
//! edges), so nothing recurses. Nodes on a cycle are never released by the
//! walk; callers must confirm acyclicity with `detect_cycles` before trusting
//! a critical path.

use std::collections::VecDeque;

use crate::domain::TaskId;

use super::DependencyGraph;

/// Longest known chain from a node down to a leaf.
#[derive(Debug, Clone, Copy, Default)]
struct Chain {
    /// Sum of `estimated_duration` of every task after this node.
    weight: u64,
    /// Number of tasks on the chain, this node included.
    len: usize,
    next: Option<usize>,
}

impl DependencyGraph<'_> {
    /// Nodes in an order where every node comes after all of its dependents.
    ///
    /// `include` filters the node set; edges to excluded nodes are ignored.
    fn leaves_first(&self, include: &dyn Fn(usize) -> bool) -> Vec<usize> {
        let mut remaining: Vec<usize> = (0..self.len())
            .map(|n| {
                self.dependents_of(n)
                    .iter()
                    .filter(|&&d| include(d))
                    .count()
            })
            .collect();

        let mut queue: VecDeque<usize> = (0..self.len())
            .filter(|&n| include(n) && remaining[n] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &dep in self.dependencies_of(node) {
                if !include(dep) {
                    continue;
                }
                remaining[dep] -= 1;
                if remaining[dep] == 0 {
                    queue.push_back(dep);
                }
            }
        }
        order
    }

    /// Height of each node: edges on the longest chain of dependents below it.
    ///
    /// Leaves are 0. Nodes on a cycle stay 0.
    pub fn depths(&self) -> Vec<usize> {
        let mut depth = vec![0usize; self.len()];
        for node in self.leaves_first(&|_| true) {
            depth[node] = self
                .dependents_of(node)
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        depth
    }

    /// Longest duration-weighted chain from a root to a leaf.
    ///
    /// The weight of an edge is the downstream task's `estimated_duration`
    /// (0 when absent). Ties go to the longer chain, then to the earlier
    /// task in snapshot order. Tasks with unresolved dependencies are left
    /// out entirely.
    ///
    /// Only meaningful on an acyclic graph.
    pub fn critical_path(&self) -> Vec<TaskId> {
        let valid = |n: usize| !self.has_missing_dependencies(n);
        let mut best = vec![Chain::default(); self.len()];

        for node in self.leaves_first(&valid) {
            let mut chain = Chain {
                weight: 0,
                len: 1,
                next: None,
            };
            for &dep in self.dependents_of(node) {
                if !valid(dep) {
                    continue;
                }
                let duration = self.task(dep).estimated_duration.unwrap_or(0);
                let candidate = Chain {
                    weight: duration.saturating_add(best[dep].weight),
                    len: best[dep].len + 1,
                    next: Some(dep),
                };
                if (candidate.weight, candidate.len) > (chain.weight, chain.len) {
                    chain = candidate;
                }
            }
            best[node] = chain;
        }

        let root = (0..self.len())
            .filter(|&n| valid(n) && self.dependencies_of(n).is_empty())
            .filter(|&n| best[n].len > 0)
            .fold(None, |acc: Option<usize>, n| match acc {
                Some(a) if (best[a].weight, best[a].len) >= (best[n].weight, best[n].len) => {
                    Some(a)
                }
                _ => Some(n),
            });

        let mut path = Vec::new();
        let mut cursor = root;
        while let Some(node) = cursor {
            path.push(self.task(node).id);
            cursor = best[node].next;
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{task, tid};

    fn with_duration(mut t: crate::domain::Task, minutes: u64) -> crate::domain::Task {
        t.estimated_duration = Some(minutes);
        t
    }

    #[test]
    fn empty_graph_has_empty_critical_path() {
        assert!(DependencyGraph::new(&[]).critical_path().is_empty());
    }

    #[test]
    fn single_task_is_its_own_critical_path() {
        let tasks = vec![task(1, &[])];
        assert_eq!(DependencyGraph::new(&tasks).critical_path(), vec![tid(1)]);
    }

    #[test]
    fn critical_path_follows_heaviest_branch() {
        // A -> B(10) -> D(1)
        // A -> C(30) -> D(1)
        let tasks = vec![
            with_duration(task(1, &[]), 5),
            with_duration(task(2, &[1]), 10),
            with_duration(task(3, &[1]), 30),
            with_duration(task(4, &[2, 3]), 1),
        ];
        assert_eq!(
            DependencyGraph::new(&tasks).critical_path(),
            vec![tid(1), tid(3), tid(4)]
        );
    }

    #[test]
    fn critical_path_compares_across_roots() {
        // root 1 -> 2(5); root 3 -> 4(50)
        let tasks = vec![
            task(1, &[]),
            with_duration(task(2, &[1]), 5),
            task(3, &[]),
            with_duration(task(4, &[3]), 50),
        ];
        assert_eq!(
            DependencyGraph::new(&tasks).critical_path(),
            vec![tid(3), tid(4)]
        );
    }

    #[test]
    fn zero_durations_prefer_the_longer_chain() {
        let tasks = vec![task(1, &[]), task(2, &[]), task(3, &[2]), task(4, &[3])];
        assert_eq!(
            DependencyGraph::new(&tasks).critical_path(),
            vec![tid(2), tid(3), tid(4)]
        );
    }

    #[test]
    fn tasks_with_unknown_dependencies_are_left_out() {
        let tasks = vec![
            task(1, &[]),
            with_duration(task(2, &[1, 99]), 100),
            with_duration(task(3, &[1]), 1),
        ];
        assert_eq!(
            DependencyGraph::new(&tasks).critical_path(),
            vec![tid(1), tid(3)]
        );
    }

    #[test]
    fn depth_counts_levels_of_dependents() {
        // 1 <- 2 <- 4, 1 <- 3
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1]), task(4, &[2])];
        assert_eq!(DependencyGraph::new(&tasks).depths(), vec![2, 1, 0, 0]);
    }
}
