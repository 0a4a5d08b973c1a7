//! Cycle detection.
//!
//! This is the authoritative acyclicity check: every back-edge found is
//! reported, nothing is short-circuited on revisit.

use crate::domain::TaskId;

use super::DependencyGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

impl DependencyGraph<'_> {
    /// Find cycles with an iterative three-colour DFS over `depends_on`.
    ///
    /// Each back-edge to a gray node yields the slice of the current path
    /// from that node to the node holding the edge, in `depends_on`
    /// direction (`[a, b]` means a depends on b depends on a).
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut color = vec![Color::White; self.len()];
        let mut cycles = Vec::new();

        for start in 0..self.len() {
            if color[start] != Color::White {
                continue;
            }

            // (node, index of the next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = Color::Gray;

            while let Some(&(node, next)) = stack.last() {
                let deps = self.dependencies_of(node);
                if next == deps.len() {
                    color[node] = Color::Black;
                    stack.pop();
                    continue;
                }

                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = deps[next];
                match color[dep] {
                    Color::White => {
                        color[dep] = Color::Gray;
                        stack.push((dep, 0));
                    }
                    Color::Gray => {
                        let from = stack
                            .iter()
                            .position(|&(n, _)| n == dep)
                            .unwrap_or_default();
                        cycles.push(
                            stack[from..]
                                .iter()
                                .map(|&(n, _)| self.task(n).id)
                                .collect(),
                        );
                    }
                    Color::Black => {}
                }
            }
        }

        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::testing::{task, tid};

    #[test]
    fn detect_simple_cycle() {
        // A -> B -> A
        let tasks = vec![task(1, &[2]), task(2, &[1])];
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(graph.detect_cycles(), vec![vec![tid(1), tid(2)]]);
    }

    #[test]
    fn detect_no_cycle_in_dag() {
        // C -> B -> A
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[2])];
        assert!(DependencyGraph::new(&tasks).detect_cycles().is_empty());
    }

    #[test]
    fn detect_self_dependency() {
        let tasks = vec![task(1, &[1])];
        assert_eq!(
            DependencyGraph::new(&tasks).detect_cycles(),
            vec![vec![tid(1)]]
        );
    }

    #[test]
    fn detect_longer_cycle() {
        // B -> A, C -> B, D -> C, B -> D (cycle: B -> D -> C -> B)
        let tasks = vec![
            task(1, &[]),
            task(2, &[1, 4]),
            task(3, &[2]),
            task(4, &[3]),
        ];
        let cycles = DependencyGraph::new(&tasks).detect_cycles();

        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec![tid(2), tid(4), tid(3)]);
    }

    #[test]
    fn dag_with_diamond_should_not_detect_cycle() {
        // C -> B -> A, C -> A
        let tasks = vec![task(1, &[]), task(2, &[1]), task(3, &[1, 2])];
        assert!(DependencyGraph::new(&tasks).detect_cycles().is_empty());
    }

    #[test]
    fn complex_dag_with_multiple_paths() {
        //     A
        //    / \
        //   B   C
        //   |\ /|
        //   | X |
        //   |/ \|
        //   D   E
        let tasks = vec![
            task(1, &[]),
            task(2, &[1]),
            task(3, &[1]),
            task(4, &[2, 3]),
            task(5, &[2, 3]),
        ];
        assert!(DependencyGraph::new(&tasks).detect_cycles().is_empty());
    }

    #[test]
    fn disjoint_cycles_are_all_reported() {
        let tasks = vec![task(1, &[2]), task(2, &[1]), task(3, &[4]), task(4, &[3])];
        assert_eq!(DependencyGraph::new(&tasks).detect_cycles().len(), 2);
    }

    #[test]
    fn deep_chain_does_not_overflow_the_stack() {
        let n = 50_000u128;
        let tasks: Vec<_> = (1..=n)
            .map(|i| if i == 1 { task(i, &[]) } else { task(i, &[i - 1]) })
            .collect();
        assert!(DependencyGraph::new(&tasks).detect_cycles().is_empty());
    }
}
