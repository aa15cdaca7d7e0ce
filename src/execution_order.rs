//! Evaluation order for block instances.
//!
//! Kahn's algorithm over the instance graph induced by connections. The
//! result is complete and deterministic for every input, including graphs
//! with feedback loops: instances caught in a cycle are appended after the
//! ordered part and read stale (previous-tick) values from each other.

use std::collections::{HashMap, VecDeque};

use crate::state::{BlockInstance, Connection, InstanceId};

/// Compute the order in which instances run during a tick.
///
/// For every connection `A -> B` with both endpoints present and `A != B`,
/// `A` precedes `B` unless the two share a cycle. Self-loops and edges to
/// unknown instances are ignored. Every instance id appears exactly once.
pub fn execution_order(instances: &[BlockInstance], connections: &[Connection]) -> Vec<InstanceId> {
    let n = instances.len();
    if n == 0 {
        return Vec::new();
    }

    let index: HashMap<&str, usize> = instances
        .iter()
        .enumerate()
        .map(|(i, inst)| (inst.id.as_str(), i))
        .collect();

    // Count incoming edges and collect dependents
    let mut in_degree = vec![0usize; n];
    let mut out_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for conn in connections {
        let (Some(&src), Some(&dst)) = (
            index.get(conn.from_instance_id.as_str()),
            index.get(conn.to_instance_id.as_str()),
        ) else {
            continue;
        };
        if src == dst {
            continue;
        }
        out_edges[src].push(dst);
        in_degree[dst] += 1;
    }

    // Start with instances that have no inputs (sources), in storage order
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    let mut result = Vec::with_capacity(n);
    let mut placed = vec![false; n];

    while let Some(idx) = queue.pop_front() {
        placed[idx] = true;
        result.push(instances[idx].id.clone());

        for &dependent in &out_edges[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    // Whatever is left sits on (or behind) a cycle. Run it anyway.
    if result.len() < n {
        log::debug!(
            "execution order: {} of {} instances are in a cycle",
            n - result.len(),
            n
        );
        for (i, inst) in instances.iter().enumerate() {
            if !placed[i] {
                result.push(inst.id.clone());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn instances(ids: &[&str]) -> Vec<BlockInstance> {
        ids.iter().map(|id| BlockInstance::new(*id, "test")).collect()
    }

    fn edge(from: &str, to: &str) -> Connection {
        Connection::new(format!("{from}->{to}"), from, "out", to, "in")
    }

    fn position(order: &[InstanceId], id: &str) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn test_empty_graph() {
        assert!(execution_order(&[], &[]).is_empty());
    }

    #[test]
    fn test_chain_is_ordered_regardless_of_storage_order() {
        let insts = instances(&["c", "b", "a"]);
        let conns = vec![edge("a", "b"), edge("b", "c")];
        assert_eq!(execution_order(&insts, &conns), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_loop_is_ignored() {
        let insts = instances(&["b", "a"]);
        let conns = vec![edge("a", "a"), edge("a", "b")];
        let order = execution_order(&insts, &conns);
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_three_cycle_still_complete() {
        let insts = instances(&["a", "b", "c"]);
        let conns = vec![edge("a", "b"), edge("b", "c"), edge("c", "a")];
        let mut order = execution_order(&insts, &conns);
        order.sort();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_does_not_disturb_acyclic_prefix() {
        let insts = instances(&["x", "y", "src"]);
        let conns = vec![edge("src", "x"), edge("x", "y"), edge("y", "x")];
        let order = execution_order(&insts, &conns);
        assert_eq!(order[0], "src");
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_edges_to_unknown_instances_are_ignored() {
        let insts = instances(&["a", "b"]);
        let conns = vec![edge("ghost", "a"), edge("b", "ghost"), edge("a", "b")];
        assert_eq!(execution_order(&insts, &conns), vec!["a", "b"]);
    }

    #[test]
    fn test_idempotent() {
        let insts = instances(&["d", "c", "b", "a"]);
        let conns = vec![edge("a", "c"), edge("b", "c"), edge("c", "d")];
        let first = execution_order(&insts, &conns);
        let second = execution_order(&insts, &conns);
        assert_eq!(first, second);
    }

    fn numbered(n: usize) -> Vec<BlockInstance> {
        // Stored in reverse so storage order never matches dependency order
        (0..n)
            .rev()
            .map(|i| BlockInstance::new(format!("n{i}"), "test"))
            .collect()
    }

    proptest! {
        /// Edges always point from a lower to a higher number, so the graph
        /// is acyclic and every edge must be respected.
        #[test]
        fn prop_acyclic_edges_respected(
            n in 1usize..16,
            raw in prop::collection::vec((0usize..16, 0usize..16), 0..48),
        ) {
            let insts = numbered(n);
            let conns: Vec<Connection> = raw
                .iter()
                .map(|&(a, b)| {
                    let (a, b) = (a % n, b % n);
                    let (lo, hi) = (a.min(b), a.max(b));
                    edge(&format!("n{lo}"), &format!("n{hi}"))
                })
                .collect();

            let order = execution_order(&insts, &conns);
            prop_assert_eq!(order.len(), n);
            for c in &conns {
                if c.from_instance_id != c.to_instance_id {
                    prop_assert!(
                        position(&order, &c.from_instance_id) < position(&order, &c.to_instance_id)
                    );
                }
            }
        }

        /// Arbitrary edges (cycles allowed): every id appears exactly once.
        #[test]
        fn prop_every_instance_exactly_once(
            n in 1usize..16,
            raw in prop::collection::vec((0usize..16, 0usize..16), 0..48),
        ) {
            let insts = numbered(n);
            let conns: Vec<Connection> = raw
                .iter()
                .map(|&(a, b)| edge(&format!("n{}", a % n), &format!("n{}", b % n)))
                .collect();

            let mut order = execution_order(&insts, &conns);
            order.sort();
            let mut expected: Vec<InstanceId> = insts.iter().map(|i| i.id.clone()).collect();
            expected.sort();
            prop_assert_eq!(order, expected);
        }
    }
}
