use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::primitives::two_way_map::TwoWaySetMap;

/// Orders `nodes` so that, for every edge `parent -> child` in `edges`, the
/// child appears before the parent. Returns `None` when the subgraph induced
/// by `nodes` contains a cycle.
pub fn evaluation_order<T: Ord + Clone>(
    edges: &TwoWaySetMap<T, T>,
    nodes: &BTreeSet<T>,
) -> Option<Vec<T>> {
    let (order, stuck) = evaluation_order_partial(edges, nodes);
    stuck.is_empty().then_some(order)
}

/// Splits `nodes` into an evaluation order (children before parents) and
/// the stuck remainder: members of a cycle, plus every node whose downtree
/// within `nodes` reaches one.
pub fn evaluation_order_partial<T: Ord + Clone>(
    edges: &TwoWaySetMap<T, T>,
    nodes: &BTreeSet<T>,
) -> (Vec<T>, BTreeSet<T>) {
    let mut remaining_children: BTreeMap<&T, usize> = BTreeMap::new();
    for node in nodes {
        let count = edges
            .values_for(node)
            .iter()
            .filter(|child| nodes.contains(child))
            .count();
        remaining_children.insert(node, count);
    }

    let mut ready: VecDeque<&T> = remaining_children
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop_front() {
        order.push(node.clone());
        for parent in edges.keys_for(node) {
            if let Some(count) = remaining_children.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(parent);
                }
            }
        }
    }

    let ordered: BTreeSet<&T> = order.iter().collect();
    let stuck = nodes
        .iter()
        .filter(|node| !ordered.contains(node))
        .cloned()
        .collect();
    (order, stuck)
}
