#![allow(missing_docs)]

use std::collections::BTreeSet;

use nimbus::scheduler::ComputationDependencyGraph;
use nimbus::types::{ClientId, ComputationId, ComputationPriority};

fn id(n: u64) -> ComputationId {
    ComputationId::for_testing(n)
}

fn depends_on(graph: &mut ComputationDependencyGraph, parent: u64, child: u64) {
    let mut deps = BTreeSet::new();
    deps.insert(id(child));
    graph.set_dependencies(&id(parent), deps);
    graph.add_root_to_root_dependency(id(parent), id(child));
}

#[test]
fn chain_propagates_one_client_priority_everywhere() {
    let mut graph = ComputationDependencyGraph::new();
    depends_on(&mut graph, 4, 3);
    depends_on(&mut graph, 3, 2);
    depends_on(&mut graph, 2, 1);

    graph.set_client_priority(&id(4), ClientId::for_testing(0), ComputationPriority::at_level(1));
    graph.update();

    for n in 1..=4 {
        let priority = graph.priority_for(&id(n));
        assert_eq!(priority.level(), Some(1), "root {n}");
        assert!(!priority.is_circular(), "root {n}");
    }

    // property: every root's priority dominates its parents' conferred ones
    for (parent, child) in [(4, 3), (3, 2), (2, 1)] {
        let conferred = graph
            .priority_for(&id(parent))
            .priority_for_dependent_computation();
        let actual = graph.priority_for(&id(child));
        assert!(
            !actual.is_shallower_than(&conferred),
            "root {child} under parent {parent}"
        );
    }
}

#[test]
fn closing_the_loop_marks_every_root_circular() {
    let mut graph = ComputationDependencyGraph::new();
    depends_on(&mut graph, 4, 3);
    depends_on(&mut graph, 3, 2);
    depends_on(&mut graph, 2, 1);
    graph.set_client_priority(&id(4), ClientId::for_testing(0), ComputationPriority::at_level(1));
    graph.update();

    depends_on(&mut graph, 1, 4);
    graph.update();

    for n in 1..=4 {
        let priority = graph.priority_for(&id(n));
        assert!(priority.is_circular(), "root {n}");
        assert_eq!(priority.level(), Some(1), "root {n}");
    }
}

#[test]
fn circular_roots_recover_when_the_edge_is_dropped() {
    let mut graph = ComputationDependencyGraph::new();
    depends_on(&mut graph, 1, 2);
    depends_on(&mut graph, 2, 1);
    graph.set_client_priority(&id(1), ClientId::for_testing(0), ComputationPriority::at_level(2));
    graph.update();
    assert!(graph.priority_for(&id(2)).is_circular());

    graph.drop_computation(&id(2));
    graph.update();

    let root = graph.priority_for(&id(1));
    assert_eq!(root.level(), Some(2));
    assert!(graph.priority_for(&id(2)).is_null());
}

#[test]
fn priorities_converge_to_the_recomputed_fixed_point() {
    let mut graph = ComputationDependencyGraph::new();

    // a diamond with a tail: 1 -> {2, 3} -> 4 -> 5
    for (parent, child) in [(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)] {
        graph.add_root_to_root_dependency(id(parent), id(child));
    }
    graph.set_client_priority(&id(1), ClientId::for_testing(0), ComputationPriority::at_level(7));
    graph.update();

    assert!(graph.check_internal_state());
    for n in 1..=5 {
        assert_eq!(graph.priority_for(&id(n)).level(), Some(7), "root {n}");
    }
    // the tail is derived through the deepest path
    assert!(graph
        .priority_for(&id(1))
        .is_shallower_than(&graph.priority_for(&id(5))));
}

#[test]
fn splits_follow_their_root_through_updates() {
    let mut graph = ComputationDependencyGraph::new();
    let root = id(1);
    let split = root.split_child(0);
    let client = ClientId::for_testing(0);

    graph.set_dependencies(&root, [split.clone()].into_iter().collect());
    graph.set_client_priority(&root, client, ComputationPriority::at_level(1));
    graph.update();
    assert_eq!(graph.priority_for(&split).level(), Some(1));

    graph.set_client_priority(&root, client, ComputationPriority::at_level(9));
    graph.update();
    let split_priority = graph.priority_for(&split);
    assert_eq!(split_priority.level(), Some(9));
    assert_eq!(split_priority.split_depth(), Some(1));

    graph.set_client_priority(&root, client, ComputationPriority::null());
    graph.update();
    assert!(graph.priority_for(&split).is_null());
}
