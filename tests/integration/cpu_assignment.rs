#![allow(missing_docs)]

use std::sync::Arc;

use nimbus::primitives::{CallbackScheduler, Queue};
use nimbus::scheduler::{
    ComputationSystemwideCpuAssignment, CpuAssignmentDependencyGraph,
    RootComputationComputeStatusChanged, RootToRootDependencyCreated,
};
use nimbus::types::{ComputationId, MachineId};

fn id(n: u64) -> ComputationId {
    ComputationId::for_testing(n)
}

fn machine(n: u64) -> MachineId {
    MachineId::for_testing(n)
}

fn build() -> (Arc<CallbackScheduler>, CpuAssignmentDependencyGraph) {
    let scheduler = CallbackScheduler::new("cpu-assignment-test", 1);
    let graph = CpuAssignmentDependencyGraph::new(Arc::clone(&scheduler));
    (scheduler, graph)
}

#[test]
fn chain_attribution_appears_and_disappears() {
    let (scheduler, graph) = build();
    for m in 1..=3 {
        graph.add_machine(machine(m));
    }

    // roots 1 <- 2 <- 3 <- 4: each parent depends on the next-lower root
    graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(id(2), id(1)));
    graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(id(3), id(2)));
    graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(id(4), id(3)));
    graph.update_dependency_graph();

    for n in 1..=4 {
        assert_eq!(graph.current_assignment(&id(n)).cpus_assigned(), 0);
    }

    graph.handle_root_computation_compute_status_changed(
        RootComputationComputeStatusChanged::new(machine(1), id(1), 1, 0),
    );
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    let root = graph.current_assignment(&id(1));
    assert_eq!(root.direct_cpus(), 1);
    assert_eq!(root.child_cpus(), 0);
    for n in 2..=4 {
        let assignment = graph.current_assignment(&id(n));
        assert_eq!(assignment.direct_cpus(), 0, "root {n}");
        assert_eq!(assignment.child_cpus(), 1, "root {n}");
    }

    graph.handle_root_computation_compute_status_changed(
        RootComputationComputeStatusChanged::new(machine(1), id(1), 0, 0),
    );
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    for n in 1..=4 {
        assert_eq!(graph.current_assignment(&id(n)).cpus_assigned(), 0, "root {n}");
    }
}

#[test]
fn broadcasts_fire_once_per_change_for_marked_roots() {
    let (scheduler, graph) = build();
    graph.add_machine(machine(1));

    let sink: Arc<Queue<ComputationSystemwideCpuAssignment>> = Arc::new(Queue::new());
    let receiver = Arc::clone(&sink);
    graph
        .on_cpu_assignment_changed()
        .subscribe_forever(move |event| receiver.write(event));

    graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(id(2), id(1)));
    graph.mark_root_computation(&id(2));
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    let first = sink.get();
    assert_eq!(first.computation, id(2));
    assert_eq!(first.cpus_assigned(), 0);
    assert!(sink.is_empty());

    graph.handle_root_computation_compute_status_changed(
        RootComputationComputeStatusChanged::new(machine(1), id(1), 1, 0),
    );
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    let second = sink.get();
    assert_eq!(second.cpus_assigned(), 1);
    assert_eq!(second.cpus_by_child.get(&id(1)), Some(&1));
    assert!(sink.is_empty());

    // an update with no input change republishes nothing
    graph.update_dependency_graph();
    scheduler.block_until_idle();
    assert!(sink.is_empty());
}

#[test]
fn no_root_ever_counts_more_than_the_machines_report() {
    let (scheduler, graph) = build();
    for m in 1..=3 {
        graph.add_machine(machine(m));
    }

    // a tree: 5 fans out to 3 and 4, which own one leaf each
    for (parent, child) in [(5, 3), (5, 4), (3, 1), (4, 2)] {
        graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(
            id(parent),
            id(child),
        ));
    }

    let reports = [
        (machine(1), id(1), 2u32),
        (machine(2), id(1), 1),
        (machine(2), id(2), 3),
        (machine(3), id(3), 1),
    ];
    let mut total_reported = 0;
    for (machine, root, cpus) in reports {
        total_reported += cpus;
        graph.handle_root_computation_compute_status_changed(
            RootComputationComputeStatusChanged::new(machine, root, cpus, 0),
        );
    }
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    for n in 1..=5 {
        let assigned = graph.current_assignment(&id(n)).cpus_assigned();
        assert!(
            assigned <= total_reported,
            "root {n} claims {assigned} of {total_reported} reported cpus"
        );
    }
    assert_eq!(graph.current_assignment(&id(1)).direct_cpus(), 3);
    assert_eq!(graph.current_assignment(&id(3)).cpus_assigned(), 4);
    assert_eq!(graph.current_assignment(&id(4)).cpus_assigned(), 3);
    // the apex of the tree accounts for every reported cpu exactly once
    assert_eq!(graph.current_assignment(&id(5)).cpus_assigned(), total_reported);
}

#[test]
fn machine_drop_cascades_through_the_tree() {
    let (scheduler, graph) = build();
    graph.add_machine(machine(1));
    graph.add_machine(machine(2));

    graph.handle_root_to_root_dependency_created(RootToRootDependencyCreated::new(id(2), id(1)));
    graph.handle_root_computation_compute_status_changed(
        RootComputationComputeStatusChanged::new(machine(1), id(1), 2, 0),
    );
    graph.handle_root_computation_compute_status_changed(
        RootComputationComputeStatusChanged::new(machine(2), id(1), 1, 0),
    );
    graph.update_dependency_graph();
    scheduler.block_until_idle();
    assert_eq!(graph.current_assignment(&id(2)).cpus_assigned(), 3);

    graph.drop_machine(machine(1));
    graph.update_dependency_graph();
    scheduler.block_until_idle();

    assert_eq!(graph.current_assignment(&id(1)).direct_cpus(), 1);
    assert_eq!(graph.current_assignment(&id(2)).cpus_assigned(), 1);
}
