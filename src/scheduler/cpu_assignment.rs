use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::primitives::graph_util::evaluation_order_partial;
use crate::primitives::{
    CallbackScheduler, ComputedProperty, DepGraph, EventBroadcaster, Mutable, TwoWaySetMap,
};
use crate::scheduler::events::{
    CheckpointStatus, CheckpointStatusUpdateMessage, ComputationIsCurrentlyCheckpointing,
    ComputationSystemwideCpuAssignment, RootComputationComputeStatusChanged,
    RootToRootDependencyCreated,
};
use crate::types::{ComputationId, MachineId};

/// One root's per-machine report cells plus the derived direct total.
///
/// `membership` bumps whenever a machine joins or leaves the row, so the
/// total re-reads the cell set as well as the cell values.
struct CpuRow {
    cells: Arc<Mutex<BTreeMap<MachineId, Mutable<u32>>>>,
    membership: Mutable<u64>,
    total: ComputedProperty<u32>,
}

/// Direct CPU spend per root, kept as reactive state: machine reports land
/// in [`Mutable`] cells and each root's total is a [`ComputedProperty`] over
/// its row. `recompute` is the first pass of `update_dependency_graph`,
/// reconverging exactly the roots whose inputs moved.
#[derive(Default)]
struct DirectCpuTracker {
    graph: DepGraph,
    rows: BTreeMap<ComputationId, CpuRow>,
}

fn bump(counter: &Mutable<u64>) {
    counter.set(counter.get_untracked() + 1);
}

impl DirectCpuTracker {
    fn row(&mut self, root: &ComputationId) -> &CpuRow {
        if !self.rows.contains_key(root) {
            let cells: Arc<Mutex<BTreeMap<MachineId, Mutable<u32>>>> =
                Arc::new(Mutex::new(BTreeMap::new()));
            let membership = Mutable::new(0u64);

            let reader_cells = Arc::clone(&cells);
            let reader_membership = membership.clone();
            let total = self.graph.bind(move |scope| {
                reader_membership.get(scope);
                reader_cells
                    .lock()
                    .values()
                    .map(|cell| cell.get(scope))
                    .sum()
            });
            // seed it dirty so the next recompute pass picks it up
            total.get_untracked();

            self.rows.insert(
                root.clone(),
                CpuRow {
                    cells,
                    membership,
                    total,
                },
            );
        }
        self.rows.get(root).expect("row just ensured")
    }

    fn set_report(&mut self, machine: MachineId, root: &ComputationId, cpus: u32) {
        let row = self.row(root);
        if cpus == 0 {
            let removed = row.cells.lock().remove(&machine).is_some();
            if removed {
                bump(&row.membership);
            }
            return;
        }

        let existing = row.cells.lock().get(&machine).cloned();
        match existing {
            Some(cell) => cell.set(cpus),
            None => {
                row.cells.lock().insert(machine, Mutable::new(cpus));
                bump(&row.membership);
            }
        }
    }

    /// Clears every report from `machine`; returns the roots it touched.
    fn drop_machine(&mut self, machine: &MachineId) -> Vec<ComputationId> {
        let mut touched = Vec::new();
        for (root, row) in &self.rows {
            let removed = row.cells.lock().remove(machine).is_some();
            if removed {
                bump(&row.membership);
                touched.push(root.clone());
            }
        }
        touched
    }

    /// Reconverges every total whose inputs changed since the last pass.
    fn recompute(&self) -> u64 {
        self.graph.recompute()
    }

    fn total(&self, root: &ComputationId) -> u32 {
        self.rows
            .get(root)
            .map(|row| row.total.get_untracked())
            .unwrap_or(0)
    }

    fn machine_breakdown(&self, root: &ComputationId) -> BTreeMap<MachineId, u32> {
        self.rows
            .get(root)
            .map(|row| {
                row.cells
                    .lock()
                    .iter()
                    .map(|(machine, cell)| (*machine, cell.get_untracked()))
                    .filter(|(_, cpus)| *cpus > 0)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct CpuState {
    machines: BTreeSet<MachineId>,
    direct: DirectCpuTracker,
    /// parent -> child dependency edges between roots
    edges: TwoWaySetMap<ComputationId, ComputationId>,
    marked_roots: BTreeSet<ComputationId>,
    checkpoint_statuses: BTreeMap<ComputationId, CheckpointStatus>,
    checkpointing: BTreeSet<ComputationId>,
    dirty: BTreeSet<ComputationId>,
    assignments: BTreeMap<ComputationId, ComputationSystemwideCpuAssignment>,
    published: BTreeMap<ComputationId, ComputationSystemwideCpuAssignment>,
}

/// Aggregates per-machine compute reports into a systemwide CPU count per
/// root computation, and broadcasts one assignment diff per changed root on
/// every `update_dependency_graph` pass.
pub struct CpuAssignmentDependencyGraph {
    state: Mutex<CpuState>,
    on_changed: EventBroadcaster<ComputationSystemwideCpuAssignment>,
}

impl CpuAssignmentDependencyGraph {
    pub fn new(scheduler: Arc<CallbackScheduler>) -> Self {
        CpuAssignmentDependencyGraph {
            state: Mutex::new(CpuState::default()),
            on_changed: EventBroadcaster::new(scheduler, "cpu-assignment"),
        }
    }

    /// The broadcaster publishing assignment changes for marked roots.
    pub fn on_cpu_assignment_changed(
        &self,
    ) -> &EventBroadcaster<ComputationSystemwideCpuAssignment> {
        &self.on_changed
    }

    pub fn add_machine(&self, machine: MachineId) {
        self.state.lock().machines.insert(machine);
    }

    /// Removes a machine; its direct CPU contributions disappear from every
    /// root immediately.
    pub fn drop_machine(&self, machine: MachineId) {
        let mut state = self.state.lock();
        state.machines.remove(&machine);
        for root in state.direct.drop_machine(&machine) {
            state.dirty.insert(root);
        }
    }

    pub fn handle_root_computation_compute_status_changed(
        &self,
        event: RootComputationComputeStatusChanged,
    ) {
        debug_assert!(event.root.is_root());
        let mut state = self.state.lock();
        trace!(
            machine = %event.machine.guid(),
            cpus = event.active_cpus,
            "cpu_assignment.compute_status"
        );
        state
            .direct
            .set_report(event.machine, &event.root, event.active_cpus);
        state.dirty.insert(event.root);
    }

    pub fn handle_root_to_root_dependency_created(&self, event: RootToRootDependencyCreated) {
        let mut state = self.state.lock();
        state
            .edges
            .insert(event.parent.clone(), event.child.clone());
        state.dirty.insert(event.parent);
        state.dirty.insert(event.child);
    }

    pub fn handle_checkpoint_status_update(&self, message: CheckpointStatusUpdateMessage) {
        let mut state = self.state.lock();
        for (root, status) in message.updates {
            let merged = state
                .checkpoint_statuses
                .get(&root)
                .map(|existing| existing.merged_with(&status))
                .unwrap_or(status);
            state.checkpoint_statuses.insert(root.clone(), merged);
            state.dirty.insert(root);
        }
    }

    pub fn handle_computation_is_currently_checkpointing(
        &self,
        event: ComputationIsCurrentlyCheckpointing,
    ) {
        let mut state = self.state.lock();
        if event.is_checkpointing {
            state.checkpointing.insert(event.computation.clone());
        } else {
            state.checkpointing.remove(&event.computation);
        }
        state.dirty.insert(event.computation);
    }

    /// Asks for assignment updates about `computation`.
    pub fn mark_root_computation(&self, computation: &ComputationId) {
        debug_assert!(computation.is_root());
        let mut state = self.state.lock();
        state.marked_roots.insert(computation.clone());
        state.dirty.insert(computation.clone());
    }

    pub fn mark_nonroot_computation(&self, computation: &ComputationId) {
        let mut state = self.state.lock();
        state.marked_roots.remove(computation);
        state.published.remove(computation);
    }

    /// The current aggregated assignment of `computation`.
    pub fn current_assignment(
        &self,
        computation: &ComputationId,
    ) -> ComputationSystemwideCpuAssignment {
        self.state
            .lock()
            .assignments
            .get(computation)
            .cloned()
            .unwrap_or_else(|| ComputationSystemwideCpuAssignment::with_no_children(computation.clone()))
    }

    /// Recomputes assignments for every root affected since the last pass
    /// and broadcasts at most one diff per marked root.
    pub fn update_dependency_graph(&self) {
        let mut to_broadcast = Vec::new();
        {
            let mut state = self.state.lock();
            let affected = affected_set(&state);
            if affected.is_empty() {
                return;
            }

            // pass 1: reconverge the reactive direct totals
            let direct_recomputed = state.direct.recompute();
            trace!(direct_recomputed, "cpu_assignment.direct_pass");

            // pass 2: children first so parent totals see fresh child
            // totals; whatever is stuck behind a cycle gets one fixed-point
            // pass and a circular tag
            let (order, cyclic) = evaluation_order_partial(&state.edges, &affected);

            for root in &order {
                let assignment = compute_assignment(&state, root, false);
                state.assignments.insert(root.clone(), assignment);
            }
            for root in &cyclic {
                let assignment = compute_assignment(&state, root, true);
                state.assignments.insert(root.clone(), assignment);
            }

            for root in &affected {
                if !state.marked_roots.contains(root) {
                    continue;
                }
                let fresh = state.assignments.get(root).cloned().expect("just computed");
                if state.published.get(root) != Some(&fresh) {
                    state.published.insert(root.clone(), fresh.clone());
                    to_broadcast.push(fresh);
                }
            }

            state.dirty.clear();
            debug!(
                affected = affected.len(),
                broadcast = to_broadcast.len(),
                "cpu_assignment.update"
            );
        }

        for assignment in to_broadcast {
            self.on_changed.broadcast(assignment);
        }
    }
}

/// The dirty roots plus everything reachable upward through the edges.
fn affected_set(state: &CpuState) -> BTreeSet<ComputationId> {
    let mut affected = state.dirty.clone();
    let mut frontier: Vec<ComputationId> = affected.iter().cloned().collect();
    while let Some(root) = frontier.pop() {
        for parent in state.edges.keys_for(&root) {
            if affected.insert(parent.clone()) {
                frontier.push(parent.clone());
            }
        }
    }
    affected
}

fn compute_assignment(
    state: &CpuState,
    root: &ComputationId,
    is_circular: bool,
) -> ComputationSystemwideCpuAssignment {
    // the reactive layer already reconverged in pass 1
    let direct_total = state.direct.total(root);
    let cpus_by_machine = state.direct.machine_breakdown(root);

    let mut cpus_by_child = BTreeMap::new();
    let mut related_roots = BTreeSet::new();
    for child in state.edges.values_for(root) {
        related_roots.insert(child.clone());
        let child_total = state
            .assignments
            .get(child)
            .map(ComputationSystemwideCpuAssignment::cpus_assigned)
            .unwrap_or(0);
        if child_total > 0 {
            cpus_by_child.insert(child.clone(), child_total);
        }
    }
    let total_cpus = direct_total + cpus_by_child.values().sum::<u32>();

    ComputationSystemwideCpuAssignment {
        computation: root.clone(),
        cpus_by_machine,
        cpus_by_child,
        total_cpus,
        checkpoint_status: state
            .checkpoint_statuses
            .get(root)
            .cloned()
            .unwrap_or_default(),
        is_circular,
        is_checkpointing: state.checkpointing.contains(root),
        related_roots,
    }
}
