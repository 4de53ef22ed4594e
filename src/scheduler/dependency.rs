use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::primitives::TwoWaySetMap;
use crate::types::{ClientId, ComputationId, ComputationPriority};

/// Which computations changed priority during an [`update`]
/// (`ComputationDependencyGraph::update`) pass.
#[derive(Debug, Default, Clone)]
pub struct UpdateReport {
    /// Changed computations marked local to this machine.
    pub local_changed: BTreeSet<ComputationId>,
    /// Every computation whose priority changed.
    pub all_changed: BTreeSet<ComputationId>,
}

/// Tracks client priorities and dependency edges between computations, and
/// propagates priority through the graph.
///
/// Mutations accumulate into a dirty set; `update` reconverges to the fixed
/// point where every stored priority equals its recomputed value. When a
/// pass makes no progress twice running, the remaining dirty set is an
/// unresolvable cycle and every member is marked circular.
#[derive(Default)]
pub struct ComputationDependencyGraph {
    /// computation -> computations it depends on (any kind)
    dependencies: TwoWaySetMap<ComputationId, ComputationId>,
    dirty_priorities: BTreeSet<ComputationId>,
    dirty_split_priorities: BTreeSet<ComputationId>,
    orphaned_splits: BTreeSet<ComputationId>,
    orphaned_local_splits: BTreeSet<ComputationId>,
    client_priorities: BTreeMap<(ClientId, ComputationId), ComputationPriority>,
    client_to_roots: TwoWaySetMap<ClientId, ComputationId>,
    all_priorities: BTreeMap<ComputationId, ComputationPriority>,
    root_to_root: TwoWaySetMap<ComputationId, ComputationId>,
    root_to_split: TwoWaySetMap<ComputationId, ComputationId>,
    local_computations: BTreeSet<ComputationId>,
}

impl ComputationDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_computation_in_list(&mut self, id: &ComputationId) {
        if id.is_root() {
            return;
        }
        if !self.root_to_split.has_value(id) {
            self.root_to_split
                .insert(id.root_computation(), id.clone());
            self.dirty_split_priorities.insert(id.clone());
        }
    }

    /// Sets (or, with a null priority, clears) one client's priority on a
    /// root computation.
    pub fn set_client_priority(
        &mut self,
        id: &ComputationId,
        client: ClientId,
        priority: ComputationPriority,
    ) {
        assert!(id.is_root(), "client priorities attach to roots");

        if priority.is_null() {
            self.client_to_roots.drop(&client, id);
            self.client_priorities.remove(&(client, id.clone()));
        } else {
            self.client_to_roots.insert(client, id.clone());
            self.client_priorities.insert((client, id.clone()), priority);
        }

        self.dirty_priorities.insert(id.clone());
    }

    /// Drops every priority a client has expressed.
    pub fn drop_client(&mut self, client: ClientId) {
        let roots: Vec<ComputationId> = self
            .client_to_roots
            .values_for(&client)
            .iter()
            .cloned()
            .collect();
        for root in roots {
            self.dirty_priorities.insert(root.clone());
            self.client_priorities.remove(&(client, root));
        }
        self.client_to_roots.drop_key(&client);
    }

    /// Adds a root-to-root dependency edge; returns whether it was new.
    pub fn add_root_to_root_dependency(
        &mut self,
        source: ComputationId,
        dest: ComputationId,
    ) -> bool {
        assert!(source.is_root() && dest.is_root(), "edge endpoints are roots");

        if self.root_to_root.contains(&source, &dest) {
            return false;
        }
        self.root_to_root.insert(source, dest.clone());
        self.dirty_priorities.insert(dest);
        true
    }

    /// Replaces the full downtree dependency set of `id`. A former
    /// dependency losing its last incoming edge becomes an orphaned split
    /// (tracked separately when local).
    pub fn set_dependencies(&mut self, id: &ComputationId, dependencies: BTreeSet<ComputationId>) {
        self.ensure_computation_in_list(id);

        let current = self.dependencies.values_for(id).clone();
        if current == dependencies {
            return;
        }

        for dropped in current.difference(&dependencies) {
            if !dropped.is_root() && self.dependencies.keys_for(dropped).len() == 1 {
                self.orphaned_splits.insert(dropped.clone());
                if self.local_computations.contains(dropped) {
                    self.orphaned_local_splits.insert(dropped.clone());
                }
            }
        }

        for dependency in &dependencies {
            self.ensure_computation_in_list(dependency);
        }
        for dependency in &dependencies {
            self.orphaned_splits.remove(dependency);
            self.orphaned_local_splits.remove(dependency);
        }

        self.dependencies.update(id.clone(), dependencies);
    }

    pub fn is_local_computation(&self, id: &ComputationId) -> bool {
        self.local_computations.contains(id)
    }

    pub fn mark_computation_local(&mut self, id: &ComputationId) {
        self.local_computations.insert(id.clone());
        self.ensure_computation_in_list(id);

        if !id.is_root() && self.orphaned_splits.contains(id) {
            self.orphaned_local_splits.insert(id.clone());
        }
    }

    pub fn mark_computation_nonlocal(&mut self, id: &ComputationId) {
        self.orphaned_local_splits.remove(id);
        self.local_computations.remove(id);
    }

    /// Forgets a computation entirely.
    pub fn drop_computation(&mut self, id: &ComputationId) {
        if id.is_root() {
            for child in self.root_to_root.values_for(id).clone() {
                self.dirty_priorities.insert(child);
            }
            for split in self.root_to_split.values_for(id).clone() {
                self.dirty_split_priorities.insert(split);
            }
        }

        self.all_priorities.remove(id);
        self.local_computations.remove(id);
        self.dependencies.drop_value(id);
        self.dependencies.drop_key(id);
        self.root_to_split.drop_value(id);
        self.root_to_split.drop_key(id);
        self.dirty_split_priorities.remove(id);
        self.orphaned_local_splits.remove(id);
        self.orphaned_splits.remove(id);

        self.root_to_root.drop_value(id);
        self.root_to_root.drop_key(id);
    }

    /// Reconverges priorities and reports what changed. Outside readers see
    /// a consistent snapshot between calls.
    pub fn update(&mut self) -> UpdateReport {
        let mut report = UpdateReport::default();
        let mut passes_where_set_is_stable = 0usize;

        while !self.dirty_priorities.is_empty() {
            let mut new_dirty: BTreeSet<ComputationId> = BTreeSet::new();
            let mut to_check = self.dirty_priorities.clone();

            while let Some(id) = to_check.iter().next().cloned() {
                to_check.remove(&id);
                debug_assert!(id.is_root());

                let new_priority = self.compute_priority_for(&id);
                if Some(&new_priority) != self.all_priorities.get(&id) {
                    self.all_priorities.insert(id.clone(), new_priority);

                    new_dirty.insert(id.clone());
                    for child in self.root_to_root.values_for(&id).clone() {
                        if new_dirty.insert(child.clone()) {
                            to_check.insert(child);
                        }
                    }

                    self.record_changed(&id, &mut report);
                }
            }

            if self.dirty_priorities != new_dirty {
                self.dirty_priorities = new_dirty;
                passes_where_set_is_stable = 0;
            } else {
                passes_where_set_is_stable += 1;
                if passes_where_set_is_stable > 1 {
                    // this subset is circular
                    let members: Vec<ComputationId> =
                        self.dirty_priorities.iter().cloned().collect();
                    for id in members {
                        let circular = self
                            .all_priorities
                            .get(&id)
                            .cloned()
                            .unwrap_or_default()
                            .make_circular();
                        self.all_priorities.insert(id.clone(), circular);
                        self.record_changed(&id, &mut report);
                    }
                    self.dirty_priorities.clear();
                }
            }
        }

        // account splits of every root whose priority moved
        for root in report.all_changed.clone() {
            for split in self.root_to_split.values_for(&root).clone() {
                self.dirty_split_priorities.insert(split);
            }
        }

        for split in std::mem::take(&mut self.dirty_split_priorities) {
            let new_priority = self.compute_priority_for(&split);
            if Some(&new_priority) != self.all_priorities.get(&split) {
                self.all_priorities.insert(split.clone(), new_priority);
                self.record_changed(&split, &mut report);
            }
        }

        report
    }

    fn record_changed(&self, id: &ComputationId, report: &mut UpdateReport) {
        report.all_changed.insert(id.clone());
        if self.local_computations.contains(id) {
            report.local_changed.insert(id.clone());
        }
    }

    fn compute_priority_for(&self, id: &ComputationId) -> ComputationPriority {
        if id.is_split() {
            return self
                .compute_priority_for(&id.root_computation())
                .priority_for_split_computation(id.tree_depth());
        }

        let mut priority = ComputationPriority::null();

        for client in self.client_to_roots.keys_for(id) {
            if let Some(client_priority) = self.client_priorities.get(&(*client, id.clone())) {
                let candidate = client_priority.priority_for_dependent_computation();
                if priority.is_shallower_than(&candidate) {
                    priority = candidate;
                }
            }
        }

        for parent in self.root_to_root.keys_for(id) {
            let candidate = self
                .priority_for(parent)
                .priority_for_dependent_computation();
            if priority.is_shallower_than(&candidate) {
                priority = candidate;
            }
        }

        priority
    }

    /// The stored priority of `id` (null when untracked).
    pub fn priority_for(&self, id: &ComputationId) -> ComputationPriority {
        self.all_priorities.get(id).cloned().unwrap_or_default()
    }

    /// The stored priority when `id` is local, null otherwise.
    pub fn local_priority_for(&self, id: &ComputationId) -> ComputationPriority {
        if !self.local_computations.contains(id) {
            return ComputationPriority::null();
        }
        self.priority_for(id)
    }

    pub fn client_priorities(
        &self,
    ) -> &BTreeMap<(ClientId, ComputationId), ComputationPriority> {
        &self.client_priorities
    }

    pub fn all_priorities(&self) -> &BTreeMap<ComputationId, ComputationPriority> {
        &self.all_priorities
    }

    /// Computations with a dependency edge onto `id`.
    pub fn computations_depending_on(&self, id: &ComputationId) -> &BTreeSet<ComputationId> {
        self.dependencies.keys_for(id)
    }

    pub fn local_computations_depending_on(&self, id: &ComputationId) -> BTreeSet<ComputationId> {
        self.computations_depending_on(id)
            .iter()
            .filter(|candidate| self.local_computations.contains(*candidate))
            .cloned()
            .collect()
    }

    /// Clients holding a live priority on `id`.
    pub fn clients_requesting(&self, id: &ComputationId) -> BTreeSet<ClientId> {
        self.client_to_roots.keys_for(id).clone()
    }

    pub fn local_computations(&self) -> &BTreeSet<ComputationId> {
        &self.local_computations
    }

    pub fn dependencies(&self) -> &TwoWaySetMap<ComputationId, ComputationId> {
        &self.dependencies
    }

    pub fn root_to_root_dependencies(&self) -> &TwoWaySetMap<ComputationId, ComputationId> {
        &self.root_to_root
    }

    /// Local splits that lost their last incoming edge. A garbage-collection
    /// hint, not a correctness obligation.
    pub fn orphaned_local_split_computations(&self) -> &BTreeSet<ComputationId> {
        &self.orphaned_local_splits
    }

    pub fn clear_orphans(&mut self) {
        self.orphaned_local_splits.clear();
        self.orphaned_splits.clear();
    }

    /// Diagnostic check: every stored priority matches its recomputation.
    pub fn check_internal_state(&self) -> bool {
        assert!(self.dirty_priorities.is_empty());
        let mut valid = true;

        for (id, stored) in &self.all_priorities {
            let fresh = self.compute_priority_for(id);
            if *stored != fresh {
                warn!(
                    ?id,
                    ?stored,
                    ?fresh,
                    "stored priority diverges from recomputation"
                );
                valid = false;
            }
        }

        for (id, _) in self.root_to_root.keys_to_values() {
            if !self.all_priorities.contains_key(id) && !self.compute_priority_for(id).is_null() {
                warn!(?id, "computation has dependencies but no stored priority");
                valid = false;
            }
        }

        valid
    }
}
