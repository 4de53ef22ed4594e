use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use crate::graph::types::{AttrId, GraphValue, LocationId, LocationTypeId, NodeId};
use crate::primitives::{MapWithIndex, TwoWaySetMap};

/// An external subscription pinning one node. The graph holds it weakly;
/// dropping the last strong handle unroots the node at the next scan.
pub struct Root {
    on_changed: Box<dyn Fn()>,
}

impl Root {
    pub(crate) fn new(on_changed: impl Fn() + 'static) -> Rc<Self> {
        Rc::new(Root {
            on_changed: Box::new(on_changed),
        })
    }

    fn changed(&self) {
        (self.on_changed)();
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NodeKind {
    Mutable,
    Property,
}

/// Per-node bookkeeping of the computed graph: cached values, dependency
/// edges, `(lazy, clean, level)` ordering state, orphan sets, and root
/// subscriptions.
///
/// The node-state index orders by `((lazy, clean), level)`, so the lowest
/// entry is always the shallowest dirty non-lazy node when one exists.
#[derive(Default)]
pub(crate) struct PropertyStorage {
    values: HashMap<NodeId, GraphValue>,
    /// key depends on its values (downtree edges)
    dependencies: TwoWaySetMap<NodeId, NodeId>,
    node_state: MapWithIndex<NodeId, ((bool, bool), i32)>,
    node_kind: HashMap<NodeId, NodeKind>,
    def_lazy: HashMap<NodeId, bool>,
    dirtying: HashMap<NodeId, BTreeSet<NodeId>>,
    orphans_all: BTreeSet<NodeId>,
    orphans_nonroot: BTreeSet<NodeId>,
    orphans_nonroot_nonmutable: BTreeSet<NodeId>,
    node_roots: HashMap<NodeId, Vec<Weak<Root>>>,
    location_properties: TwoWaySetMap<LocationId, AttrId>,
    class_properties: TwoWaySetMap<LocationTypeId, NodeId>,
    mutable_accesses: HashMap<NodeId, u64>,
    empty: BTreeSet<NodeId>,
}

impl PropertyStorage {
    pub fn is_root(&self, node: NodeId) -> bool {
        self.node_roots
            .get(&node)
            .is_some_and(|roots| roots.iter().any(|root| root.strong_count() > 0))
    }

    pub fn add_root_node(&mut self, node: NodeId, root: &Rc<Root>) {
        let weak = Rc::downgrade(root);
        let roots = self.node_roots.entry(node).or_default();
        if !roots.iter().any(|existing| existing.ptr_eq(&weak)) {
            roots.push(weak);
        }
        self.orphans_nonroot.remove(&node);
        self.orphans_nonroot_nonmutable.remove(&node);
    }

    /// Drops expired root subscriptions; returns how many were dropped.
    pub fn scan_roots_and_drop(&mut self) -> usize {
        let mut dropped = 0;
        let mut newly_unrooted = Vec::new();
        self.node_roots.retain(|node, roots| {
            let before = roots.len();
            roots.retain(|root| root.strong_count() > 0);
            dropped += before - roots.len();
            if roots.is_empty() {
                newly_unrooted.push(*node);
                false
            } else {
                true
            }
        });
        for node in newly_unrooted {
            if self.orphans_all.contains(&node) {
                self.orphans_nonroot.insert(node);
                if self.node_kind.get(&node) != Some(&NodeKind::Mutable) {
                    self.orphans_nonroot_nonmutable.insert(node);
                }
            }
        }
        dropped
    }

    pub fn is_orphaned(&self, node: NodeId) -> bool {
        self.orphans_all.contains(&node)
    }

    fn mark_orphaned(&mut self, node: NodeId) {
        if self.orphans_all.insert(node) && !self.is_root(node) {
            self.orphans_nonroot.insert(node);
            if self.node_kind.get(&node) != Some(&NodeKind::Mutable) {
                self.orphans_nonroot_nonmutable.insert(node);
            }
        }
    }

    fn mark_not_orphaned(&mut self, node: NodeId) {
        self.orphans_all.remove(&node);
        self.orphans_nonroot.remove(&node);
        self.orphans_nonroot_nonmutable.remove(&node);
    }

    pub fn nonroot_nonmutable_orphans(&self) -> &BTreeSet<NodeId> {
        &self.orphans_nonroot_nonmutable
    }

    pub fn has(&self, node: NodeId) -> bool {
        self.values.contains_key(&node)
    }

    /// Reads the cached value, counting mutable accesses.
    pub fn value(&mut self, node: NodeId) -> Option<GraphValue> {
        let value = self.values.get(&node).cloned();
        if value.is_some() && self.node_kind.get(&node) == Some(&NodeKind::Mutable) {
            *self.mutable_accesses.entry(node).or_insert(0) += 1;
        }
        value
    }

    /// Reads the cached value without counting the access.
    pub fn peek_value(&self, node: NodeId) -> Option<GraphValue> {
        self.values.get(&node).cloned()
    }

    pub fn mutable_access_counts(&self) -> &HashMap<NodeId, u64> {
        &self.mutable_accesses
    }

    fn ensure_node(
        &mut self,
        node: NodeId,
        kind: NodeKind,
        def_lazy: bool,
        class_id: LocationTypeId,
    ) {
        if !self.node_state.has_key(&node) {
            self.node_state.set(node, ((def_lazy, true), 0));
            self.node_kind.insert(node, kind);
            self.def_lazy.insert(node, def_lazy);
            self.class_properties.insert(class_id, node);
        }
    }

    /// Installs a mutable's value. Mutables stay clean at level zero; the
    /// uptree is dirtied when the value changes.
    pub fn set_mutable(&mut self, node: NodeId, value: GraphValue, class_id: LocationTypeId) {
        self.ensure_node(node, NodeKind::Mutable, false, class_id);
        self.set_value_internal(node, value, BTreeSet::new(), class_id);
    }

    /// Installs a property's computed value and its new downtree edges.
    pub fn set_property(
        &mut self,
        node: NodeId,
        value: GraphValue,
        downtree: BTreeSet<NodeId>,
        def_lazy: bool,
        class_id: LocationTypeId,
    ) {
        self.ensure_node(node, NodeKind::Property, def_lazy, class_id);
        self.set_value_internal(node, value, downtree, class_id);
    }

    fn set_value_internal(
        &mut self,
        node: NodeId,
        value: GraphValue,
        downtree: BTreeSet<NodeId>,
        _class_id: LocationTypeId,
    ) {
        let existed = self.values.contains_key(&node);
        let changed = self.values.get(&node) != Some(&value);

        if !existed {
            // a fresh node starts orphaned until something depends on it
            self.mark_orphaned(node);
            self.location_properties.insert(node.0, node.1);
        }

        self.values.insert(node, value);
        self.dirtying.remove(&node);

        self.set_dependencies(node, downtree);

        self.set_clean(node, true);
        self.recompute_level(node);
        self.recompute_laziness(node);

        if changed {
            let uptree: Vec<NodeId> = self.dependencies.keys_for(&node).iter().copied().collect();
            for parent in uptree {
                self.set_clean(parent, false);
                self.dirtying.entry(parent).or_default().insert(node);
            }

            if existed {
                self.fire_roots(node);
            }
        }
    }

    fn fire_roots(&mut self, node: NodeId) {
        let Some(roots) = self.node_roots.get(&node) else {
            return;
        };
        let live: Vec<Rc<Root>> = roots.iter().filter_map(Weak::upgrade).collect();
        let had_expired = live.len() != roots.len();
        for root in &live {
            root.changed();
        }
        if had_expired {
            self.scan_roots_and_drop();
        }
    }

    pub fn set_dependencies(&mut self, node: NodeId, downtree: BTreeSet<NodeId>) {
        let old_downtree: Vec<NodeId> =
            self.dependencies.values_for(&node).iter().copied().collect();

        self.dependencies.update(node, downtree.clone());

        for child in old_downtree {
            self.recompute_laziness(child);
            if self.dependencies.keys_for(&child).is_empty() {
                self.mark_orphaned(child);
            }
        }
        for child in downtree {
            self.recompute_laziness(child);
            if !self.dependencies.keys_for(&child).is_empty() {
                self.mark_not_orphaned(child);
            }
        }
    }

    pub fn downtree(&self, node: NodeId) -> &BTreeSet<NodeId> {
        self.dependencies.values_for(&node)
    }

    pub fn uptree(&self, node: NodeId) -> &BTreeSet<NodeId> {
        self.dependencies.keys_for(&node)
    }

    pub fn nodes_dirtying(&self, node: NodeId) -> &BTreeSet<NodeId> {
        self.dirtying.get(&node).unwrap_or(&self.empty)
    }

    pub fn properties_of_location(&self, location: LocationId) -> &BTreeSet<AttrId> {
        self.location_properties.values_for(&location)
    }

    pub fn level(&self, node: NodeId) -> i32 {
        self.node_state
            .value_for(&node)
            .map(|state| state.1)
            .unwrap_or(0)
    }

    pub fn is_dirty(&self, node: NodeId) -> bool {
        self.node_state
            .value_for(&node)
            .map(|state| !state.0 .1)
            .unwrap_or(false)
    }

    pub fn is_lazy(&self, node: NodeId) -> bool {
        self.node_state
            .value_for(&node)
            .map(|state| state.0 .0)
            .unwrap_or(false)
    }

    pub fn set_clean(&mut self, node: NodeId, clean: bool) {
        let Some(&((lazy, _), level)) = self.node_state.value_for(&node) else {
            return;
        };
        self.node_state.set(node, ((lazy, clean), level));
    }

    fn set_lazy(&mut self, node: NodeId, lazy: bool) {
        let Some(&((_, clean), level)) = self.node_state.value_for(&node) else {
            return;
        };
        self.node_state.set(node, ((lazy, clean), level));
    }

    fn set_level(&mut self, node: NodeId, level: i32) {
        let Some(&(flags, _)) = self.node_state.value_for(&node) else {
            return;
        };
        self.node_state.set(node, (flags, level));
    }

    fn calc_level(&self, node: NodeId) -> i32 {
        let mut level = 0;
        for child in self.dependencies.values_for(&node) {
            level = level.max(self.level(*child) + 1);
        }
        level
    }

    /// Recomputes the node's level from its downtree; true when it rose.
    pub fn recompute_level(&mut self, node: NodeId) -> bool {
        let current = self.level(node);
        let fresh = self.calc_level(node);
        self.set_level(node, fresh);
        fresh > current
    }

    fn effective_laziness(&self, node: NodeId) -> bool {
        if self.def_lazy.get(&node).copied().unwrap_or(false) {
            return true;
        }
        if self.is_root(node) {
            return false;
        }
        // not lazy by definition and not rooted: lazy exactly when every
        // consumer is lazy (and there is at least one)
        let uptree = self.dependencies.keys_for(&node);
        !uptree.is_empty() && uptree.iter().all(|parent| self.is_lazy(*parent))
    }

    /// Recomputes effective laziness; true when it changed.
    pub fn recompute_laziness(&mut self, node: NodeId) -> bool {
        let current = self.is_lazy(node);
        let fresh = self.effective_laziness(node);
        self.set_lazy(node, fresh);
        current != fresh
    }

    /// Whether any recomputable dirty node exists.
    pub fn has_dirty(&self, include_lazy: bool) -> bool {
        let Some(&((lazy, clean), _)) = self.node_state.lowest_value() else {
            return false;
        };
        if include_lazy {
            if !clean {
                return true;
            }
            if lazy {
                return false;
            }
            // lowest is non-lazy and clean; check the lowest lazy node
            match self.node_state.first_at_or_above(&((true, false), i32::MIN)) {
                None => false,
                Some((&((is_lazy, is_clean), _), _)) => is_lazy && !is_clean,
            }
        } else {
            !lazy && !clean
        }
    }

    /// The dirty node with the lowest `((lazy, clean), level)` key.
    pub fn lowest_dirty(&self, include_lazy: bool) -> Option<NodeId> {
        if !self.has_dirty(include_lazy) {
            return None;
        }
        let (&((_, clean), _), keys) = self
            .node_state
            .first_at_or_above(&((false, false), i32::MIN))?;
        if !clean {
            return keys.iter().next().copied();
        }
        debug_assert!(include_lazy);
        let (_, keys) = self.node_state.first_at_or_above(&((true, false), i32::MIN))?;
        keys.iter().next().copied()
    }

    /// Deletes an orphaned node from every index.
    pub fn delete_orphan(&mut self, node: NodeId) {
        debug_assert!(self.is_orphaned(node));
        self.mark_not_orphaned(node);
        self.set_dependencies(node, BTreeSet::new());
        self.dependencies.drop_key(&node);

        self.values.remove(&node);
        self.node_state.drop(&node);
        self.node_kind.remove(&node);
        self.def_lazy.remove(&node);
        self.dirtying.remove(&node);
        self.mutable_accesses.remove(&node);
        self.node_roots.remove(&node);
        self.location_properties.drop(&node.0, &node.1);
        self.class_properties.drop_value(&node);
    }

    /// Marks every non-mutable property of `class_id` dirty.
    pub fn dirty_class_properties(&mut self, class_id: LocationTypeId) {
        let nodes: Vec<NodeId> = self
            .class_properties
            .values_for(&class_id)
            .iter()
            .copied()
            .collect();
        for node in nodes {
            if self.node_kind.get(&node) != Some(&NodeKind::Mutable) {
                self.set_clean(node, false);
            }
        }
    }

    /// Marks every non-mutable property in the graph dirty.
    pub fn dirty_all(&mut self) {
        let nodes: Vec<NodeId> = self
            .node_kind
            .iter()
            .filter(|(_, kind)| **kind != NodeKind::Mutable)
            .map(|(node, _)| *node)
            .collect();
        for node in nodes {
            self.set_clean(node, false);
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_state.key_count()
    }
}
