//! The incremental computed-object graph.
//!
//! Locations are typed nodes identified by their class and immutable key
//! attributes. Properties are pure functions of other graph values; the
//! graph records the dependency edges that actually arose during each
//! computation and reconverges dirty nodes lowest-level first. Dependency
//! tracking threads through the `&mut ComputedGraph` passed to every
//! property body, so there is no hidden thread-local state; the graph is
//! single-threaded and cooperatively scheduled.

mod storage;
mod types;

pub use storage::Root;
pub use types::{
    AttrId, GraphValue, LocationId, LocationTypeBuilder, LocationTypeId, NodeId, OnUpdateFn,
    PropertyFn,
};

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{NimbusError, Result};
use crate::graph::storage::PropertyStorage;
use crate::graph::types::{AttrKind, LocationType};

struct LocationData {
    type_id: LocationTypeId,
    keys: HashMap<AttrId, GraphValue>,
}

/// The graph: location types, live instances, and the property store.
#[derive(Default)]
pub struct ComputedGraph {
    types: Vec<LocationType>,
    attr_names: Vec<String>,
    attr_ids: HashMap<String, AttrId>,
    instances: HashMap<(LocationTypeId, Vec<u8>), LocationId>,
    locations: Vec<LocationData>,
    storage: PropertyStorage,
    compute_stack: Vec<BTreeSet<NodeId>>,
    in_compute: BTreeSet<NodeId>,
    root_stack: Vec<Rc<Root>>,
}

impl ComputedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern_attr(&mut self, name: &str) -> AttrId {
        if let Some(id) = self.attr_ids.get(name) {
            return *id;
        }
        let id = AttrId(self.attr_names.len() as u32);
        self.attr_names.push(name.to_string());
        self.attr_ids.insert(name.to_string(), id);
        id
    }

    pub fn attr(&self, name: &str) -> Option<AttrId> {
        self.attr_ids.get(name).copied()
    }

    pub fn attr_name(&self, attr: AttrId) -> &str {
        &self.attr_names[attr.0 as usize]
    }

    /// Registers a location type from its builder.
    pub fn register_location_type(&mut self, builder: LocationTypeBuilder) -> LocationTypeId {
        let mut attrs = std::collections::BTreeMap::new();
        let mut key_order = Vec::new();

        for key in &builder.keys {
            let id = self.intern_attr(key);
            key_order.push(id);
            attrs.insert(id, AttrKind::Key);
        }
        for (name, default, on_update) in builder.mutables {
            let id = self.intern_attr(&name);
            attrs.insert(id, AttrKind::Mutable { default, on_update });
        }
        for (name, body, lazy) in builder.properties {
            let id = self.intern_attr(&name);
            attrs.insert(id, AttrKind::Property { body, lazy });
        }
        for (name, body) in builder.functions {
            let id = self.intern_attr(&name);
            attrs.insert(id, AttrKind::Function { body });
        }
        for (name, value) in builder.class_attributes {
            let id = self.intern_attr(&name);
            attrs.insert(id, AttrKind::ClassAttribute(value));
        }
        let defers_to = builder.defers_to.map(|name| self.intern_attr(&name));

        let type_id = LocationTypeId(self.types.len() as u32);
        self.types.push(LocationType {
            name: builder.name,
            attrs,
            key_order,
            defers_to,
        });
        type_id
    }

    /// Finds or creates the location of `type_id` with the given keys.
    /// Instances are deduplicated by their key attributes.
    pub fn get_location(
        &mut self,
        type_id: LocationTypeId,
        keys: &[(&str, GraphValue)],
    ) -> Result<LocationId> {
        let location_type = self
            .types
            .get(type_id.0 as usize)
            .ok_or(NimbusError::NotFound("location type"))?;

        let mut key_map = HashMap::new();
        for (name, value) in keys {
            let id = self
                .attr_ids
                .get(*name)
                .copied()
                .ok_or(NimbusError::Invalid("unknown key attribute"))?;
            if !matches!(location_type.attrs.get(&id), Some(AttrKind::Key)) {
                return Err(NimbusError::Invalid("attribute is not a key"));
            }
            key_map.insert(id, value.clone());
        }
        if key_map.len() != location_type.key_order.len() {
            return Err(NimbusError::Invalid("wrong key set for location type"));
        }

        let mut canonical = Vec::new();
        for key in &location_type.key_order {
            canonical.extend_from_slice(&key.0.to_le_bytes());
            key_map
                .get(key)
                .ok_or(NimbusError::Invalid("missing key attribute"))?
                .write_key_bytes(&mut canonical);
        }

        if let Some(existing) = self.instances.get(&(type_id, canonical.clone())) {
            return Ok(*existing);
        }

        let location = LocationId(self.locations.len() as u64);
        self.locations.push(LocationData {
            type_id,
            keys: key_map,
        });
        self.instances.insert((type_id, canonical), location);

        // install mutable defaults
        let defaults: Vec<(AttrId, GraphValue)> = self.types[type_id.0 as usize]
            .attrs
            .iter()
            .filter_map(|(attr, kind)| match kind {
                AttrKind::Mutable {
                    default: Some(value),
                    ..
                } => Some((*attr, value.clone())),
                AttrKind::Mutable { default: None, .. } => Some((*attr, GraphValue::Nothing)),
                _ => None,
            })
            .collect();
        for (attr, value) in defaults {
            self.storage.set_mutable((location, attr), value, type_id);
        }

        debug!(
            location = location.0,
            type_name = %self.types[type_id.0 as usize].name,
            "graph.location.created"
        );
        Ok(location)
    }

    pub fn location_type_of(&self, location: LocationId) -> LocationTypeId {
        self.locations[location.0 as usize].type_id
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Reads an attribute by name.
    pub fn attribute(&mut self, location: LocationId, name: &str) -> Result<GraphValue> {
        let attr = self
            .attr_ids
            .get(name)
            .copied()
            .ok_or(NimbusError::NotFound("attribute"))?;
        self.attribute_by_id(location, attr)
    }

    /// Reads an attribute. Inside a property computation the read is
    /// recorded as a dependency edge; inside a root scope the node is
    /// rooted.
    pub fn attribute_by_id(&mut self, location: LocationId, attr: AttrId) -> Result<GraphValue> {
        let node = (location, attr);
        let type_id = self.location_type_of(location);

        if let Some(root) = self.root_stack.last() {
            let root = Rc::clone(root);
            self.storage.add_root_node(node, &root);
        }

        let kind = self.types[type_id.0 as usize].attrs.get(&attr).cloned();
        let Some(kind) = kind else {
            return self.deferred_attribute(location, attr);
        };

        match kind {
            AttrKind::ClassAttribute(value) => Ok(value),
            AttrKind::Key => Ok(self.locations[location.0 as usize]
                .keys
                .get(&attr)
                .cloned()
                .unwrap_or(GraphValue::Nothing)),
            AttrKind::Function { body } => body.as_ref()(self, location),
            AttrKind::Mutable { .. } => {
                if self.compute_stack.is_empty() && self.root_stack.is_empty() {
                    return self
                        .storage
                        .value(node)
                        .ok_or(NimbusError::NotFound("mutable value"));
                }
                if let Some(frame) = self.compute_stack.last_mut() {
                    frame.insert(node);
                }
                self.storage
                    .value(node)
                    .ok_or(NimbusError::NotFound("mutable value"))
            }
            AttrKind::Property { lazy, .. } => {
                if self.compute_stack.is_empty() && self.root_stack.is_empty() {
                    self.flush_all();
                }
                if let Some(frame) = self.compute_stack.last_mut() {
                    frame.insert(node);
                }

                if !self.storage.has(node) {
                    if lazy {
                        // first sight of a lazy property: seed it dirty
                        self.storage.set_property(
                            node,
                            GraphValue::Nothing,
                            BTreeSet::new(),
                            true,
                            type_id,
                        );
                        self.storage.set_clean(node, false);
                    } else {
                        if self.in_compute.contains(&node) {
                            if let Some(frame) = self.compute_stack.last_mut() {
                                frame.remove(&node);
                            }
                            return Err(NimbusError::CycleDetected(
                                "property reads itself while computing",
                            ));
                        }
                        self.compute_property(node)?;
                    }
                }

                self.storage
                    .value(node)
                    .ok_or(NimbusError::NotFound("property value"))
            }
        }
    }

    fn deferred_attribute(&mut self, location: LocationId, attr: AttrId) -> Result<GraphValue> {
        let type_id = self.location_type_of(location);
        let Some(defers_to) = self.types[type_id.0 as usize].defers_to else {
            return Err(NimbusError::NotFound("attribute"));
        };
        match self.attribute_by_id(location, defers_to)? {
            GraphValue::Location(target) => self.attribute_by_id(target, attr),
            _ => Err(NimbusError::Invalid(
                "defers_to property must yield a location",
            )),
        }
    }

    /// Writes a mutable attribute, dirtying dependents and firing the
    /// on-update hook when the value changes.
    pub fn set_attribute(
        &mut self,
        location: LocationId,
        name: &str,
        value: GraphValue,
    ) -> Result<()> {
        let attr = self
            .attr_ids
            .get(name)
            .copied()
            .ok_or(NimbusError::NotFound("attribute"))?;
        let node = (location, attr);
        let type_id = self.location_type_of(location);

        let kind = self.types[type_id.0 as usize]
            .attrs
            .get(&attr)
            .cloned()
            .ok_or(NimbusError::NotFound("attribute"))?;
        let AttrKind::Mutable { on_update, .. } = kind else {
            return Err(NimbusError::Rejected("attribute is not mutable"));
        };

        let old = self.storage.peek_value(node).unwrap_or(GraphValue::Nothing);
        if old == value {
            return Ok(());
        }
        self.storage.set_mutable(node, value.clone(), type_id);

        if let Some(hook) = on_update {
            hook.as_ref()(self, location, &old, &value);
        }
        Ok(())
    }

    fn compute_property(&mut self, node: NodeId) -> Result<()> {
        let (location, attr) = node;
        let type_id = self.location_type_of(location);
        let kind = self.types[type_id.0 as usize].attrs.get(&attr).cloned();
        let Some(AttrKind::Property { body, lazy }) = kind else {
            return Err(NimbusError::Invalid("node is not a cached property"));
        };

        self.compute_stack.push(BTreeSet::new());
        self.in_compute.insert(node);

        let outcome = body.as_ref()(self, location);

        let reads = self.compute_stack.pop().expect("frame pushed above");
        self.in_compute.remove(&node);

        let value = match outcome {
            Ok(value) => value,
            Err(err) => GraphValue::Error(Arc::from(err.to_string())),
        };
        self.storage.set_property(node, value, reads, lazy, type_id);
        Ok(())
    }

    /// Reconverges every dirty non-lazy node.
    pub fn flush_all(&mut self) {
        self.flush(false, None);
    }

    /// Reconverges dirty nodes including lazy ones, within `timeout`.
    pub fn flush_lazy(&mut self, timeout: Option<Duration>) {
        self.flush(true, timeout);
    }

    /// The reconvergence loop: repeatedly takes the lowest dirty node,
    /// relevels it if stale, recomputes it otherwise. When releveling spins
    /// without a compute for more than `2 * |pending| + 2` rounds, the
    /// pending set is a cycle: it is first cleared and retried, then every
    /// member is replaced with a [`GraphValue::Cycle`] sentinel.
    pub fn flush(&mut self, recompute_lazy: bool, timeout: Option<Duration>) {
        let started = Instant::now();
        let mut pending: BTreeSet<NodeId> = BTreeSet::new();
        let mut leveled_since_compute = 0usize;
        let mut cleared = false;
        let mut updates = 0u64;

        while self.storage.has_dirty(recompute_lazy) {
            if let Some(budget) = timeout {
                if started.elapsed() >= budget {
                    debug!(updates, "graph.flush.timeout");
                    break;
                }
            }
            let Some(node) = self.storage.lowest_dirty(recompute_lazy) else {
                break;
            };
            updates += 1;

            if self.storage.recompute_laziness(node) {
                // its ordering key moved; pick again
                continue;
            }
            if !self.storage.recompute_level(node) {
                let _ = self.compute_property(node);
                pending.remove(&node);
                leveled_since_compute = 0;
                continue;
            }

            if pending.insert(node) {
                leveled_since_compute = 0;
                continue;
            }

            leveled_since_compute += 1;
            if leveled_since_compute > pending.len() * 2 + 2 {
                if !cleared {
                    cleared = true;
                } else {
                    let members: Vec<NodeId> = pending.iter().copied().collect();
                    debug!(size = members.len(), "graph.flush.cycle");
                    let sentinel = GraphValue::Cycle(Arc::new(members.clone()));
                    for member in &members {
                        let type_id = self.location_type_of(member.0);
                        self.storage.set_property(
                            *member,
                            sentinel.clone(),
                            BTreeSet::new(),
                            false,
                            type_id,
                        );
                    }
                }
                pending.clear();
                leveled_since_compute = 0;
            }
        }

        if updates > 0 {
            self.storage.scan_roots_and_drop();
        }
    }

    /// Deletes every orphaned non-root non-mutable node.
    pub fn flush_orphans(&mut self) {
        while let Some(node) = self
            .storage
            .nonroot_nonmutable_orphans()
            .iter()
            .next()
            .copied()
        {
            self.storage.delete_orphan(node);
        }
    }

    /// Removes a location when nothing depends on any of its properties.
    pub fn remove_location(&mut self, location: LocationId) -> Result<()> {
        let attrs: Vec<AttrId> = self
            .storage
            .properties_of_location(location)
            .iter()
            .copied()
            .collect();
        for attr in &attrs {
            if !self.storage.uptree((location, *attr)).is_empty() {
                return Err(NimbusError::Rejected(
                    "location still has dependent properties",
                ));
            }
        }
        for attr in attrs {
            let node = (location, attr);
            if !self.storage.is_orphaned(node) {
                self.storage.set_dependencies(node, BTreeSet::new());
            }
            if self.storage.is_orphaned(node) {
                self.storage.delete_orphan(node);
            }
        }
        let data = &self.locations[location.0 as usize];
        let location_type = &self.types[data.type_id.0 as usize];
        let mut canonical = Vec::new();
        for key in &location_type.key_order {
            canonical.extend_from_slice(&key.0.to_le_bytes());
            if let Some(value) = data.keys.get(key) {
                value.write_key_bytes(&mut canonical);
            }
        }
        self.instances.remove(&(data.type_id, canonical));
        Ok(())
    }

    /// Subscribes to a property: the callback fires whenever the rooted
    /// property recomputes to a different value. Dropping the returned
    /// handle ends the subscription.
    pub fn subscribe(
        &mut self,
        location: LocationId,
        name: &str,
        on_changed: impl Fn() + 'static,
    ) -> Result<Rc<Root>> {
        let root = Root::new(on_changed);
        self.root_stack.push(Rc::clone(&root));
        let outcome = self.attribute(location, name);
        self.root_stack.pop();
        outcome?;
        Ok(root)
    }

    /// Runs `body` with `root` rooting every attribute it reads.
    pub fn with_root<T>(
        &mut self,
        root: &Rc<Root>,
        body: impl FnOnce(&mut ComputedGraph) -> T,
    ) -> T {
        self.root_stack.push(Rc::clone(root));
        let result = body(self);
        self.root_stack.pop();
        result
    }

    /// Marks every cached property of one class dirty.
    pub fn dirty_class(&mut self, type_id: LocationTypeId) {
        self.storage.dirty_class_properties(type_id);
    }

    /// Marks every cached property in the graph dirty.
    pub fn dirty_all(&mut self) {
        self.storage.dirty_all();
    }

    pub fn node_count(&self) -> usize {
        self.storage.node_count()
    }

    pub fn is_dirty(&self, location: LocationId, name: &str) -> bool {
        self.attr(name)
            .is_some_and(|attr| self.storage.is_dirty((location, attr)))
    }

    pub fn level_of(&self, location: LocationId, name: &str) -> Option<i32> {
        self.attr(name).map(|attr| self.storage.level((location, attr)))
    }

    pub fn mutable_access_counts(&self) -> Vec<(NodeId, u64)> {
        self.storage
            .mutable_access_counts()
            .iter()
            .map(|(node, count)| (*node, *count))
            .collect()
    }

    /// The downtree dependencies recorded at a property's last computation.
    pub fn dependencies_of(&self, location: LocationId, name: &str) -> Vec<NodeId> {
        self.attr(name)
            .map(|attr| self.storage.downtree((location, attr)).iter().copied().collect())
            .unwrap_or_default()
    }

    /// The dependencies whose changes dirtied a property since its last
    /// computation.
    pub fn properties_dirtying(&self, location: LocationId, name: &str) -> Vec<NodeId> {
        self.attr(name)
            .map(|attr| {
                self.storage
                    .nodes_dirtying((location, attr))
                    .iter()
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}
