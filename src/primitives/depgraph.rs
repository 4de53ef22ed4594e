//! A push-pull reactive substrate: mutables, computed properties, and
//! indices over them.
//!
//! Unlike the full computed-object graph in [`crate::graph`], this substrate
//! has no notion of locations or keys; it is a lightweight leveled
//! recomputation engine for in-process derived state. The CPU-assignment
//! graph keeps its per-root direct compute totals on it. Dependency tracking
//! is explicit: compute closures receive a [`ComputeScope`] and read through
//! it, so there is no hidden per-thread compute state. Nodes are shareable
//! across threads; owners that want a single logical scheduler serialize
//! access with their own lock, as the CPU-assignment graph does.
//!
//! Every computed property carries a *level*, bounded below by one plus the
//! highest level it read during its last computation. `recompute` drains
//! dirty nodes lowest level first, so by the time a node re-runs its
//! dependencies are already clean.

use std::cmp::max;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Shared state of one dependency graph.
pub struct DepGraph {
    state: Arc<Mutex<GraphState>>,
}

#[derive(Default)]
struct GraphState {
    dirty_by_level: BTreeMap<i64, VecDeque<Weak<dyn DirtyableNode>>>,
    values_computed: u64,
}

trait DirtyableNode: Send + Sync {
    fn is_dirty(&self) -> bool;
    fn make_clean(self: Arc<Self>);
    /// Sets the dirty flag and enqueues the node. No-op when already dirty.
    fn mark_dirty(self: Arc<Self>);
}

/// The read context threaded through compute closures. Reads performed
/// through the scope register the computing node as a listener and raise its
/// level above the level of whatever it read.
pub struct ComputeScope {
    listener: Weak<dyn DirtyableNode>,
    level_read: i64,
}

impl ComputeScope {
    fn record_read(&mut self, source_level: i64) {
        self.level_read = max(self.level_read, source_level);
    }
}

impl DepGraph {
    pub fn new() -> Self {
        DepGraph {
            state: Arc::new(Mutex::new(GraphState::default())),
        }
    }

    /// Total values computed over the graph's lifetime.
    pub fn values_computed(&self) -> u64 {
        self.state.lock().values_computed
    }

    /// Recomputes every dirty node, lowest level first, until quiescent.
    /// Returns the number of values computed.
    pub fn recompute(&self) -> u64 {
        self.recompute_below(i64::MAX)
    }

    /// Recomputes dirty nodes whose level is below `level_bound`.
    pub fn recompute_below(&self, level_bound: i64) -> u64 {
        let mut computed = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let Some((&level, _)) = state.dirty_by_level.iter().next() else {
                    break;
                };
                if level >= level_bound {
                    break;
                }
                let bucket = state
                    .dirty_by_level
                    .get_mut(&level)
                    .expect("bucket exists");
                let node = bucket.pop_front();
                if bucket.is_empty() {
                    state.dirty_by_level.remove(&level);
                }
                node
            };

            let Some(weak) = next else { continue };
            let Some(node) = weak.upgrade() else { continue };
            if !node.is_dirty() {
                continue;
            }
            node.make_clean();
            computed += 1;
            self.state.lock().values_computed += 1;
        }
        computed
    }

    /// Builds a computed property over `compute`.
    pub fn bind<T, F>(&self, compute: F) -> ComputedProperty<T>
    where
        T: Clone + PartialEq + Default + Send + 'static,
        F: Fn(&mut ComputeScope) -> T + Send + Sync + 'static,
    {
        ComputedProperty {
            node: Arc::new(PropertyNode {
                graph: Arc::clone(&self.state),
                value: Mutex::new(T::default()),
                level: AtomicI64::new(0),
                min_level: AtomicI64::new(0),
                dirty: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                compute: Box::new(compute),
                listeners: Mutex::new(Vec::new()),
                on_destroy: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Default for DepGraph {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_listeners(listeners: &Mutex<Vec<Weak<dyn DirtyableNode>>>) {
    let snapshot: Vec<_> = {
        let mut guard = listeners.lock();
        guard.retain(|listener| listener.strong_count() > 0);
        guard.clone()
    };
    for listener in snapshot {
        if let Some(node) = listener.upgrade() {
            node.mark_dirty();
        }
    }
}

/// A settable input cell. Mutables are always clean and live at level zero.
pub struct Mutable<T: Clone + PartialEq + Send> {
    inner: Arc<MutableInner<T>>,
}

struct MutableInner<T> {
    value: Mutex<T>,
    listeners: Mutex<Vec<Weak<dyn DirtyableNode>>>,
}

impl<T: Clone + PartialEq + Send> Clone for Mutable<T> {
    fn clone(&self) -> Self {
        Mutable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + Default> Default for Mutable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + PartialEq + Send> Mutable<T> {
    pub fn new(value: T) -> Self {
        Mutable {
            inner: Arc::new(MutableInner {
                value: Mutex::new(value),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Reads the value inside a compute, registering the dependency.
    pub fn get(&self, scope: &mut ComputeScope) -> T {
        scope.record_read(0);
        self.inner.listeners.lock().push(scope.listener.clone());
        self.inner.value.lock().clone()
    }

    /// Reads the value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.lock().clone()
    }

    pub fn set(&self, value: T) {
        {
            let mut current = self.inner.value.lock();
            if *current == value {
                return;
            }
            *current = value;
        }
        notify_listeners(&self.inner.listeners);
    }

    /// Dirties listeners without changing the value.
    pub fn mark_dirty(&self) {
        notify_listeners(&self.inner.listeners);
    }
}

/// A cached value derived from mutables and other properties.
///
/// The value is default-initialized until the first `recompute` pass after
/// the property is first read.
pub struct ComputedProperty<T: Clone + PartialEq + Default + Send + 'static> {
    node: Arc<PropertyNode<T>>,
}

impl<T: Clone + PartialEq + Default + Send + 'static> Clone for ComputedProperty<T> {
    fn clone(&self) -> Self {
        ComputedProperty {
            node: Arc::clone(&self.node),
        }
    }
}

struct PropertyNode<T> {
    graph: Arc<Mutex<GraphState>>,
    value: Mutex<T>,
    level: AtomicI64,
    min_level: AtomicI64,
    dirty: AtomicBool,
    initialized: AtomicBool,
    compute: Box<dyn Fn(&mut ComputeScope) -> T + Send + Sync>,
    listeners: Mutex<Vec<Weak<dyn DirtyableNode>>>,
    on_destroy: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl<T: Clone + PartialEq + Default + Send + 'static> ComputedProperty<T> {
    /// Reads the cached value inside a compute, registering the dependency.
    pub fn get(&self, scope: &mut ComputeScope) -> T {
        self.ensure_initialized();
        scope.record_read(self.node.level.load(Ordering::Acquire));
        self.node.listeners.lock().push(scope.listener.clone());
        self.node.value.lock().clone()
    }

    /// Reads the cached value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.ensure_initialized();
        self.node.value.lock().clone()
    }

    pub fn level(&self) -> i64 {
        self.node.level.load(Ordering::Acquire)
    }

    /// Forces the level to at least `level`.
    pub fn set_min_level(&self, level: i64) {
        self.node.min_level.store(level, Ordering::Release);
        self.node.level.fetch_max(level, Ordering::AcqRel);
    }

    /// Registers a hook run when the last handle to this property drops.
    pub fn on_destroy(&self, hook: impl FnOnce() + Send + 'static) {
        self.node.on_destroy.lock().push(Box::new(hook));
    }

    fn ensure_initialized(&self) {
        if !self.node.initialized.swap(true, Ordering::AcqRel) {
            Arc::clone(&self.node).mark_dirty_node();
        }
    }

    fn downgrade(&self) -> Weak<PropertyNode<T>> {
        Arc::downgrade(&self.node)
    }

    fn from_node(node: Arc<PropertyNode<T>>) -> Self {
        ComputedProperty { node }
    }
}

impl<T: Clone + PartialEq + Default + Send + 'static> PropertyNode<T> {
    fn mark_dirty_node(self: Arc<Self>) {
        if self.dirty.swap(true, Ordering::AcqRel) {
            return;
        }
        let level = self.level.load(Ordering::Acquire);
        let weak: Weak<dyn DirtyableNode> = {
            let arc: Arc<dyn DirtyableNode> = self.clone();
            Arc::downgrade(&arc)
        };
        self.graph
            .lock()
            .dirty_by_level
            .entry(level)
            .or_default()
            .push_back(weak);
    }
}

impl<T: Clone + PartialEq + Default + Send + 'static> DirtyableNode for PropertyNode<T> {
    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn make_clean(self: Arc<Self>) {
        self.dirty.store(false, Ordering::Release);
        let min_level = self.min_level.load(Ordering::Acquire);
        self.level.store(min_level, Ordering::Release);

        let listener: Weak<dyn DirtyableNode> = {
            let arc: Arc<dyn DirtyableNode> = self.clone();
            Arc::downgrade(&arc)
        };
        let mut scope = ComputeScope {
            listener,
            level_read: -1,
        };
        let value = (self.compute)(&mut scope);

        let new_level = max(min_level, scope.level_read + 1);
        self.level.store(new_level, Ordering::Release);

        let changed = {
            let mut current = self.value.lock();
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        };
        if changed {
            notify_listeners(&self.listeners);
        }
    }

    fn mark_dirty(self: Arc<Self>) {
        self.mark_dirty_node();
    }
}

impl<T> Drop for PropertyNode<T> {
    fn drop(&mut self) {
        for hook in self.on_destroy.get_mut().drain(..) {
            hook();
        }
    }
}

/// An inverted index over the results of a set of computed properties.
///
/// Each registered `(key, property)` pair contributes its property's current
/// value; `keys_for(result)` answers "which keys currently compute to this
/// result". The index stays current across `recompute` passes and unregisters
/// a pair when its property is dropped.
pub struct Index<K: Ord + Clone + Send + 'static, V: Ord + Clone + Send + 'static> {
    graph_state: Arc<Mutex<GraphState>>,
    state: Arc<Mutex<IndexState<K, V>>>,
}

struct IndexState<K, V> {
    keysets: BTreeMap<V, BTreeMap<K, i64>>,
    updaters: BTreeMap<usize, ComputedProperty<i64>>,
}

impl<K, V> Index<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Ord + Clone + Default + PartialEq + Send + 'static,
{
    pub fn new(graph: &DepGraph) -> Self {
        Index {
            graph_state: Arc::clone(&graph.state),
            state: Arc::new(Mutex::new(IndexState {
                keysets: BTreeMap::new(),
                updaters: BTreeMap::new(),
            })),
        }
    }

    /// Tracks `property` under `key`.
    pub fn add(&self, key: K, property: &ComputedProperty<V>) {
        let graph = DepGraph {
            state: Arc::clone(&self.graph_state),
        };

        let updater_key = Arc::as_ptr(&property.node) as usize;
        let last_value: Arc<Mutex<Option<V>>> = Arc::new(Mutex::new(None));

        let weak_source = property.downgrade();
        let state = Arc::clone(&self.state);
        let update_key = key.clone();
        let update_last = Arc::clone(&last_value);
        let updater = graph.bind(move |scope| {
            let Some(node) = weak_source.upgrade() else {
                return 0;
            };
            let source = ComputedProperty::from_node(node);
            let new_value = source.get(scope);

            let mut last = update_last.lock();
            if last.as_ref() == Some(&new_value) {
                return 0;
            }
            if let Some(old) = last.take() {
                Self::apply(&state, &old, &update_key, -1);
            }
            Self::apply(&state, &new_value, &update_key, 1);
            *last = Some(new_value);
            0
        });
        updater.get_untracked();

        let destroy_state = Arc::clone(&self.state);
        property.on_destroy(move || {
            if let Some(old) = last_value.lock().take() {
                Self::apply(&destroy_state, &old, &key, -1);
            }
            destroy_state.lock().updaters.remove(&updater_key);
        });

        self.state.lock().updaters.insert(updater_key, updater);
    }

    /// Keys whose property currently computes to `result`, with counts.
    pub fn keys_for(&self, result: &V) -> BTreeMap<K, i64> {
        self.state
            .lock()
            .keysets
            .get(result)
            .cloned()
            .unwrap_or_default()
    }

    fn apply(state: &Arc<Mutex<IndexState<K, V>>>, result: &V, key: &K, delta: i64) {
        let mut state = state.lock();
        let now_empty = {
            let keyset = state.keysets.entry(result.clone()).or_default();
            let count = keyset.entry(key.clone()).or_insert(0);
            *count += delta;
            if *count == 0 {
                keyset.remove(key);
            }
            keyset.is_empty()
        };
        if now_empty {
            state.keysets.remove(result);
        }
    }
}
