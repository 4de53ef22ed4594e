use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// A key-value map that also maintains an ordered index from values back to
/// key sets, so callers can ask for the lowest value present or scan keys in
/// value order. The computed graph's dirty-node ordering and the state log's
/// access index both sit on this.
#[derive(Clone, Debug)]
pub struct MapWithIndex<K: Ord + Clone, V: Ord + Clone> {
    key_to_value: BTreeMap<K, V>,
    value_to_keys: BTreeMap<V, BTreeSet<K>>,
}

impl<K: Ord + Clone, V: Ord + Clone> Default for MapWithIndex<K, V> {
    fn default() -> Self {
        MapWithIndex {
            key_to_value: BTreeMap::new(),
            value_to_keys: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Ord + Clone> MapWithIndex<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: K, value: V) {
        self.drop(&key);
        self.key_to_value.insert(key.clone(), value.clone());
        self.value_to_keys.entry(value).or_default().insert(key);
    }

    pub fn drop(&mut self, key: &K) {
        if let Some(old) = self.key_to_value.remove(key) {
            if let Some(keys) = self.value_to_keys.get_mut(&old) {
                keys.remove(key);
                if keys.is_empty() {
                    self.value_to_keys.remove(&old);
                }
            }
        }
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.key_to_value.contains_key(key)
    }

    pub fn value_for(&self, key: &K) -> Option<&V> {
        self.key_to_value.get(key)
    }

    pub fn has_value(&self, value: &V) -> bool {
        self.value_to_keys.contains_key(value)
    }

    pub fn keys_with_value(&self, value: &V) -> Option<&BTreeSet<K>> {
        self.value_to_keys.get(value)
    }

    /// The smallest value present, if any.
    pub fn lowest_value(&self) -> Option<&V> {
        self.value_to_keys.keys().next()
    }

    /// The first `(value, keys)` entry at or above `bound` in value order.
    pub fn first_at_or_above(&self, bound: &V) -> Option<(&V, &BTreeSet<K>)> {
        self.value_to_keys
            .range((Bound::Included(bound), Bound::Unbounded))
            .next()
            .map(|(value, keys)| (value, keys))
    }

    pub fn key_count(&self) -> usize {
        self.key_to_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_value.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.key_to_value.iter()
    }
}
