use std::collections::{BTreeMap, BTreeSet};

/// A bidirectional multimap between keys and values.
///
/// Both directions are indexed: `values_for(k)` and `keys_for(v)` are O(log n)
/// lookups returning set references. Dependency graphs lean on this to walk
/// edges uptree and downtree without a second bookkeeping pass.
#[derive(Clone, Debug)]
pub struct TwoWaySetMap<K: Ord + Clone, V: Ord + Clone> {
    keys_to_values: BTreeMap<K, BTreeSet<V>>,
    values_to_keys: BTreeMap<V, BTreeSet<K>>,
    empty_values: BTreeSet<V>,
    empty_keys: BTreeSet<K>,
}

impl<K: Ord + Clone, V: Ord + Clone> Default for TwoWaySetMap<K, V> {
    fn default() -> Self {
        TwoWaySetMap {
            keys_to_values: BTreeMap::new(),
            values_to_keys: BTreeMap::new(),
            empty_values: BTreeSet::new(),
            empty_keys: BTreeSet::new(),
        }
    }
}

impl<K: Ord + Clone, V: Ord + Clone> TwoWaySetMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.keys_to_values
            .get(key)
            .is_some_and(|values| values.contains(value))
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.keys_to_values.contains_key(key)
    }

    pub fn has_value(&self, value: &V) -> bool {
        self.values_to_keys.contains_key(value)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.keys_to_values
            .entry(key.clone())
            .or_default()
            .insert(value.clone());
        self.values_to_keys.entry(value).or_default().insert(key);
    }

    pub fn drop(&mut self, key: &K, value: &V) {
        if let Some(values) = self.keys_to_values.get_mut(key) {
            values.remove(value);
            if values.is_empty() {
                self.keys_to_values.remove(key);
            }
        }
        if let Some(keys) = self.values_to_keys.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                self.values_to_keys.remove(value);
            }
        }
    }

    /// Replaces the value set of `key` with `new_values`.
    pub fn update(&mut self, key: K, new_values: BTreeSet<V>) {
        let old_values = self.values_for(&key).clone();
        for value in old_values.difference(&new_values) {
            if let Some(keys) = self.values_to_keys.get_mut(value) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.values_to_keys.remove(value);
                }
            }
        }
        for value in new_values.difference(&old_values) {
            self.values_to_keys
                .entry(value.clone())
                .or_default()
                .insert(key.clone());
        }
        if new_values.is_empty() {
            self.keys_to_values.remove(&key);
        } else {
            self.keys_to_values.insert(key, new_values);
        }
    }

    pub fn values_for(&self, key: &K) -> &BTreeSet<V> {
        self.keys_to_values.get(key).unwrap_or(&self.empty_values)
    }

    pub fn keys_for(&self, value: &V) -> &BTreeSet<K> {
        self.values_to_keys.get(value).unwrap_or(&self.empty_keys)
    }

    pub fn drop_key(&mut self, key: &K) {
        if let Some(values) = self.keys_to_values.remove(key) {
            for value in values {
                if let Some(keys) = self.values_to_keys.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.values_to_keys.remove(&value);
                    }
                }
            }
        }
    }

    pub fn drop_value(&mut self, value: &V) {
        if let Some(keys) = self.values_to_keys.remove(value) {
            for key in keys {
                if let Some(values) = self.keys_to_values.get_mut(&key) {
                    values.remove(value);
                    if values.is_empty() {
                        self.keys_to_values.remove(&key);
                    }
                }
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys_to_values.keys()
    }

    pub fn keys_to_values(&self) -> &BTreeMap<K, BTreeSet<V>> {
        &self.keys_to_values
    }

    pub fn key_count(&self) -> usize {
        self.keys_to_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys_to_values.is_empty()
    }
}
