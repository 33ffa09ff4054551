//! Concurrent multimap used for service-record bookkeeping.

use std::hash::Hash;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Mapping from `K` to an insertion-ordered set of `V`.
///
/// Mutations report whether they changed the set and the resulting
/// cardinality, decided atomically under the per-key lock. Many concurrent
/// paired insert/remove calls on the same key never lose or duplicate
/// entries: after N pairs the cardinality is back to zero.
#[derive(Debug, Default)]
pub struct SetMatrix<K, V>
where
    K: Eq + Hash,
    V: PartialEq,
{
    sets: DashMap<K, Vec<V>>,
}

impl<K, V> SetMatrix<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    /// Create an empty matrix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets: DashMap::new(),
        }
    }

    /// Insert `value` into the set for `key`.
    ///
    /// Returns `(changed, cardinality)`; inserting a value already present
    /// leaves the set untouched.
    pub fn insert(&self, key: K, value: V) -> (bool, usize) {
        let mut set = self.sets.entry(key).or_default();
        if set.contains(&value) {
            (false, set.len())
        } else {
            set.push(value);
            (true, set.len())
        }
    }

    /// Remove `value` from the set for `key`.
    ///
    /// Returns `(changed, cardinality)`. The key itself is dropped when its
    /// set becomes empty.
    pub fn remove(&self, key: &K, value: &V) -> (bool, usize) {
        match self.sets.entry(key.clone()) {
            Entry::Vacant(_) => (false, 0),
            Entry::Occupied(mut occ) => {
                let set = occ.get_mut();
                let Some(pos) = set.iter().position(|v| v == value) else {
                    return (false, set.len());
                };
                set.remove(pos);
                let len = set.len();
                if len == 0 {
                    occ.remove();
                }
                (true, len)
            }
        }
    }

    /// Whether `value` is in the set for `key`.
    ///
    /// Returns `(contains, key_exists)`.
    pub fn contains(&self, key: &K, value: &V) -> (bool, bool) {
        match self.sets.get(key) {
            Some(set) => (set.contains(value), true),
            None => (false, false),
        }
    }

    /// Number of values stored under `key`.
    ///
    /// Returns `(cardinality, key_exists)`.
    pub fn cardinality(&self, key: &K) -> (usize, bool) {
        match self.sets.get(key) {
            Some(set) => (set.len(), true),
            None => (0, false),
        }
    }

    /// The values stored under `key`, in insertion order.
    pub fn get(&self, key: &K) -> Option<Vec<V>> {
        self.sets.get(key).map(|set| set.clone())
    }

    /// Number of keys with a non-empty set.
    #[must_use]
    pub fn keys(&self) -> usize {
        self.sets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn insert_reports_change_and_cardinality() {
        let m: SetMatrix<String, u32> = SetMatrix::new();
        assert_eq!(m.insert("svc".to_string(), 1), (true, 1));
        assert_eq!(m.insert("svc".to_string(), 2), (true, 2));
        assert_eq!(m.insert("svc".to_string(), 1), (false, 2));
    }

    #[test]
    fn remove_drops_empty_keys() {
        let m: SetMatrix<String, u32> = SetMatrix::new();
        m.insert("svc".to_string(), 7);
        assert_eq!(m.remove(&"svc".to_string(), &7), (true, 0));
        assert_eq!(m.cardinality(&"svc".to_string()), (0, false));
        assert_eq!(m.remove(&"svc".to_string(), &7), (false, 0));
    }

    #[test]
    fn get_preserves_insertion_order() {
        let m: SetMatrix<&str, &str> = SetMatrix::new();
        m.insert("k", "c");
        m.insert("k", "a");
        m.insert("k", "b");
        assert_eq!(m.get(&"k"), Some(vec!["c", "a", "b"]));
    }

    #[test]
    fn paired_insert_remove_across_threads_nets_zero() {
        let m: Arc<SetMatrix<String, usize>> = Arc::new(SetMatrix::new());
        let mut handles = Vec::new();

        for t in 0..8usize {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200usize {
                    let v = t * 1000 + i;
                    let (changed, _) = m.insert("records".to_string(), v);
                    assert!(changed);
                    let (changed, _) = m.remove(&"records".to_string(), &v);
                    assert!(changed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(m.cardinality(&"records".to_string()), (0, false));
    }

    proptest! {
        #[test]
        fn cardinality_matches_distinct_live_values(ops in proptest::collection::vec((0u8..4, 0u8..8), 0..64)) {
            let m: SetMatrix<u8, u8> = SetMatrix::new();
            let mut model: std::collections::HashMap<u8, Vec<u8>> = std::collections::HashMap::new();

            for (key, value) in ops {
                if value % 2 == 0 {
                    m.insert(key, value);
                    let set = model.entry(key).or_default();
                    if !set.contains(&value) {
                        set.push(value);
                    }
                } else {
                    m.remove(&key, &value);
                    if let Some(set) = model.get_mut(&key) {
                        set.retain(|v| v != &value);
                    }
                }
            }

            for (key, set) in &model {
                prop_assert_eq!(m.cardinality(key).0, set.len());
            }
        }
    }
}
