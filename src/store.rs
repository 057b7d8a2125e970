//! In-memory cache mapping dependency identities to their latest values.
//!
//! The store is the only state shared between views (writers) and
//! template evaluation (readers). Writes are last-writer-wins per
//! identity; reads are hot during template evaluation, so values sit
//! behind a reader-preferring lock while the per-identity recall
//! counters live in a concurrent map and are bumped lock-free.
//!
//! The store performs no I/O and knows nothing about dependencies
//! beyond their identity strings.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::dep::Value;

/// Cache of the most recent value per dependency identity.
#[derive(Default)]
pub struct Store {
    data: RwLock<HashMap<String, Value>>,
    recalls: DashMap<String, u64>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally record `value` as the latest for `id`.
    pub fn save(&self, id: impl Into<String>, value: Value) {
        self.data.write().insert(id.into(), value);
    }

    /// Look up the latest value for `id`, recording the recall.
    ///
    /// Recalls are counted whether or not a value is present; the counter
    /// feeds the resolver's never-settles heuristic.
    pub fn recall(&self, id: &str) -> Option<Value> {
        *self.recalls.entry(id.to_string()).or_insert(0) += 1;
        self.data.read().get(id).cloned()
    }

    /// How many times `id` has been recalled.
    pub fn recall_count(&self, id: &str) -> u64 {
        self.recalls.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Remove the value for `id`, if any.
    pub fn delete(&self, id: &str) {
        self.data.write().remove(id);
        self.recalls.remove(id);
    }

    /// Clear all values and counters.
    pub fn reset(&self) {
        self.data.write().clear();
        self.recalls.clear();
    }

    /// Number of cached identities.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_recall() {
        let store = Store::new();
        assert_eq!(store.recall("kv.get(port)"), None);

        store.save("kv.get(port)", Value::KvPair(Some("8080".to_string())));
        assert_eq!(
            store.recall("kv.get(port)"),
            Some(Value::KvPair(Some("8080".to_string())))
        );
    }

    #[test]
    fn test_save_overwrites() {
        let store = Store::new();
        store.save("kv.get(port)", Value::KvPair(Some("8080".to_string())));
        store.save("kv.get(port)", Value::KvPair(Some("9090".to_string())));
        assert_eq!(
            store.recall("kv.get(port)"),
            Some(Value::KvPair(Some("9090".to_string())))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_recall_counts_misses_and_hits() {
        let store = Store::new();
        store.recall("catalog.nodes");
        store.recall("catalog.nodes");
        store.save("catalog.nodes", Value::Nodes(vec![]));
        store.recall("catalog.nodes");
        assert_eq!(store.recall_count("catalog.nodes"), 3);
        assert_eq!(store.recall_count("unknown"), 0);
    }

    #[test]
    fn test_delete_and_reset() {
        let store = Store::new();
        store.save("a", Value::KvExists(true));
        store.save("b", Value::KvExists(false));

        store.delete("a");
        assert_eq!(store.recall("a"), None);
        assert_eq!(store.len(), 1);

        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.recall_count("b"), 0);
    }
}
