//! Ordered string multimap for correlation ids and diagnostic metadata.

use std::sync::Arc;

use parking_lot::RwLock;

/// Thread-safe ordered multimap of string tags.
///
/// Entries keep insertion order and a key may appear more than once. The
/// store imposes no schema; callers partition keys by prefix (`app:`,
/// `lib:`) to avoid collisions.
///
/// Cheaply cloneable. Clones share storage, which is how handlers running
/// concurrently see and write the same tags as the orchestrator.
#[derive(Clone, Default)]
pub struct TagStore {
    inner: Arc<RwLock<Vec<(String, String)>>>,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing entries.
    pub fn from_entries(entries: Vec<(String, String)>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entries)),
        }
    }

    /// Append an entry.
    pub fn add(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.write().push((key.into(), value.into()));
    }

    /// Replace every entry for `key` with a single one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let mut guard = self.inner.write();
        guard.retain(|(k, _)| *k != key);
        guard.push((key, value.into()));
    }

    /// Append an entry unless `key` is already present. Returns whether it
    /// was added.
    pub fn add_if_absent(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let mut guard = self.inner.write();
        if guard.iter().any(|(k, _)| *k == key) {
            return false;
        }
        guard.push((key, value.into()));
        true
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Every value for `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> Vec<String> {
        self.inner
            .read()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.read().iter().any(|(k, _)| k == key)
    }

    /// Remove every entry for `key`. Returns how many were removed.
    pub fn remove(&self, key: &str) -> usize {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|(k, _)| k != key);
        before - guard.len()
    }

    /// Entries whose key starts with `prefix`, in insertion order.
    pub fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.inner
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Copy of every entry.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.inner.read().clone()
    }

    /// Independent store with the same entries.
    pub fn fork(&self) -> Self {
        Self::from_entries(self.entries())
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl std::fmt::Debug for TagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.inner.read().iter()).finish()
    }
}
