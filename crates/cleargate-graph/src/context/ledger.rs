//! Suspension ledger: parked work waiting for its next poll.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::Suspension;

/// Stable identity of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LedgerKey {
    /// A suspended handler node.
    Node { node_id: String },
    /// A Map item whose sub-graph is parked.
    MapItem { node_id: String, index: usize },
}

impl LedgerKey {
    pub fn node(node_id: impl Into<String>) -> Self {
        Self::Node {
            node_id: node_id.into(),
        }
    }

    pub fn map_item(node_id: impl Into<String>, index: usize) -> Self {
        Self::MapItem {
            node_id: node_id.into(),
            index,
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            Self::Node { node_id } | Self::MapItem { node_id, .. } => node_id,
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node { node_id } => write!(f, "{node_id}"),
            Self::MapItem { node_id, index } => write!(f, "{node_id}[{index}]"),
        }
    }
}

/// Bookkeeping for one parked piece of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub token: String,
    /// Polls so far, counting the invocation that first suspended.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub message: String,
    /// Set while a poll is in flight. Polling entries do not drive the wake
    /// timer.
    #[serde(default)]
    pub polling: bool,
}

impl LedgerEntry {
    /// Entry for a handler that just suspended for the first time.
    pub fn first(suspension: &Suspension, now: DateTime<Utc>) -> Self {
        Self {
            token: suspension.token.clone(),
            attempts: 1,
            next_attempt_at: add_std(now, suspension.retry_after),
            deadline: suspension.max_wait_time.map(|d| add_std(now, d)),
            max_retries: suspension.max_retries,
            message: suspension.message.clone(),
            polling: false,
        }
    }

    /// Entry for a parked Map item, woken at `wake_at`.
    pub fn parked(token: impl Into<String>, wake_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            attempts: 1,
            next_attempt_at: wake_at,
            deadline: None,
            max_retries: None,
            message: String::new(),
            polling: false,
        }
    }

    /// Re-arm after the handler suspended again. Attempts, deadline and
    /// retry budget carry over from the first suspension.
    pub fn rearm(&mut self, suspension: &Suspension, now: DateTime<Utc>) {
        self.token = suspension.token.clone();
        self.next_attempt_at = add_std(now, suspension.retry_after);
        self.message = suspension.message.clone();
        self.polling = false;
    }

    /// When the entry next needs attention: its next poll, or its deadline
    /// if that comes first.
    pub fn due_at(&self) -> DateTime<Utc> {
        match self.deadline {
            Some(deadline) => self.next_attempt_at.min(deadline),
            None => self.next_attempt_at,
        }
    }

    /// Deadline passed or retry budget spent.
    pub fn is_exhausted(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
            || self.max_retries.is_some_and(|max| self.attempts > max)
    }

    /// Human-readable reason for [`is_exhausted`](Self::is_exhausted).
    pub fn exhausted_reason(&self, now: DateTime<Utc>) -> String {
        if self.deadline.is_some_and(|d| now >= d) {
            format!("suspension deadline exceeded after {} poll(s)", self.attempts)
        } else {
            format!(
                "suspension retries exhausted after {} poll(s)",
                self.attempts
            )
        }
    }
}

pub(crate) fn add_std(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Concurrency-safe map of [`LedgerKey`] to [`LedgerEntry`].
#[derive(Default)]
pub struct SuspensionLedger {
    inner: Mutex<BTreeMap<LedgerKey, LedgerEntry>>,
}

impl SuspensionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: LedgerKey, entry: LedgerEntry) {
        self.inner.lock().insert(key, entry);
    }

    pub fn get(&self, key: &LedgerKey) -> Option<LedgerEntry> {
        self.inner.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &LedgerKey) -> Option<LedgerEntry> {
        self.inner.lock().remove(key)
    }

    /// Apply `f` to the entry under `key`. Returns `None` if absent.
    pub fn update<R>(&self, key: &LedgerKey, f: impl FnOnce(&mut LedgerEntry) -> R) -> Option<R> {
        self.inner.lock().get_mut(key).map(f)
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Earliest [`due_at`](LedgerEntry::due_at) among entries not currently
    /// polling.
    ///
    /// This is the single wake time for the whole context.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .values()
            .filter(|e| !e.polling)
            .map(LedgerEntry::due_at)
            .min()
    }

    /// Mark every idle entry whose time has come as polling and return them.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Vec<(LedgerKey, LedgerEntry)> {
        let mut guard = self.inner.lock();
        guard
            .iter_mut()
            .filter(|(_, e)| !e.polling && e.due_at() <= now)
            .map(|(k, e)| {
                e.polling = true;
                (k.clone(), e.clone())
            })
            .collect()
    }

    /// Drop every Map item entry belonging to `node_id`.
    pub fn remove_map_items(&self, node_id: &str) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|k, _| !matches!(k, LedgerKey::MapItem { node_id: n, .. } if n == node_id));
        before - guard.len()
    }

    pub(crate) fn clear_polling(&self) {
        for entry in self.inner.lock().values_mut() {
            entry.polling = false;
        }
    }

    /// Copy of every entry in key order.
    pub fn entries(&self) -> Vec<(LedgerKey, LedgerEntry)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl std::fmt::Debug for SuspensionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.inner.lock().iter()).finish()
    }
}
