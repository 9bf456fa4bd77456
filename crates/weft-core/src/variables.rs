use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::types::AgentId;

/// One stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableEntry {
    pub value: Value,
    /// Agent that performed the last write; `None` for values seeded by the caller.
    pub writer: Option<AgentId>,
    /// Store-wide write sequence number of the last write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Run-scoped key/value table shared by every agent of one workflow run.
///
/// Writes are atomic per key and never block readers. Ordering between a
/// writer and its readers comes from the scheduler, not from this type.
#[derive(Debug, Default)]
pub struct VariableStore {
    entries: DashMap<String, VariableEntry>,
    sequence: AtomicU64,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store with caller-provided values.
    pub fn with_values<I, K>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let store = Self::new();
        for (key, value) in values {
            store.set(key, value, None);
        }
        store
    }

    /// Overwrite `key` unconditionally. Returns the write's version.
    pub fn set(&self, key: impl Into<String>, value: Value, writer: Option<AgentId>) -> u64 {
        let version = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.insert(
            key.into(),
            VariableEntry {
                value,
                writer,
                version,
                updated_at: Utc::now(),
            },
        );
        version
    }

    /// Current value, or `None` if the key was never written.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<VariableEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Value rendered as prompt text: strings verbatim, everything else as JSON.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).map(|v| render_value(&v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, e)| e.value)
    }

    /// Sorted key listing.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Point-in-time copy of every value, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
