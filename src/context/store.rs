//! Append-only, attempt-scoped key/value store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ContextError;

/// Prefix of keys written by a resumed human checkpoint.
pub const HANDOVER_PREFIX: &str = "handover:";

/// Prefix of keys holding a task's retrieval results.
pub const RETRIEVAL_PREFIX: &str = "retrieval:";

/// Reserved key under which a checkpoint payload for `phase_id` is stored.
#[must_use]
pub fn handover_key(phase_id: &str) -> String {
    format!("{HANDOVER_PREFIX}{phase_id}")
}

/// Reserved key under which retrieval results for `task_id` are stored.
#[must_use]
pub fn retrieval_key(task_id: &str) -> String {
    format!("{RETRIEVAL_PREFIX}{task_id}")
}

/// Returns the phase id if `key` is a handover key.
#[must_use]
pub fn parse_handover_key(key: &str) -> Option<&str> {
    key.strip_prefix(HANDOVER_PREFIX)
}

/// A single value in the context store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// The stored output.
    pub value: serde_json::Value,
    /// Attempt (task revision) that produced the value.
    pub attempt: u32,
    /// When the value was written.
    pub written_at: DateTime<Utc>,
}

/// Context shared by all tasks of a run.
///
/// A key is written at most once per attempt. Writing again with a newer
/// attempt replaces the value; only [`ContextStore::revise`] removes keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    entries: BTreeMap<String, ContextEntry>,
}

impl ContextStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `value` under `key` for the given attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DuplicateWrite`] if the key already holds a
    /// value from the same or a later attempt.
    pub fn write(
        &mut self,
        key: impl Into<String>,
        attempt: u32,
        value: serde_json::Value,
    ) -> Result<(), ContextError> {
        let key = key.into();
        if let Some(existing) = self.entries.get(&key) {
            if existing.attempt >= attempt {
                return Err(ContextError::DuplicateWrite { key, attempt });
            }
        }
        tracing::trace!(key = %key, attempt, "Context write");
        self.entries.insert(
            key,
            ContextEntry {
                value,
                attempt,
                written_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Read every key in `keys`.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::MissingContext`] naming the first absent key.
    pub fn read<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<BTreeMap<String, serde_json::Value>, ContextError> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                self.entries
                    .get(key)
                    .map(|entry| (key.to_string(), entry.value.clone()))
                    .ok_or_else(|| ContextError::MissingContext {
                        key: key.to_string(),
                    })
            })
            .collect()
    }

    /// Clear exactly the given keys. Returns the keys that held a value.
    pub fn revise<S: AsRef<str>>(&mut self, keys: &[S]) -> Vec<String> {
        keys.iter()
            .filter_map(|key| {
                self.entries
                    .remove(key.as_ref())
                    .map(|_| key.as_ref().to_string())
            })
            .collect()
    }

    /// Get the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    /// Get the full entry stored under `key`.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    /// Whether `key` holds a value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys in lexical order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
