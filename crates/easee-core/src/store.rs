use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::fields::{FieldSpec, ValueKind};

#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("state {0} has no definition")]
    UnknownState(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    pub kind: ValueKind,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub read: bool,
    pub write: bool,
}

impl StateDefinition {
    pub fn read_only(name: impl Into<String>, kind: ValueKind, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            role: role.into(),
            unit: None,
            read: true,
            write: false,
        }
    }

    pub fn from_field(field: &FieldSpec, writable: bool) -> Self {
        Self {
            name: field.name.to_string(),
            kind: field.kind,
            role: field.role.to_string(),
            unit: field.unit.map(str::to_string),
            read: true,
            write: writable,
        }
    }

    pub fn button(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ValueKind::Boolean,
            role: "button".to_string(),
            unit: None,
            read: false,
            write: true,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub value: Value,
    pub ack: bool,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub path: String,
    pub value: Value,
    pub ack: bool,
}

/// The host platform's hierarchical state tree.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Creates the definition if missing. Returns `true` when it was created.
    async fn ensure_definition(&self, path: &str, definition: StateDefinition) -> Result<bool, StoreError>;
    async fn write_value(&self, path: &str, value: Value, ack: bool) -> Result<(), StoreError>;
    async fn read_value(&self, path: &str) -> Result<Option<StoredState>, StoreError>;
    async fn subscribe(&self, pattern: &str) -> Result<(), StoreError>;
    /// Notifications for writes to subscribed paths.
    fn changes(&self) -> broadcast::Receiver<StateChange>;
}

/// `*` matches everything, `prefix.*` matches the subtree, anything else is exact.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == path,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub definition: StateDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StoredState>,
}

#[derive(Default)]
struct MemoryInner {
    definitions: BTreeMap<String, StateDefinition>,
    values: BTreeMap<String, StoredState>,
    subscriptions: Vec<String>,
}

/// Process-local state tree used when no host platform is attached.
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    changes: broadcast::Sender<StateChange>,
    journal: broadcast::Sender<StateChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        let (journal, _) = broadcast::channel(capacity);
        Self {
            inner: RwLock::new(MemoryInner::default()),
            changes,
            journal,
        }
    }

    /// Every write, subscribed or not.
    pub fn journal(&self) -> broadcast::Receiver<StateChange> {
        self.journal.subscribe()
    }

    pub fn definition(&self, path: &str) -> Option<StateDefinition> {
        self.inner.read().definitions.get(path).cloned()
    }

    pub fn value(&self, path: &str) -> Option<Value> {
        self.inner.read().values.get(path).map(|s| s.value.clone())
    }

    pub fn state(&self, path: &str) -> Option<StoredState> {
        self.inner.read().values.get(path).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StateEntry> {
        let inner = self.inner.read();
        inner
            .definitions
            .iter()
            .map(|(path, definition)| {
                (
                    path.clone(),
                    StateEntry {
                        definition: definition.clone(),
                        state: inner.values.get(path).cloned(),
                    },
                )
            })
            .collect()
    }

    /// Loads a previously exported snapshot without emitting notifications.
    pub fn restore(&self, entries: BTreeMap<String, StateEntry>) {
        let mut inner = self.inner.write();
        for (path, entry) in entries {
            if let Some(state) = entry.state {
                inner.values.insert(path.clone(), state);
            }
            inner.definitions.insert(path, entry.definition);
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn ensure_definition(&self, path: &str, definition: StateDefinition) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.definitions.contains_key(path) {
            return Ok(false);
        }
        inner.definitions.insert(path.to_string(), definition);
        Ok(true)
    }

    async fn write_value(&self, path: &str, value: Value, ack: bool) -> Result<(), StoreError> {
        let subscribed = {
            let mut inner = self.inner.write();
            if !inner.definitions.contains_key(path) {
                return Err(StoreError::UnknownState(path.to_string()));
            }
            inner.values.insert(
                path.to_string(),
                StoredState {
                    value: value.clone(),
                    ack,
                    ts: Utc::now(),
                },
            );
            inner
                .subscriptions
                .iter()
                .any(|pattern| pattern_matches(pattern, path))
        };

        let change = StateChange {
            path: path.to_string(),
            value,
            ack,
        };
        // No receivers is not an error.
        let _ = self.journal.send(change.clone());
        if subscribed {
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    async fn read_value(&self, path: &str) -> Result<Option<StoredState>, StoreError> {
        Ok(self.state(path))
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.subscriptions.iter().any(|p| p == pattern) {
            inner.subscriptions.push(pattern.to_string());
        }
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}
