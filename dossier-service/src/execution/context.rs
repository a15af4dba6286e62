// Run Context
// Write-once key/value store scoped to a single orchestration run

use crate::execution::task::ErrorKind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use thiserror::Error;

/// Producer name recorded for keys seeded from the run request
pub const SEED_PRODUCER: &str = "input";

/// A single value stored in the run context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Stored value
    pub value: Value,
    /// Worker that wrote the key (or `input` for seed data)
    pub producer: String,
    /// When the key was committed
    pub written_at: DateTime<Utc>,
}

/// Ordered copy of the context contents
pub type ContextSnapshot = BTreeMap<String, ContextEntry>;

/// Run context contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("key '{key}' was already written by '{existing_producer}', rejected write from '{producer}'")]
    DuplicateKey {
        key: String,
        existing_producer: String,
        producer: String,
    },

    #[error("key '{key}' is not present in the run context")]
    MissingKey { key: String },

    #[error("worker '{worker}' read '{key}' which is produced by undeclared dependency '{producer}'")]
    UndeclaredRead {
        worker: String,
        key: String,
        producer: String,
    },
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::DuplicateKey { .. } => ErrorKind::DuplicateKeyError,
            ContextError::MissingKey { .. } => ErrorKind::MissingKeyError,
            ContextError::UndeclaredRead { .. } => ErrorKind::UndeclaredReadError,
        }
    }
}

/// Mutable, run-scoped store. Owned by the orchestrator; workers only see a [`ContextView`].
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    entries: BTreeMap<String, ContextEntry>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context pre-populated with the request's seed values
    pub fn seeded(input: BTreeMap<String, Value>) -> Self {
        let written_at = Utc::now();
        let entries = input
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    ContextEntry {
                        value,
                        producer: SEED_PRODUCER.to_string(),
                        written_at,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// Write a key once. A second write fails regardless of who attempts it.
    pub fn write(
        &mut self,
        key: impl Into<String>,
        value: Value,
        producer: &str,
    ) -> Result<(), ContextError> {
        let key = key.into();
        if let Some(existing) = self.entries.get(&key) {
            return Err(ContextError::DuplicateKey {
                key,
                existing_producer: existing.producer.clone(),
                producer: producer.to_string(),
            });
        }

        self.entries.insert(
            key,
            ContextEntry {
                value,
                producer: producer.to_string(),
                written_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Commit all outputs of one worker, or none of them
    pub fn write_all(
        &mut self,
        outputs: BTreeMap<String, Value>,
        producer: &str,
    ) -> Result<(), ContextError> {
        if let Some((key, existing)) = outputs
            .keys()
            .find_map(|key| self.entries.get(key).map(|entry| (key, entry)))
        {
            return Err(ContextError::DuplicateKey {
                key: key.clone(),
                existing_producer: existing.producer.clone(),
                producer: producer.to_string(),
            });
        }

        for (key, value) in outputs {
            self.write(key, value, producer)?;
        }
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<&Value, ContextError> {
        self.entries
            .get(key)
            .map(|entry| &entry.value)
            .ok_or_else(|| ContextError::MissingKey {
                key: key.to_string(),
            })
    }

    pub fn entry(&self, key: &str) -> Option<&ContextEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        self.entries.clone()
    }

    pub fn into_snapshot(self) -> ContextSnapshot {
        self.entries
    }

    /// Build the read view handed to `worker`: seed keys plus outputs of its declared dependencies
    pub fn view_for(&self, worker: &str, dependencies: &[String]) -> ContextView {
        let mut visible = BTreeMap::new();
        let mut hidden = BTreeMap::new();

        for (key, entry) in &self.entries {
            let allowed = entry.producer == SEED_PRODUCER
                || dependencies.iter().any(|dep| *dep == entry.producer);
            if allowed {
                visible.insert(key.clone(), entry.value.clone());
            } else {
                hidden.insert(key.clone(), entry.producer.clone());
            }
        }

        ContextView {
            worker: worker.to_string(),
            visible,
            hidden,
            accessed: Mutex::new(BTreeSet::new()),
        }
    }
}

/// Read-only view of the run context restricted to a worker's declared dependencies.
///
/// Every read is recorded so tests can assert a worker only touched the keys it is
/// entitled to.
#[derive(Debug)]
pub struct ContextView {
    worker: String,
    visible: BTreeMap<String, Value>,
    /// key -> producer for entries the worker is not allowed to see
    hidden: BTreeMap<String, String>,
    accessed: Mutex<BTreeSet<String>>,
}

impl ContextView {
    /// Standalone view over the given values, for exercising a worker outside a run
    pub fn detached(worker: &str, values: BTreeMap<String, Value>) -> Self {
        Self {
            worker: worker.to_string(),
            visible: values,
            hidden: BTreeMap::new(),
            accessed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Read a key that must be present
    pub fn read(&self, key: &str) -> Result<&Value, ContextError> {
        self.read_optional(key)?
            .ok_or_else(|| ContextError::MissingKey {
                key: key.to_string(),
            })
    }

    /// Read a key that may legitimately be absent (e.g. output of an optional dependency)
    pub fn read_optional(&self, key: &str) -> Result<Option<&Value>, ContextError> {
        self.record(key);

        if let Some(producer) = self.hidden.get(key) {
            return Err(ContextError::UndeclaredRead {
                worker: self.worker.clone(),
                key: key.to_string(),
                producer: producer.clone(),
            });
        }
        Ok(self.visible.get(key))
    }

    /// Keys this worker is allowed to read
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.visible.keys().map(String::as_str)
    }

    /// Every key read through this view so far
    pub fn accessed_keys(&self) -> BTreeSet<String> {
        self.accessed
            .lock()
            .map(|set| set.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn record(&self, key: &str) {
        let mut accessed = match self.accessed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        accessed.insert(key.to_string());
    }
}
