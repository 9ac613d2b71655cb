use crate::error::Result;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// The local collection holding one row per tracked slave.
pub const SLAVES_NS: &str = "local.slaves";

/// A local, non-replicated collection store with an upsert primitive.
/// Implemented by the node's storage layer; writes here never enter the
/// operation log.
pub trait LocalStore: Send + Sync {
    /// Updates the first row matching every field of `key` in the given
    /// namespace, or inserts a new one when none matches. An update with a
    /// `$set` subdocument merges those fields into the row (the inserted
    /// row being the key fields plus the `$set` fields); any other update
    /// document replaces the matched row wholesale.
    fn upsert(&self, ns: &str, key: &Value, update: &Value) -> Result<()>;
}

/// An in-memory collection store, used by standalone nodes and tests. Rows
/// are not persisted across restarts.
#[derive(Debug, Default)]
pub struct Memory {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl Memory {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all rows of a namespace, in insertion order.
    pub fn rows(&self, ns: &str) -> Result<Vec<Value>> {
        Ok(self.collections.lock()?.get(ns).cloned().unwrap_or_default())
    }
}

impl LocalStore for Memory {
    fn upsert(&self, ns: &str, key: &Value, update: &Value) -> Result<()> {
        let mut collections = self.collections.lock()?;
        let rows = collections.entry(ns.to_string()).or_default();
        match rows.iter().position(|row| matches(row, key)) {
            Some(i) => apply(&mut rows[i], update),
            None => {
                let mut row = key.clone();
                apply(&mut row, update);
                rows.push(row);
            }
        }
        Ok(())
    }
}

/// Returns true if the row contains every field of the key.
fn matches(row: &Value, key: &Value) -> bool {
    match key.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| row.get(k) == Some(v)),
        None => row == key,
    }
}

/// Applies an update document to a row: `$set` fields are merged into the
/// row, while a plain document replaces it.
fn apply(row: &mut Value, update: &Value) {
    match update.get("$set").and_then(Value::as_object) {
        Some(fields) => {
            if let Some(row) = row.as_object_mut() {
                for (k, v) in fields {
                    row.insert(k.clone(), v.clone());
                }
            }
        }
        None => *row = update.clone(),
    }
}
