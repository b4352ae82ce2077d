//! Shard inventory: which databases live on which MariaDB shard.
//!
//! Built by replaying events for two kinds: the shards themselves and the
//! databases pointing at them through `spec.mariaDbRef.name`. Database
//! events may arrive before their shard's; such databases are kept but the
//! shard is not a placement candidate until it has been seen labelled.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use wpo_store::{EventType, ManagedObject, WatchEvent};

/// One database hosted on a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRecord {
    pub name: String,
    pub namespace: String,
    pub spec: Value,
}

/// A shard and the databases it hosts.
#[derive(Debug, Clone, Default)]
pub struct ShardEntry {
    /// Last seen shard spec; `None` while the shard is not eligible.
    pub spec: Option<Value>,
    pub databases: Vec<DatabaseRecord>,
}

impl ShardEntry {
    pub fn load(&self) -> usize {
        self.databases.len()
    }

    pub fn is_eligible(&self) -> bool {
        self.spec.is_some()
    }
}

/// Per-namespace shard inventory.
#[derive(Debug, Default)]
pub struct ShardInventory {
    namespaces: BTreeMap<String, BTreeMap<String, ShardEntry>>,
}

impl ShardInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a shard event. Only shards carrying a truthy `label` are
    /// placement candidates.
    pub fn apply_shard_event(&mut self, event: &WatchEvent, label: &str) {
        let Some(namespace) = event.object.namespace() else {
            return;
        };
        let shard = event.object.name();
        let eligible = event.event_type != EventType::Deleted && is_truthy_label(&event.object, label);
        let shards = self.namespaces.entry(namespace.to_string()).or_default();
        if eligible {
            let entry = shards.entry(shard.to_string()).or_default();
            entry.spec = Some(event.object.spec().cloned().unwrap_or(Value::Null));
            debug!(%namespace, %shard, load = entry.load(), "shard available");
        } else if let Some(entry) = shards.get_mut(shard) {
            entry.spec = None;
            if entry.databases.is_empty() {
                shards.remove(shard);
            }
            debug!(%namespace, %shard, "shard withdrawn");
        }
    }

    /// Fold a database event.
    pub fn apply_database_event(&mut self, event: &WatchEvent) {
        let Some(namespace) = event.object.namespace() else {
            return;
        };
        let name = event.object.name();
        if event.event_type == EventType::Deleted {
            self.forget_database(namespace, name);
            return;
        }
        let Some(shard) = shard_ref(&event.object) else {
            debug!(%namespace, database = %name, "database without shard reference");
            return;
        };
        let record = DatabaseRecord {
            name: name.to_string(),
            namespace: namespace.to_string(),
            spec: event.object.spec().cloned().unwrap_or(Value::Null),
        };
        self.record_database(namespace, shard, record);
    }

    /// Put a database under `shard`, removing it from any other shard of
    /// the namespace. Returns false if it was already there.
    pub fn record_database(&mut self, namespace: &str, shard: &str, record: DatabaseRecord) -> bool {
        let shards = self.namespaces.entry(namespace.to_string()).or_default();
        for (other, entry) in shards.iter_mut() {
            if other != shard {
                entry.databases.retain(|d| d.name != record.name);
            }
        }
        let entry = shards.entry(shard.to_string()).or_default();
        if entry.databases.iter().any(|d| d.name == record.name) {
            return false;
        }
        entry.databases.push(record);
        true
    }

    /// Drop a database from whichever shard holds it.
    pub fn forget_database(&mut self, namespace: &str, database: &str) {
        if let Some(shards) = self.namespaces.get_mut(namespace) {
            for entry in shards.values_mut() {
                entry.databases.retain(|d| d.name != database);
            }
            shards.retain(|_, entry| entry.is_eligible() || !entry.databases.is_empty());
        }
    }

    /// Eligible shard with the fewest databases. Ties go to the shard
    /// whose name sorts first.
    pub fn least_loaded(&self, namespace: &str) -> Option<String> {
        self.namespaces
            .get(namespace)?
            .iter()
            .filter(|(_, entry)| entry.is_eligible())
            .min_by_key(|(_, entry)| entry.load())
            .map(|(name, _)| name.clone())
    }

    pub fn shard_of(&self, namespace: &str, database: &str) -> Option<String> {
        self.namespaces
            .get(namespace)?
            .iter()
            .find(|(_, entry)| entry.databases.iter().any(|d| d.name == database))
            .map(|(name, _)| name.clone())
    }

    pub fn load(&self, namespace: &str, shard: &str) -> usize {
        self.namespaces
            .get(namespace)
            .and_then(|shards| shards.get(shard))
            .map(ShardEntry::load)
            .unwrap_or(0)
    }

    /// `(shard, load)` for every eligible shard of a namespace.
    pub fn shard_loads(&self, namespace: &str) -> Vec<(String, usize)> {
        self.namespaces
            .get(namespace)
            .map(|shards| {
                shards
                    .iter()
                    .filter(|(_, entry)| entry.is_eligible())
                    .map(|(name, entry)| (name.clone(), entry.load()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shard a database object points at.
pub fn shard_ref(database: &ManagedObject) -> Option<&str> {
    database
        .field(&["spec", "mariaDbRef", "name"])
        .and_then(Value::as_str)
}

fn is_truthy_label(object: &ManagedObject, label: &str) -> bool {
    object
        .labels()
        .get(label)
        .is_some_and(|v| !matches!(v.to_ascii_lowercase().as_str(), "" | "false" | "0" | "no"))
}
