//! Device registry and its published snapshot
//!
//! A [`Registry`] is built privately by each sweep (scan, refresh, backup)
//! and only then handed to [`RegistryHandle::publish`]. Readers always get
//! an `Arc` to a complete registry: either the previous sweep's or the new
//! one, never a half-built one.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Open key/value status payload owned by the device
pub type StatusFields = Map<String, Value>;

/// Keys the node owns; a device payload never overwrites them
const RESERVED_KEYS: &[&str] = &["id", "ip"];

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    /// Address the device answered on during the last scan
    pub ip: Ipv4Addr,
    pub fields: StatusFields,
    pub backup_path: Option<PathBuf>,
    pub time_since_backup: Option<Duration>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            id: id.into(),
            ip,
            fields: StatusFields::new(),
            backup_path: None,
            time_since_backup: None,
        }
    }

    /// Adds new keys and overwrites existing ones. Keys missing from
    /// `update` are kept as they were.
    pub fn merge(&mut self, update: StatusFields) {
        for (key, value) in update {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.fields.insert(key, value);
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Running state reported by the device (`running`, `stopped`, ...)
    pub fn run_status(&self) -> Option<&str> {
        self.fields.get("status").and_then(Value::as_str)
    }

    /// Human machine name reported by the device, if any
    pub fn machine_name(&self) -> Option<&str> {
        self.fields
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    devices: HashMap<String, DeviceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record keyed by its id. A record with the same id is
    /// replaced and returned.
    pub fn insert(&mut self, record: DeviceRecord) -> Option<DeviceRecord> {
        self.devices.insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<DeviceRecord> {
        self.devices.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Ids in lexical order, for stable log output across sweeps
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl FromIterator<DeviceRecord> for Registry {
    fn from_iter<I: IntoIterator<Item = DeviceRecord>>(iter: I) -> Self {
        let mut registry = Registry::new();
        for record in iter {
            registry.insert(record);
        }
        registry
    }
}

/// Immutable view handed to readers
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub registry: Arc<Registry>,
    /// Completion time of the sweep that produced this registry
    pub swept_at: Option<OffsetDateTime>,
    /// Number of publications so far; 0 until the first sweep completes
    pub generation: u64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            swept_at: None,
            generation: 0,
        }
    }
}

/// Shared owner of the published registry
#[derive(Clone, Default)]
pub struct RegistryHandle {
    published: Arc<RwLock<Snapshot>>,
}

impl RegistryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.published.read().clone()
    }

    /// Replaces the visible registry wholesale
    pub fn publish(&self, registry: Registry) -> Snapshot {
        let mut published = self.published.write();
        published.registry = Arc::new(registry);
        published.swept_at = Some(OffsetDateTime::now_utc());
        published.generation += 1;
        published.clone()
    }

    /// Merges `fields` into one published record.
    ///
    /// Copy-on-write: snapshots already handed out keep their old record.
    /// Returns false when the id is no longer published.
    pub fn merge_fields(&self, id: &str, fields: StatusFields) -> bool {
        let mut published = self.published.write();
        if !published.registry.contains(id) {
            return false;
        }
        let registry = Arc::make_mut(&mut published.registry);
        match registry.get_mut(id) {
            Some(record) => {
                record.merge(fields);
                true
            }
            None => false,
        }
    }
}
