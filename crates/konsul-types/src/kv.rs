//! The versioned KV entry.

use serde::Deserialize;
use serde::Serialize;

/// A single KV entry as stored by the KV store.
///
/// `create_index` is assigned once, on first insertion, and never changes
/// again. `modify_index` is reassigned on every successful mutation and is
/// unique across all entries in a given store. `flags` is opaque to the
/// store; it is preserved across CAS updates unless replaced explicitly by
/// `SetWithFlags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub value: String,
    pub flags: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl KvEntry {
    pub fn new(value: String, flags: u64, index: u64) -> Self {
        KvEntry {
            value,
            flags,
            create_index: index,
            modify_index: index,
        }
    }

    /// Builds the value for an in-place update: keeps `create_index`,
    /// bumps `modify_index`, and keeps `flags` unless `new_flags` is given.
    pub fn updated(&self, value: String, new_flags: Option<u64>, index: u64) -> Self {
        KvEntry {
            value,
            flags: new_flags.unwrap_or(self.flags),
            create_index: self.create_index,
            modify_index: index,
        }
    }
}

/// One KV item for `BatchSet`/`BatchSetCAS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvBatchItem {
    pub key: String,
    pub value: String,
    pub flags: u64,
}

/// A KV entry as carried in a snapshot blob. Restore tolerates an
/// absent `flags` field, defaulting it to 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntrySnapshot {
    pub value: String,
    #[serde(default)]
    pub flags: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl From<&KvEntry> for KvEntrySnapshot {
    fn from(e: &KvEntry) -> Self {
        KvEntrySnapshot {
            value: e.value.clone(),
            flags: e.flags,
            create_index: e.create_index,
            modify_index: e.modify_index,
        }
    }
}

impl From<KvEntrySnapshot> for KvEntry {
    fn from(s: KvEntrySnapshot) -> Self {
        KvEntry {
            value: s.value,
            flags: s.flags,
            create_index: s.create_index,
            modify_index: s.modify_index,
        }
    }
}
