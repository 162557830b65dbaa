//! The versioned service-registry entry, its secondary-index keys, and the
//! TTL-driven health-check definitions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// `konsul_`-prefixed and `_`-prefixed meta keys are reserved for internal
/// use and rejected by validation.
pub const RESERVED_META_PREFIXES: &[&str] = &["konsul_", "_"];

pub const MAX_TAGS: usize = 64;
pub const MAX_TAG_LEN: usize = 255;
pub const MAX_META_ENTRIES: usize = 64;
pub const MAX_META_KEY_LEN: usize = 128;
pub const MAX_META_VALUE_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}

impl Default for CheckStatus {
    fn default() -> Self {
        CheckStatus::Critical
    }
}

/// A TTL-style health check attached to a service.
///
/// Script/HTTP checks are not implemented: they require outbound network
/// I/O, which is an external-collaborator concern, not core state-machine
/// logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDefinition {
    pub check_id: String,
    pub name: String,
    pub ttl_secs: u64,
    pub status: CheckStatus,
    pub output: String,
    pub updated_at: u64,
}

impl CheckDefinition {
    pub fn new(check_id: impl Into<String>, name: impl Into<String>, ttl: Duration, now_ms: u64) -> Self {
        CheckDefinition {
            check_id: check_id.into(),
            name: name.into(),
            ttl_secs: ttl.as_secs(),
            status: CheckStatus::Critical,
            output: String::new(),
            updated_at: now_ms,
        }
    }

    /// The status a reader should observe: `Critical` if the TTL has
    /// elapsed since the last update, regardless of the stored status.
    pub fn effective_status(&self, now_ms: u64) -> CheckStatus {
        let ttl_ms = self.ttl_secs.saturating_mul(1000);
        if now_ms.saturating_sub(self.updated_at) > ttl_ms {
            CheckStatus::Critical
        } else {
            self.status
        }
    }
}

/// A registered service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: BTreeMap<String, String>,
    pub checks: Vec<CheckDefinition>,
    pub expires_at_ms: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl ServiceEntry {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// A service entry as carried in a snapshot blob. Tolerates absent
/// `tags`/`meta`/`checks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntrySnapshot {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
    pub expires_at_ms: u64,
    pub create_index: u64,
    pub modify_index: u64,
}

impl From<&ServiceEntry> for ServiceEntrySnapshot {
    fn from(e: &ServiceEntry) -> Self {
        ServiceEntrySnapshot {
            name: e.name.clone(),
            address: e.address.clone(),
            port: e.port,
            tags: e.tags.clone(),
            meta: e.meta.clone(),
            checks: e.checks.clone(),
            expires_at_ms: e.expires_at_ms,
            create_index: e.create_index,
            modify_index: e.modify_index,
        }
    }
}

impl From<ServiceEntrySnapshot> for ServiceEntry {
    fn from(s: ServiceEntrySnapshot) -> Self {
        ServiceEntry {
            name: s.name,
            address: s.address,
            port: s.port,
            tags: s.tags,
            meta: s.meta,
            checks: s.checks,
            expires_at_ms: s.expires_at_ms,
            create_index: s.create_index,
            modify_index: s.modify_index,
        }
    }
}

/// The registration request a client submits; distinct from `ServiceEntry`
/// because it carries no index/expiry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}
