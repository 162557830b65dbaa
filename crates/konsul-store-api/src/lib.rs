//! Narrow capability traits that decouple the replicated state machine
//! (`konsul-raft-store`) from the concrete store implementations
//! (`konsul-kv`, `konsul-registry`).
//!
//! The FSM only ever sees a narrow surface (the `*Local` mutators plus `GetAllData`/
//! `RestoreFromSnapshot`), which lets tests substitute in-memory fakes and
//! keeps the door open for a future no-persistence mode without touching
//! the FSM at all.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use konsul_types::kv::KvEntrySnapshot;
use konsul_types::service::CheckDefinition;
use konsul_types::service::CheckStatus;
use konsul_types::service::ServiceEntrySnapshot;
use konsul_types::service::ServiceRegistration;
use konsul_types::watch::WatchEvent;
use konsul_types::KvEntry;
use konsul_types::Result;
use konsul_types::ServiceEntry;

/// The subset of the KV store the FSM is allowed to call.
#[async_trait]
pub trait KvApplyApi: Send + Sync {
    async fn set_local(&self, key: String, value: String) -> Result<KvEntry>;
    async fn set_with_flags_local(&self, key: String, value: String, flags: u64) -> Result<KvEntry>;
    async fn set_cas_local(
        &self,
        key: String,
        value: String,
        flags: Option<u64>,
        expected_index: u64,
    ) -> Result<KvEntry>;
    async fn delete_local(&self, key: &str) -> Result<()>;
    async fn delete_cas_local(&self, key: &str, expected_index: u64) -> Result<()>;
    async fn batch_set_local(&self, items: Vec<(String, String, u64)>) -> Result<()>;
    async fn batch_set_cas_local(&self, items: Vec<(String, String, u64, u64)>) -> Result<()>;
    async fn batch_delete_local(&self, keys: Vec<String>) -> Result<()>;
    async fn batch_delete_cas_local(&self, items: BTreeMap<String, u64>) -> Result<()>;
    async fn get_all_data(&self) -> BTreeMap<String, KvEntrySnapshot>;
    async fn restore_from_snapshot(&self, data: BTreeMap<String, KvEntrySnapshot>);
    async fn curr_index(&self) -> u64;
}

/// The subset of the service registry the FSM is allowed to call.
///
/// Every mutator that stamps a wall-clock-derived field (`expires_at_ms`,
/// a health check's `updated_at`) takes that timestamp as an explicit
/// `now_ms` parameter instead of reading the system clock itself: the FSM
/// passes the replicated command's own timestamp, so every replica derives
/// the same value from the same committed entry.
#[async_trait]
pub trait RegistryApplyApi: Send + Sync {
    async fn register_local(&self, reg: ServiceRegistration, now_ms: u64) -> Result<ServiceEntry>;
    async fn register_cas_local(&self, reg: ServiceRegistration, expected_index: u64, now_ms: u64) -> Result<ServiceEntry>;
    async fn deregister_local(&self, name: &str) -> Result<()>;
    async fn deregister_cas_local(&self, name: &str, expected_index: u64) -> Result<()>;
    async fn heartbeat_local(&self, name: &str, now_ms: u64) -> Result<ServiceEntry>;
    async fn cleanup_expired(&self) -> usize;
    async fn register_check_local(&self, service_name: &str, check: CheckDefinition) -> Result<()>;
    async fn update_check_status_local(
        &self,
        service_name: &str,
        check_id: &str,
        status: CheckStatus,
        output: String,
        now_ms: u64,
    ) -> Result<()>;
    async fn deregister_check_local(&self, service_name: &str, check_id: &str) -> Result<()>;
    async fn get_all_data(&self) -> BTreeMap<String, ServiceEntrySnapshot>;
    async fn restore_from_snapshot(&self, data: BTreeMap<String, ServiceEntrySnapshot>);
    async fn curr_index(&self) -> u64;
}

/// The seam that lets C1/C2 publish change events without owning the watch
/// manager. Stores hold a `Weak<dyn WatchNotifier>`: a relationship, never
/// ownership so teardown can go top-down
/// (manager closes subscribers, then stores are dropped) without a cycle.
pub trait WatchNotifier: Send + Sync {
    fn notify(&self, event: WatchEvent);
}

/// The optional persistence-to-disk collaborator named in Concrete
/// engines are out of scope for the core; this is the seam a single-node
/// deployment would plug one into. `NoopSink` is what every `*Local`
/// mutation path uses, and what the non-`Local` path falls back to when no
/// sink is configured.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn kv_set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn kv_delete(&self, key: &str) -> Result<()>;
    async fn kv_batch_set(&self, items: &[(String, Vec<u8>)]) -> Result<()>;
    async fn kv_batch_delete(&self, keys: &[String]) -> Result<()>;
    async fn service_set(&self, name: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn service_delete(&self, name: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl PersistenceSink for NoopSink {
    async fn kv_set(&self, _key: &str, _value: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn kv_delete(&self, _key: &str) -> Result<()> {
        Ok(())
    }
    async fn kv_batch_set(&self, _items: &[(String, Vec<u8>)]) -> Result<()> {
        Ok(())
    }
    async fn kv_batch_delete(&self, _keys: &[String]) -> Result<()> {
        Ok(())
    }
    async fn service_set(&self, _name: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Ok(())
    }
    async fn service_delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A sink exposing counter/gauge/histogram primitives. The core never
/// touches a metrics registry directly -- it calls through this trait
/// instead, so the concrete backend can be swapped without touching
/// any of the stores or the state machine.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: &[(&'static str, &str)]);
    fn set_gauge(&self, name: &'static str, labels: &[(&'static str, &str)], value: i64);
    fn observe_histogram(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn set_gauge(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: i64) {}
    fn observe_histogram(&self, _name: &'static str, _labels: &[(&'static str, &str)], _value: f64) {}
}
