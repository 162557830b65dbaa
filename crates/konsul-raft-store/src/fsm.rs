//! The replicated state machine itself: applies a committed
//! [`CommandPayload`] to the KV store and the service registry through the
//! narrow `*ApplyApi` seams, and builds/restores the snapshot blob used by
//! both Raft snapshotting and (eventually) offline backup/restore.
//!
//! The FSM owns no Raft-specific bookkeeping (that lives one layer up, in
//! `state_machine.rs`) and only knows how to turn one command into one
//! store mutation.

use std::sync::Arc;
use std::time::Duration;

use konsul_store_api::KvApplyApi;
use konsul_store_api::MetricsSink;
use konsul_store_api::RegistryApplyApi;
use konsul_types::command::CommandPayload;
use konsul_types::snapshot::SnapshotBlob;
use konsul_types::CheckDefinition;

use crate::response::ApplyOutcome;
use crate::response::ApplyResponse;

pub struct Fsm {
    kv: Arc<dyn KvApplyApi>,
    registry: Arc<dyn RegistryApplyApi>,
    metrics: Arc<dyn MetricsSink>,
}

impl Fsm {
    pub fn new(kv: Arc<dyn KvApplyApi>, registry: Arc<dyn RegistryApplyApi>, metrics: Arc<dyn MetricsSink>) -> Self {
        Fsm { kv, registry, metrics }
    }

    /// Applies one committed command, turning its `Result` into the
    /// serializable `ApplyResponse` shape and recording the
    /// `raft_apply_total`/`raft_apply_errors_total`/
    /// `raft_apply_duration_seconds` metrics.
    ///
    /// `timestamp_ms` is the command's own replicated timestamp, not the
    /// wall clock of the node applying it: every field a mutation derives
    /// from "now" (TTL expiry, a health check's `updated_at`) must come out
    /// identical on every replica, so it is threaded through from here
    /// rather than read fresh per call.
    pub async fn apply_command(&self, payload: &CommandPayload, timestamp_ms: u64) -> ApplyResponse {
        let label = payload.type_label();
        let start = std::time::Instant::now();
        let response = self.dispatch(payload, timestamp_ms).await;

        self.metrics.incr_counter("raft_apply_total", &[("command", label)]);
        self.metrics
            .observe_histogram("raft_apply_duration_seconds", &[("command", label)], start.elapsed().as_secs_f64());
        if let Err(err) = &response.result {
            self.metrics
                .incr_counter("raft_apply_errors_total", &[("command", label), ("error", &err.kind_label)]);
        }

        response
    }

    async fn dispatch(&self, payload: &CommandPayload, timestamp_ms: u64) -> ApplyResponse {
        match payload {
            CommandPayload::KvSet { key, value } => {
                match self.kv.set_local(key.clone(), value.clone()).await {
                    Ok(entry) => ApplyResponse::ok(ApplyOutcome::Kv(entry)),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::KvSetFlags { key, value, flags } => {
                match self.kv.set_with_flags_local(key.clone(), value.clone(), *flags).await {
                    Ok(entry) => ApplyResponse::ok(ApplyOutcome::Kv(entry)),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::KvSetCas {
                key,
                value,
                flags,
                expected_index,
            } => match self.kv.set_cas_local(key.clone(), value.clone(), *flags, *expected_index).await {
                Ok(entry) => ApplyResponse::ok(ApplyOutcome::Kv(entry)),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::KvDelete { key } => match self.kv.delete_local(key).await {
                Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::KvDeleteCas { key, expected_index } => {
                match self.kv.delete_cas_local(key, *expected_index).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::KvBatchSet { items } => {
                let items = items.iter().map(|i| (i.key.clone(), i.value.clone(), i.flags)).collect();
                match self.kv.batch_set_local(items).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::KvBatchSetCas { items } => {
                let items = items
                    .iter()
                    .map(|i| (i.key.clone(), i.value.clone(), i.flags, i.expected_index))
                    .collect();
                match self.kv.batch_set_cas_local(items).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::KvBatchDelete { keys } => match self.kv.batch_delete_local(keys.clone()).await {
                Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::KvBatchDeleteCas { items } => {
                match self.kv.batch_delete_cas_local(items.clone()).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::ServiceRegister { registration } => {
                match self.registry.register_local(registration.clone(), timestamp_ms).await {
                    Ok(entry) => ApplyResponse::ok(ApplyOutcome::Service(entry)),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::ServiceRegisterCas {
                registration,
                expected_index,
            } => match self
                .registry
                .register_cas_local(registration.clone(), *expected_index, timestamp_ms)
                .await
            {
                Ok(entry) => ApplyResponse::ok(ApplyOutcome::Service(entry)),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::ServiceDeregister { name } => match self.registry.deregister_local(name).await {
                Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::ServiceDeregisterCas { name, expected_index } => {
                match self.registry.deregister_cas_local(name, *expected_index).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::ServiceHeartbeat { name } => match self.registry.heartbeat_local(name, timestamp_ms).await {
                Ok(entry) => ApplyResponse::ok(ApplyOutcome::Service(entry)),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::HealthTtlUpdate {
                service_name,
                check_id,
                status,
                output,
            } => match self
                .registry
                .update_check_status_local(service_name, check_id, *status, output.clone(), timestamp_ms)
                .await
            {
                Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                Err(err) => ApplyResponse::err(err),
            },
            CommandPayload::HealthCheckRegister {
                service_name,
                check_id,
                check_name,
                ttl_secs,
            } => {
                let check = CheckDefinition::new(
                    check_id.clone(),
                    check_name.clone(),
                    Duration::from_secs(*ttl_secs),
                    timestamp_ms,
                );
                match self.registry.register_check_local(service_name, check).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
            CommandPayload::HealthCheckDeregister { service_name, check_id } => {
                match self.registry.deregister_check_local(service_name, check_id).await {
                    Ok(()) => ApplyResponse::ok(ApplyOutcome::Unit),
                    Err(err) => ApplyResponse::err(err),
                }
            }
        }
    }

    /// Materializes a full snapshot of both stores.
    pub async fn build_snapshot(&self) -> SnapshotBlob {
        SnapshotBlob {
            kv_data: self.kv.get_all_data().await,
            service_data: self.registry.get_all_data().await,
            kv_index: self.kv.curr_index().await,
            service_index: self.registry.curr_index().await,
        }
    }

    /// Replaces both stores' contents with `blob` (installed snapshot or
    /// restored backup).
    pub async fn restore_snapshot(&self, blob: SnapshotBlob) {
        self.kv.restore_from_snapshot(blob.kv_data).await;
        self.registry.restore_from_snapshot(blob.service_data).await;
    }

    /// A cheap clone of the configured metrics sink, for collaborators
    /// (the openraft snapshot builder) that record metrics outside of
    /// `apply_command`.
    pub(crate) fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use konsul_store_api::NoopMetrics;
    use konsul_types::kv::KvEntrySnapshot;
    use konsul_types::service::ServiceEntrySnapshot;
    use konsul_types::service::ServiceRegistration;
    use konsul_types::Result;
    use konsul_types::ServiceEntry;

    use super::*;

    // A pair of minimal fakes so the dispatch table can be exercised without
    // pulling in konsul-kv/konsul-registry as dev-dependencies (would be a
    // circular workspace dependency since those crates don't depend back on
    // this one, but keeping the fsm tests self-contained here documents the
    // dispatch contract directly against the trait surface).
    #[derive(Default)]
    struct FakeKv {
        last_set: tokio::sync::Mutex<Option<(String, String)>>,
    }

    #[async_trait]
    impl KvApplyApi for FakeKv {
        async fn set_local(&self, key: String, value: String) -> Result<konsul_types::KvEntry> {
            *self.last_set.lock().await = Some((key.clone(), value.clone()));
            Ok(konsul_types::KvEntry {
                value,
                flags: 0,
                create_index: 1,
                modify_index: 1,
            })
        }
        async fn set_with_flags_local(&self, _key: String, value: String, flags: u64) -> Result<konsul_types::KvEntry> {
            Ok(konsul_types::KvEntry {
                value,
                flags,
                create_index: 1,
                modify_index: 1,
            })
        }
        async fn set_cas_local(
            &self,
            _key: String,
            value: String,
            flags: Option<u64>,
            _expected_index: u64,
        ) -> Result<konsul_types::KvEntry> {
            Ok(konsul_types::KvEntry {
                value,
                flags: flags.unwrap_or(0),
                create_index: 1,
                modify_index: 1,
            })
        }
        async fn delete_local(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_cas_local(&self, _key: &str, _expected_index: u64) -> Result<()> {
            Ok(())
        }
        async fn batch_set_local(&self, _items: Vec<(String, String, u64)>) -> Result<()> {
            Ok(())
        }
        async fn batch_set_cas_local(&self, _items: Vec<(String, String, u64, u64)>) -> Result<()> {
            Ok(())
        }
        async fn batch_delete_local(&self, _keys: Vec<String>) -> Result<()> {
            Ok(())
        }
        async fn batch_delete_cas_local(&self, _items: BTreeMap<String, u64>) -> Result<()> {
            Ok(())
        }
        async fn get_all_data(&self) -> BTreeMap<String, KvEntrySnapshot> {
            BTreeMap::new()
        }
        async fn restore_from_snapshot(&self, _data: BTreeMap<String, KvEntrySnapshot>) {}
        async fn curr_index(&self) -> u64 {
            0
        }
    }

    #[derive(Default)]
    struct FakeRegistry;

    #[async_trait]
    impl RegistryApplyApi for FakeRegistry {
        async fn register_local(&self, reg: ServiceRegistration, _now_ms: u64) -> Result<ServiceEntry> {
            Ok(ServiceEntry {
                name: reg.name,
                address: reg.address,
                port: reg.port,
                tags: reg.tags,
                meta: reg.meta,
                checks: vec![],
                expires_at_ms: u64::MAX,
                create_index: 1,
                modify_index: 1,
            })
        }
        async fn register_cas_local(&self, reg: ServiceRegistration, _expected_index: u64, now_ms: u64) -> Result<ServiceEntry> {
            self.register_local(reg, now_ms).await
        }
        async fn deregister_local(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn deregister_cas_local(&self, _name: &str, _expected_index: u64) -> Result<()> {
            Ok(())
        }
        async fn heartbeat_local(&self, name: &str, _now_ms: u64) -> Result<ServiceEntry> {
            Ok(ServiceEntry {
                name: name.to_string(),
                address: "127.0.0.1".to_string(),
                port: 1,
                tags: vec![],
                meta: BTreeMap::new(),
                checks: vec![],
                expires_at_ms: u64::MAX,
                create_index: 1,
                modify_index: 2,
            })
        }
        async fn cleanup_expired(&self) -> usize {
            0
        }
        async fn register_check_local(&self, _service_name: &str, _check: CheckDefinition) -> Result<()> {
            Ok(())
        }
        async fn update_check_status_local(
            &self,
            _service_name: &str,
            _check_id: &str,
            _status: konsul_types::service::CheckStatus,
            _output: String,
            _now_ms: u64,
        ) -> Result<()> {
            Ok(())
        }
        async fn deregister_check_local(&self, _service_name: &str, _check_id: &str) -> Result<()> {
            Ok(())
        }
        async fn get_all_data(&self) -> BTreeMap<String, ServiceEntrySnapshot> {
            BTreeMap::new()
        }
        async fn restore_from_snapshot(&self, _data: BTreeMap<String, ServiceEntrySnapshot>) {}
        async fn curr_index(&self) -> u64 {
            0
        }
    }

    fn fsm() -> Fsm {
        Fsm::new(Arc::new(FakeKv::default()), Arc::new(FakeRegistry), Arc::new(NoopMetrics))
    }

    #[tokio::test]
    async fn kv_set_dispatches_to_the_kv_store() {
        let f = fsm();
        let resp = f
            .apply_command(
                &CommandPayload::KvSet {
                    key: "a".into(),
                    value: "1".into(),
                },
                1_700_000_000_000,
            )
            .await;
        assert!(resp.is_ok());
        assert!(matches!(resp.result.unwrap(), ApplyOutcome::Kv(_)));
    }

    #[tokio::test]
    async fn service_register_dispatches_to_the_registry() {
        let f = fsm();
        let resp = f
            .apply_command(
                &CommandPayload::ServiceRegister {
                    registration: ServiceRegistration {
                        name: "api".into(),
                        address: "127.0.0.1".into(),
                        port: 8080,
                        tags: vec![],
                        meta: BTreeMap::new(),
                    },
                },
                1_700_000_000_000,
            )
            .await;
        assert!(resp.is_ok());
        assert!(matches!(resp.result.unwrap(), ApplyOutcome::Service(_)));
    }

    #[tokio::test]
    async fn unit_variants_produce_unit_outcome() {
        let f = fsm();
        let resp = f
            .apply_command(&CommandPayload::KvDelete { key: "a".into() }, 1_700_000_000_000)
            .await;
        assert!(matches!(resp.result.unwrap(), ApplyOutcome::Unit));
    }
}
