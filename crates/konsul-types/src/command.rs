//! The replicated command envelope.
//!
//! A `Command` is what a client request turns into before it is handed to
//! the Raft node wrapper for replication. It is self-describing (the
//! variant tag travels with the payload) and its `serde_json` encoding is
//! deterministic for identical inputs, which is what state-machine
//! equivalence across replicas depends on. Unknown variants are rejected
//! with a `decode` error at apply time rather than silently skipped --
//! silently skipping would break deterministic replay.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::KonsulError;
use crate::service::ServiceRegistration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvBatchSetItem {
    pub key: String,
    pub value: String,
    pub flags: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvBatchCasItem {
    pub key: String,
    pub value: String,
    pub flags: u64,
    pub expected_index: u64,
}

/// One variant per mutation kind the state machine knows how to apply.
/// Payloads are typed, not opaque bytes, because `serde_json`'s tagged-enum
/// representation already gives a self-describing envelope for free.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandPayload {
    KvSet {
        key: String,
        value: String,
    },
    KvSetFlags {
        key: String,
        value: String,
        flags: u64,
    },
    KvSetCas {
        key: String,
        value: String,
        flags: Option<u64>,
        expected_index: u64,
    },
    KvDelete {
        key: String,
    },
    KvDeleteCas {
        key: String,
        expected_index: u64,
    },
    KvBatchSet {
        items: Vec<KvBatchSetItem>,
    },
    KvBatchSetCas {
        items: Vec<KvBatchCasItem>,
    },
    KvBatchDelete {
        keys: Vec<String>,
    },
    KvBatchDeleteCas {
        items: BTreeMap<String, u64>,
    },
    ServiceRegister {
        registration: ServiceRegistration,
    },
    ServiceRegisterCas {
        registration: ServiceRegistration,
        expected_index: u64,
    },
    ServiceDeregister {
        name: String,
    },
    ServiceDeregisterCas {
        name: String,
        expected_index: u64,
    },
    ServiceHeartbeat {
        name: String,
    },
    HealthTtlUpdate {
        service_name: String,
        check_id: String,
        status: crate::service::CheckStatus,
        output: String,
    },
    HealthCheckRegister {
        service_name: String,
        check_id: String,
        check_name: String,
        ttl_secs: u64,
    },
    HealthCheckDeregister {
        service_name: String,
        check_id: String,
    },
}

impl CommandPayload {
    /// Short tag used for the `raft_apply_total{command_type}` and
    /// `raft_apply_errors_total{command_type,error}` metric families.
    pub fn type_label(&self) -> &'static str {
        match self {
            CommandPayload::KvSet { .. } => "kv_set",
            CommandPayload::KvSetFlags { .. } => "kv_set_flags",
            CommandPayload::KvSetCas { .. } => "kv_set_cas",
            CommandPayload::KvDelete { .. } => "kv_delete",
            CommandPayload::KvDeleteCas { .. } => "kv_delete_cas",
            CommandPayload::KvBatchSet { .. } => "kv_batch_set",
            CommandPayload::KvBatchSetCas { .. } => "kv_batch_set_cas",
            CommandPayload::KvBatchDelete { .. } => "kv_batch_delete",
            CommandPayload::KvBatchDeleteCas { .. } => "kv_batch_delete_cas",
            CommandPayload::ServiceRegister { .. } => "service_register",
            CommandPayload::ServiceRegisterCas { .. } => "service_register_cas",
            CommandPayload::ServiceDeregister { .. } => "service_deregister",
            CommandPayload::ServiceDeregisterCas { .. } => "service_deregister_cas",
            CommandPayload::ServiceHeartbeat { .. } => "service_heartbeat",
            CommandPayload::HealthTtlUpdate { .. } => "health_ttl_update",
            CommandPayload::HealthCheckRegister { .. } => "health_check_register",
            CommandPayload::HealthCheckDeregister { .. } => "health_check_deregister",
        }
    }
}

/// The envelope carried by a Raft log entry's `Normal` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub timestamp_ms: u64,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(timestamp_ms: u64, payload: CommandPayload) -> Self {
        Command {
            timestamp_ms,
            payload,
        }
    }

    /// Deterministic, self-describing encoding: `serde_json` over a
    /// `BTreeMap`-backed struct representation serializes fields in a
    /// fixed declaration order, so identical inputs produce identical
    /// bytes on every replica.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| KonsulError::decode(e.to_string()))
    }

    /// Decodes a command previously produced by `encode`. An unknown
    /// `command` tag (e.g. from a newer build) surfaces as a `decode`
    /// error rather than being silently ignored, preserving the
    /// deterministic-replay property across mixed-version clusters.
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| KonsulError::decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_deterministic() {
        let cmd = Command::new(
            1_700_000_000_000,
            CommandPayload::KvSetCas {
                key: "a".into(),
                value: "1".into(),
                flags: None,
                expected_index: 0,
            },
        );

        let a = cmd.encode().unwrap();
        let b = cmd.encode().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let cmd = Command::new(
            42,
            CommandPayload::ServiceHeartbeat {
                name: "api".into(),
            },
        );
        let bytes = cmd.encode().unwrap();
        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded.timestamp_ms, 42);
        match decoded.payload {
            CommandPayload::ServiceHeartbeat { name } => assert_eq!(name, "api"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_variant_is_a_decode_error() {
        let bytes = br#"{"timestamp_ms":1,"command":"kv_teleport","key":"a"}"#;
        let err = Command::decode(bytes).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decode);
    }
}
