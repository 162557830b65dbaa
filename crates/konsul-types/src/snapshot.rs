//! The snapshot blob format.
//!
//! A snapshot is a self-describing record containing a deep copy of both
//! stores plus their global indices. On the wire it is encoded as
//! newline-delimited JSON records (one `SnapshotRecord` per line), a
//! line-oriented format that can be streamed record-by-record instead of
//! held entirely in memory.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::kv::KvEntrySnapshot;
use crate::service::ServiceEntrySnapshot;

/// One line of a streamed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotRecord {
    Kv { key: String, entry: KvEntrySnapshot },
    Service { name: String, entry: ServiceEntrySnapshot },
    KvIndex { value: u64 },
    ServiceIndex { value: u64 },
}

/// The fully materialized snapshot, used by `GetAllData`/`RestoreFromSnapshot`
/// and by the in-memory `Snapshot()`/`Restore()` path of the state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotBlob {
    pub kv_data: BTreeMap<String, KvEntrySnapshot>,
    pub service_data: BTreeMap<String, ServiceEntrySnapshot>,
    pub kv_index: u64,
    pub service_index: u64,
}

impl SnapshotBlob {
    /// Serializes to the newline-delimited wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, entry) in &self.kv_data {
            let rec = SnapshotRecord::Kv {
                key: key.clone(),
                entry: entry.clone(),
            };
            Self::push_line(&mut out, &rec);
        }
        for (name, entry) in &self.service_data {
            let rec = SnapshotRecord::Service {
                name: name.clone(),
                entry: entry.clone(),
            };
            Self::push_line(&mut out, &rec);
        }
        Self::push_line(&mut out, &SnapshotRecord::KvIndex { value: self.kv_index });
        Self::push_line(
            &mut out,
            &SnapshotRecord::ServiceIndex {
                value: self.service_index,
            },
        );
        out
    }

    fn push_line(out: &mut Vec<u8>, rec: &SnapshotRecord) {
        // Infallible: every field type here is JSON-representable.
        let line = serde_json::to_vec(rec).expect("snapshot record is always serializable");
        out.extend_from_slice(&line);
        out.push(b'\n');
    }

    /// Parses the newline-delimited wire format back into a `SnapshotBlob`.
    /// A malformed line produces a `decode` error; the rest of the
    /// stream is not inspected once one is found.
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let mut blob = SnapshotBlob::default();

        for line in bytes.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let rec: SnapshotRecord = serde_json::from_slice(line)
                .map_err(|e| crate::KonsulError::decode(format!("snapshot record: {e}")))?;

            match rec {
                SnapshotRecord::Kv { key, entry } => {
                    blob.kv_data.insert(key, entry);
                }
                SnapshotRecord::Service { name, entry } => {
                    blob.service_data.insert(name, entry);
                }
                SnapshotRecord::KvIndex { value } => blob.kv_index = value,
                SnapshotRecord::ServiceIndex { value } => blob.service_index = value,
            }
        }

        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_empty_blob() {
        let blob = SnapshotBlob::default();
        let bytes = blob.encode();
        let decoded = SnapshotBlob::decode(&bytes).unwrap();
        assert_eq!(decoded.kv_data.len(), 0);
        assert_eq!(decoded.service_data.len(), 0);
    }

    #[test]
    fn round_trips_populated_blob() {
        let mut blob = SnapshotBlob {
            kv_index: 7,
            service_index: 3,
            ..Default::default()
        };
        blob.kv_data.insert(
            "a".to_string(),
            KvEntrySnapshot {
                value: "1".to_string(),
                flags: 0,
                create_index: 1,
                modify_index: 7,
            },
        );

        let bytes = blob.encode();
        let decoded = SnapshotBlob::decode(&bytes).unwrap();
        assert_eq!(decoded.kv_index, 7);
        assert_eq!(decoded.service_index, 3);
        assert_eq!(decoded.kv_data.get("a").unwrap().modify_index, 7);
    }

    #[test]
    fn rejects_malformed_line() {
        let err = SnapshotBlob::decode(b"not json\n").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decode);
    }
}
