//! The state machine's per-entry apply response.
//!
//! Every apply outcome is flattened into one serializable shape so it can
//! travel back through `Raft::client_write`'s response channel. `KonsulError`
//! itself is not `Serialize` (it is a plain `thiserror` enum), so a
//! failed apply carries its `ErrorKind` label plus a display string instead
//! of the original error value.

use konsul_types::ErrorKind;
use konsul_types::KonsulError;
use konsul_types::KvEntry;
use konsul_types::ServiceEntry;
use serde::Deserialize;
use serde::Serialize;

/// The successful shapes an apply can produce. `Unit` covers deletes,
/// heartbeats that don't return the entry, membership changes and blank
/// (heartbeat) log entries; `Count` carries `cleanup_expired`'s removal
/// count, which nothing in the command set currently drives through Raft
/// but which the shape leaves room for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Unit,
    Kv(KvEntry),
    Service(ServiceEntry),
    Count(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyError {
    pub kind_label: String,
    pub message: String,
}

impl ApplyError {
    pub fn kind(&self) -> ErrorKind {
        match self.kind_label.as_str() {
            "not-found" => ErrorKind::NotFound,
            "cas-conflict" => ErrorKind::CasConflict,
            "validation" => ErrorKind::Validation,
            "not-leader" => ErrorKind::NotLeader,
            "too-many-watchers" => ErrorKind::TooManyWatchers,
            "timeout" => ErrorKind::Timeout,
            "shutdown" => ErrorKind::Shutdown,
            "decode" => ErrorKind::Decode,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<KonsulError> for ApplyError {
    fn from(err: KonsulError) -> Self {
        ApplyError {
            kind_label: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub result: Result<ApplyOutcome, ApplyError>,
}

impl ApplyResponse {
    pub fn ok(outcome: ApplyOutcome) -> Self {
        ApplyResponse { result: Ok(outcome) }
    }

    pub fn err(err: impl Into<ApplyError>) -> Self {
        ApplyResponse { result: Err(err.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}
