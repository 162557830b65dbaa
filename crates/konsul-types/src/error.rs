//! The error taxonomy from which every public API in the core draws.
//!
//! Error *kinds* are abstract categories; `KonsulError`
//! is the concrete `thiserror` enum that carries the structured fields
//! each kind needs. Nothing in this crate ever panics or silently
//! swallows an error on a mutation path; the one documented exception is
//! the watch pipeline dropping events on a full queue, which is handled
//! in `konsul-watch`, not here.

use thiserror::Error;

/// The abstract error category, used by callers that want to branch on
/// "what kind of thing happened" without matching every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    CasConflict,
    Validation,
    NotLeader,
    TooManyWatchers,
    Timeout,
    Shutdown,
    Decode,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::CasConflict => "cas-conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::NotLeader => "not-leader",
            ErrorKind::TooManyWatchers => "too-many-watchers",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Decode => "decode",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum KonsulError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("cas conflict on {key}: expected {expected}, current {current}")]
    CasConflict {
        key: String,
        expected: u64,
        current: u64,
    },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("not leader{}", leader_addr.as_ref().map(|a| format!(", leader at {a}")).unwrap_or_default())]
    NotLeader {
        leader_id: Option<u64>,
        leader_addr: Option<String>,
    },

    #[error("too many watchers for user {user_id}: limit {limit}")]
    TooManyWatchers { user_id: String, limit: usize },

    #[error("operation timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("node is shutting down")]
    Shutdown,

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("internal invariant violation: {message}")]
    Internal { message: String },
}

impl KonsulError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KonsulError::NotFound { .. } => ErrorKind::NotFound,
            KonsulError::CasConflict { .. } => ErrorKind::CasConflict,
            KonsulError::Validation { .. } => ErrorKind::Validation,
            KonsulError::NotLeader { .. } => ErrorKind::NotLeader,
            KonsulError::TooManyWatchers { .. } => ErrorKind::TooManyWatchers,
            KonsulError::Timeout { .. } => ErrorKind::Timeout,
            KonsulError::Shutdown => ErrorKind::Shutdown,
            KonsulError::Decode { .. } => ErrorKind::Decode,
            KonsulError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        KonsulError::NotFound { key: key.into() }
    }

    pub fn cas_conflict(key: impl Into<String>, expected: u64, current: u64) -> Self {
        KonsulError::CasConflict {
            key: key.into(),
            expected,
            current,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        KonsulError::Validation {
            message: message.into(),
        }
    }

    pub fn not_leader(leader_id: Option<u64>, leader_addr: Option<String>) -> Self {
        KonsulError::NotLeader {
            leader_id,
            leader_addr,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        KonsulError::Decode {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        KonsulError::Internal {
            message: message.into(),
        }
    }
}
