//! Types shared by every component of the replicated state machine:
//! the versioned KV and service entries, the ACL policy model, watch
//! events, the error taxonomy, and the self-describing Raft command
//! envelope that carries mutations from a client request into the log.

pub mod acl;
pub mod command;
pub mod error;
pub mod kv;
pub mod service;
pub mod snapshot;
pub mod watch;

pub use acl::Capability;
pub use acl::Policy;
pub use acl::Resource;
pub use command::Command;
pub use command::CommandPayload;
pub use error::ErrorKind;
pub use error::KonsulError;
pub use kv::KvEntry;
pub use service::CheckDefinition;
pub use service::CheckStatus;
pub use service::ServiceEntry;
pub use snapshot::SnapshotBlob;
pub use watch::WatchEvent;

/// Crate-wide result alias. Every fallible public API in the core returns
/// this rather than a bespoke per-module error type.
pub type Result<T> = std::result::Result<T, KonsulError>;

/// Returns the current time as Unix milliseconds.
///
/// Centralized so that determinism-sensitive callers (anything that ends
/// up inside a replicated command) are easy to audit: they must take a
/// timestamp as an argument instead of calling this directly.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
