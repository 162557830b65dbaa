//! The versioned KV store.
//!
//! Every mutating method has a `_local` twin that skips the persistence
//! sink callback. The replicated state machine calls the `_local` methods
//! through `KvApplyApi`; single-node/direct handler paths call the
//! non-local methods, which additionally invoke the configured
//! `PersistenceSink` after the in-memory state has changed. Watch events
//! are emitted by both.

mod store;

pub use store::KvStore;
