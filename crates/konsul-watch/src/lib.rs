//! The watch manager: pattern-matched fan-out of store
//! change events to subscribers, gated by per-client quotas and (if an
//! evaluator is attached) ACL read permission on the changed key.

mod manager;
mod pattern;

pub use manager::Transport;
pub use manager::WatchManager;
pub use manager::Watcher;
pub use manager::WatcherId;
pub use manager::DEFAULT_BUFFER_SIZE;
pub use pattern::matches as pattern_matches;
