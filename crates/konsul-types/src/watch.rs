//! Watch events emitted by the stores and fanned out by the watch manager.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Set {
        key: String,
        value: String,
        old_value: Option<String>,
        timestamp_ms: u64,
    },
    Delete {
        key: String,
        old_value: Option<String>,
        timestamp_ms: u64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Set { key, .. } => key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    /// The metric label for `watch_events_total{type}`.
    pub fn type_label(&self) -> &'static str {
        match self {
            WatchEvent::Set { .. } => "set",
            WatchEvent::Delete { .. } => "delete",
        }
    }
}
