//! The Raft node wrapper's own configuration.
//!
//! Kept separate from `konsul-config`'s layered startup configuration: that
//! crate parses TOML/env/CLI into this struct (plus everything else a node
//! needs), but validation of the Raft-specific invariants lives here, next
//! to the code that depends on them.

use std::path::PathBuf;
use std::time::Duration;

use konsul_types::KonsulError;
use konsul_types::Result;

/// Optional TLS material for the inter-node network transport. Peer
/// verification (mTLS) is enabled by supplying `client_ca_path`.
#[derive(Debug, Clone, Default)]
pub struct RaftTlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    pub node_id: u64,
    pub bind_addr: String,
    pub advertise_addr: String,
    pub data_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub snapshot_threshold_entries: u64,
    pub snapshot_retention: usize,
    pub bootstrap: bool,
    pub tls: Option<RaftTlsConfig>,
}

impl Default for RaftNodeConfig {
    fn default() -> Self {
        RaftNodeConfig {
            node_id: 1,
            bind_addr: "127.0.0.1:9701".to_string(),
            advertise_addr: "127.0.0.1:9701".to_string(),
            data_dir: PathBuf::from("./data"),
            heartbeat_interval: Duration::from_millis(250),
            election_timeout_min: Duration::from_millis(800),
            election_timeout_max: Duration::from_millis(1500),
            snapshot_threshold_entries: 10_000,
            snapshot_retention: 2,
            bootstrap: false,
            tls: None,
        }
    }
}

impl RaftNodeConfig {
    /// Validates the invariants named in : a non-zero node id, a
    /// parseable bind address, a writable data directory, and
    /// `election_timeout >= heartbeat_interval > 0` with a positive
    /// snapshot threshold. Returns the first violation found; never panics.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(KonsulError::validation("node_id must be non-zero"));
        }
        self.bind_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| KonsulError::validation(format!("invalid bind_addr '{}': {e}", self.bind_addr)))?;

        if self.heartbeat_interval.is_zero() {
            return Err(KonsulError::validation("heartbeat_interval must be positive"));
        }
        if self.election_timeout_min < self.heartbeat_interval {
            return Err(KonsulError::validation(
                "election_timeout_min must be >= heartbeat_interval",
            ));
        }
        if self.election_timeout_max < self.election_timeout_min {
            return Err(KonsulError::validation(
                "election_timeout_max must be >= election_timeout_min",
            ));
        }
        if self.snapshot_threshold_entries == 0 {
            return Err(KonsulError::validation("snapshot_threshold_entries must be positive"));
        }
        if self.snapshot_retention == 0 {
            return Err(KonsulError::validation("snapshot_retention must be positive"));
        }

        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| KonsulError::validation(format!("data_dir '{}' is not writable: {e}", self.data_dir.display())))?;
        }
        let probe = self.data_dir.join(".konsul-write-probe");
        std::fs::write(&probe, b"ok").map_err(|e| {
            KonsulError::validation(format!("data_dir '{}' is not writable: {e}", self.data_dir.display()))
        })?;
        let _ = std::fs::remove_file(&probe);

        Ok(())
    }

    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            cluster_name: "konsul".to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold_entries),
            max_in_snapshot_log_to_keep: self.snapshot_threshold_entries,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn base(dir: &std::path::Path) -> RaftNodeConfig {
        RaftNodeConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_is_valid_against_a_writable_dir() {
        let dir = tempdir().unwrap();
        assert!(base(dir.path()).validate().is_ok());
    }

    #[test]
    fn zero_node_id_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = base(dir.path());
        cfg.node_id = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unparseable_bind_addr_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = base(dir.path());
        cfg.bind_addr = "not-an-addr".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn election_timeout_below_heartbeat_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = base(dir.path());
        cfg.election_timeout_min = Duration::from_millis(10);
        cfg.heartbeat_interval = Duration::from_millis(250);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn election_timeout_max_below_min_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = base(dir.path());
        cfg.election_timeout_max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_snapshot_threshold_is_rejected() {
        let dir = tempdir().unwrap();
        let mut cfg = base(dir.path());
        cfg.snapshot_threshold_entries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_data_dir_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested/sub");
        let mut cfg = base(dir.path());
        cfg.data_dir = nested.clone();
        assert!(cfg.validate().is_ok());
        assert!(nested.exists());
    }
}
