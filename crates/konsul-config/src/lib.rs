//! Layered node configuration: a TOML file provides the base, CLI
//! flags and environment variables (via `clap`'s `env` attribute) override
//! it field by field, and a built-in default fills in anything left unset.
//! `NodeConfig::validate` checks every invariant before any
//! I/O happens, returning a typed error rather than panicking.

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use konsul_types::KonsulError;
use konsul_types::Result;
use serde::Deserialize;

/// CLI flags and their environment-variable aliases. Fields are left
/// `Option` so "not given on this layer" is distinguishable from "given
/// with this value" -- a flag's absence must fall through to the file
/// layer, not silently pick a default here.
#[derive(Parser, Debug, Default)]
#[command(name = "konsuld", about = "Replicated service-discovery and key-value coordination node")]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, env = "KONSUL_NODE_ID")]
    pub node_id: Option<u64>,
    #[arg(long, env = "KONSUL_BIND_ADDR")]
    pub bind_addr: Option<String>,
    #[arg(long, env = "KONSUL_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,
    #[arg(long, env = "KONSUL_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "KONSUL_BOOTSTRAP")]
    pub bootstrap: Option<bool>,

    #[arg(long, env = "KONSUL_TTL_DEFAULT_SECS")]
    pub ttl_default_secs: Option<u64>,
    #[arg(long, env = "KONSUL_WATCH_BUFFER_SIZE")]
    pub watch_buffer_size: Option<usize>,
    #[arg(long, env = "KONSUL_WATCHER_QUOTA_PER_CLIENT")]
    pub watcher_quota_per_client: Option<usize>,

    #[arg(long, env = "KONSUL_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: Option<u64>,
    #[arg(long, env = "KONSUL_ELECTION_TIMEOUT_MIN_MS")]
    pub election_timeout_min_ms: Option<u64>,
    #[arg(long, env = "KONSUL_ELECTION_TIMEOUT_MAX_MS")]
    pub election_timeout_max_ms: Option<u64>,
    #[arg(long, env = "KONSUL_SNAPSHOT_THRESHOLD_ENTRIES")]
    pub snapshot_threshold_entries: Option<u64>,
    #[arg(long, env = "KONSUL_SNAPSHOT_RETENTION")]
    pub snapshot_retention: Option<usize>,

    #[arg(long, env = "KONSUL_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,
    #[arg(long, env = "KONSUL_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
    #[arg(long, env = "KONSUL_TLS_CA_PATH")]
    pub tls_ca_path: Option<PathBuf>,
    #[arg(long, env = "KONSUL_TLS_MTLS")]
    pub tls_mtls: Option<bool>,
    #[arg(long, env = "KONSUL_TLS_MIN_VERSION")]
    pub tls_min_version: Option<String>,

    #[arg(long, env = "KONSUL_LOG_LEVEL")]
    pub log_level: Option<String>,
    #[arg(long, env = "KONSUL_LOG_FORMAT")]
    pub log_format: Option<String>,
}

/// The TOML file layer. Same fields as [`CliArgs`], minus `config` itself
/// (a file doesn't point at another file) and all `Option`, so a missing
/// key is simply absent from the parsed table.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    pub node_id: Option<u64>,
    pub bind_addr: Option<String>,
    pub advertise_addr: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub bootstrap: Option<bool>,

    pub ttl_default_secs: Option<u64>,
    pub watch_buffer_size: Option<usize>,
    pub watcher_quota_per_client: Option<usize>,

    pub heartbeat_interval_ms: Option<u64>,
    pub election_timeout_min_ms: Option<u64>,
    pub election_timeout_max_ms: Option<u64>,
    pub snapshot_threshold_entries: Option<u64>,
    pub snapshot_retention: Option<usize>,

    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_mtls: Option<bool>,
    pub tls_min_version: Option<String>,

    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KonsulError::validation(format!("reading config file '{}': {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| KonsulError::validation(format!("parsing config file '{}': {e}", path.display())))
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
    pub mtls: bool,
    pub min_version: String,
}

/// The fully resolved, validated configuration a node is started with.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub bind_addr: String,
    pub advertise_addr: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,

    pub ttl_default: Duration,
    pub watch_buffer_size: usize,
    pub watcher_quota_per_client: usize,

    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub snapshot_threshold_entries: u64,
    pub snapshot_retention: usize,

    pub tls: Option<TlsConfig>,

    pub log_level: String,
    pub log_format: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: 1,
            bind_addr: "127.0.0.1:9701".to_string(),
            advertise_addr: "127.0.0.1:9701".to_string(),
            data_dir: PathBuf::from("./data"),
            bootstrap: false,
            ttl_default: Duration::from_secs(30),
            watch_buffer_size: 1024,
            watcher_quota_per_client: 256,
            heartbeat_interval: Duration::from_millis(250),
            election_timeout_min: Duration::from_millis(800),
            election_timeout_max: Duration::from_millis(1500),
            snapshot_threshold_entries: 10_000,
            snapshot_retention: 2,
            tls: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

macro_rules! layer {
    ($default:expr, $file:expr, $cli:expr) => {
        $cli.or($file).unwrap_or($default)
    };
}

impl NodeConfig {
    /// Merges `cli` over `file` over the built-in default, field by field.
    /// `cli` already carries environment-variable values where clap's
    /// `env` attribute resolved one (CLI flag beats env var beats nothing),
    /// so this is really only a two-way merge: cli-or-env, then file.
    pub fn resolve(file: FileConfig, cli: CliArgs) -> Result<Self> {
        let d = NodeConfig::default();

        let tls = match (cli.tls_cert_path.or(file.tls_cert_path), cli.tls_key_path.or(file.tls_key_path)) {
            (None, None) => None,
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path,
                key_path,
                ca_path: cli.tls_ca_path.or(file.tls_ca_path),
                mtls: layer!(false, file.tls_mtls, cli.tls_mtls),
                min_version: layer!("1.2".to_string(), file.tls_min_version, cli.tls_min_version),
            }),
            _ => {
                return Err(KonsulError::validation(
                    "tls_cert_path and tls_key_path must both be set, or neither",
                ))
            }
        };

        let config = NodeConfig {
            node_id: layer!(d.node_id, file.node_id, cli.node_id),
            bind_addr: layer!(d.bind_addr, file.bind_addr, cli.bind_addr),
            advertise_addr: layer!(d.advertise_addr, file.advertise_addr, cli.advertise_addr),
            data_dir: layer!(d.data_dir, file.data_dir, cli.data_dir),
            bootstrap: layer!(d.bootstrap, file.bootstrap, cli.bootstrap),
            ttl_default: Duration::from_secs(layer!(d.ttl_default.as_secs(), file.ttl_default_secs, cli.ttl_default_secs)),
            watch_buffer_size: layer!(d.watch_buffer_size, file.watch_buffer_size, cli.watch_buffer_size),
            watcher_quota_per_client: layer!(
                d.watcher_quota_per_client,
                file.watcher_quota_per_client,
                cli.watcher_quota_per_client
            ),
            heartbeat_interval: Duration::from_millis(layer!(
                d.heartbeat_interval.as_millis() as u64,
                file.heartbeat_interval_ms,
                cli.heartbeat_interval_ms
            )),
            election_timeout_min: Duration::from_millis(layer!(
                d.election_timeout_min.as_millis() as u64,
                file.election_timeout_min_ms,
                cli.election_timeout_min_ms
            )),
            election_timeout_max: Duration::from_millis(layer!(
                d.election_timeout_max.as_millis() as u64,
                file.election_timeout_max_ms,
                cli.election_timeout_max_ms
            )),
            snapshot_threshold_entries: layer!(
                d.snapshot_threshold_entries,
                file.snapshot_threshold_entries,
                cli.snapshot_threshold_entries
            ),
            snapshot_retention: layer!(d.snapshot_retention, file.snapshot_retention, cli.snapshot_retention),
            tls,
            log_level: layer!(d.log_level, file.log_level, cli.log_level),
            log_format: layer!(d.log_format, file.log_format, cli.log_format),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parses CLI args (and, via clap, environment variables), reads the
    /// TOML file named by `--config`/`KONSUL_CONFIG` if any, resolves the
    /// three layers, and validates. Never panics; every failure mode
    /// returns `Err` before touching anything beyond the config file and a
    /// write-probe of the data directory.
    pub fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = CliArgs::try_parse_from(args).map_err(|e| KonsulError::validation(e.to_string()))?;
        let file = match &cli.config {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        NodeConfig::resolve(file, cli)
    }

    /// Validates the invariants: a non-zero node id, a
    /// parseable bind address, a writable data directory, positive and
    /// correctly ordered timeouts, a positive snapshot threshold/retention,
    /// a recognized log level/format, and (if TLS is configured) a
    /// recognized minimum TLS version.
    pub fn validate(&self) -> Result<()> {
        if self.node_id == 0 {
            return Err(KonsulError::validation("node_id must be non-zero"));
        }
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|e| KonsulError::validation(format!("invalid bind_addr '{}': {e}", self.bind_addr)))?;
        if self.advertise_addr.is_empty() {
            return Err(KonsulError::validation("advertise_addr must not be empty"));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(KonsulError::validation("heartbeat_interval must be positive"));
        }
        if self.election_timeout_min < self.heartbeat_interval {
            return Err(KonsulError::validation("election_timeout_min must be >= heartbeat_interval"));
        }
        if self.election_timeout_max < self.election_timeout_min {
            return Err(KonsulError::validation("election_timeout_max must be >= election_timeout_min"));
        }
        if self.snapshot_threshold_entries == 0 {
            return Err(KonsulError::validation("snapshot_threshold_entries must be positive"));
        }
        if self.snapshot_retention == 0 {
            return Err(KonsulError::validation("snapshot_retention must be positive"));
        }
        if self.watch_buffer_size == 0 {
            return Err(KonsulError::validation("watch_buffer_size must be positive"));
        }

        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(KonsulError::validation(format!("unrecognized log_level '{other}'"))),
        }
        match self.log_format.to_ascii_lowercase().as_str() {
            "text" | "json" => {}
            other => return Err(KonsulError::validation(format!("unrecognized log_format '{other}'"))),
        }

        if let Some(tls) = &self.tls {
            match tls.min_version.as_str() {
                "1.2" | "1.3" => {}
                other => return Err(KonsulError::validation(format!("unrecognized tls_min_version '{other}'"))),
            }
            if tls.mtls && tls.ca_path.is_none() {
                return Err(KonsulError::validation("tls_mtls requires tls_ca_path"));
            }
        }

        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| KonsulError::validation(format!("data_dir '{}' is not writable: {e}", self.data_dir.display())))?;
        }
        let probe = self.data_dir.join(".konsul-write-probe");
        std::fs::write(&probe, b"ok")
            .map_err(|e| KonsulError::validation(format!("data_dir '{}' is not writable: {e}", self.data_dir.display())))?;
        let _ = std::fs::remove_file(&probe);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut full = vec!["konsuld"];
        full.extend_from_slice(args);
        CliArgs::try_parse_from(full).unwrap()
    }

    fn with_data_dir(dir: &Path, extra: &[&str]) -> Result<NodeConfig> {
        let mut args = vec!["--data-dir", dir.to_str().unwrap()];
        args.extend_from_slice(extra);
        NodeConfig::resolve(FileConfig::default(), cli(&args))
    }

    #[test]
    fn defaults_resolve_to_a_valid_config() {
        let dir = tempdir().unwrap();
        let cfg = with_data_dir(dir.path(), &[]).unwrap();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.bind_addr, "127.0.0.1:9701");
    }

    #[test]
    fn cli_flag_overrides_file_value() {
        let dir = tempdir().unwrap();
        let file = FileConfig {
            node_id: Some(7),
            ..Default::default()
        };
        let cfg = NodeConfig::resolve(
            file,
            cli(&["--data-dir", dir.path().to_str().unwrap(), "--node-id", "42"]),
        )
        .unwrap();
        assert_eq!(cfg.node_id, 42);
    }

    #[test]
    fn file_value_is_used_when_cli_is_silent() {
        let dir = tempdir().unwrap();
        let file = FileConfig {
            node_id: Some(7),
            ..Default::default()
        };
        let cfg = NodeConfig::resolve(file, cli(&["--data-dir", dir.path().to_str().unwrap()])).unwrap();
        assert_eq!(cfg.node_id, 7);
    }

    #[test]
    fn zero_node_id_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(with_data_dir(dir.path(), &["--node-id", "0"]).is_err());
    }

    #[test]
    fn election_timeout_below_heartbeat_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(with_data_dir(
            dir.path(),
            &["--election-timeout-min-ms", "10", "--heartbeat-interval-ms", "250"]
        )
        .is_err());
    }

    #[test]
    fn unrecognized_log_level_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(with_data_dir(dir.path(), &["--log-level", "verbose"]).is_err());
    }

    #[test]
    fn tls_cert_without_key_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(with_data_dir(dir.path(), &["--tls-cert-path", "/tmp/cert.pem"]).is_err());
    }

    #[test]
    fn mtls_without_ca_path_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(with_data_dir(
            dir.path(),
            &[
                "--tls-cert-path",
                "/tmp/cert.pem",
                "--tls-key-path",
                "/tmp/key.pem",
                "--tls-mtls",
                "true",
            ]
        )
        .is_err());
    }

    #[test]
    fn toml_file_parses_known_fields() {
        let text = r#"
            node_id = 3
            bind_addr = "0.0.0.0:9701"
            watch_buffer_size = 2048
        "#;
        let file: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(file.node_id, Some(3));
        assert_eq!(file.bind_addr.as_deref(), Some("0.0.0.0:9701"));
        assert_eq!(file.watch_buffer_size, Some(2048));
    }
}
