//! Entry point for a single konsul cluster node.
//!
//! Wires together the node's configuration (`konsul-config`), the two
//! replicated stores and the watch manager (`konsul-kv`/`konsul-registry`/
//! `konsul-watch`), the ACL evaluator (`konsul-acl`), the metrics seam
//! (`konsul-store-api::MetricsSink`, backed here by `prometheus-client`), and
//! the Raft node wrapper (`konsul-raft`) that replicates mutations across
//! the cluster. Everything an external collaborator would normally sit in
//! front of this node -- HTTP/GraphQL handlers, auth middleware, the admin
//! UI -- is out of scope here; this binary only brings the core up and
//! keeps it running until asked to stop.

#[path = "konsuld/metrics.rs"]
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use konsul_acl::AclEvaluator;
use konsul_config::NodeConfig;
use konsul_kv::KvStore;
use konsul_raft::RaftNode;
use konsul_raft::RaftNodeConfig;
use konsul_raft::RaftTlsConfig;
use konsul_raft::ServerTlsConfig;
use konsul_registry::ServiceRegistry;
use konsul_store_api::MetricsSink;
use konsul_store_api::NoopSink;
use konsul_watch::WatchManager;
use log::error;
use log::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = match NodeConfig::load_from(std::env::args()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("konsuld: configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&cfg);
    info!(
        "konsuld: starting node {} (bind {}, advertise {}, bootstrap {})",
        cfg.node_id, cfg.bind_addr, cfg.advertise_addr, cfg.bootstrap
    );

    let (metrics_sink, _registry) = metrics::PrometheusMetrics::new();
    let metrics: Arc<dyn MetricsSink> = Arc::new(metrics_sink);

    let acl = Arc::new(AclEvaluator::with_metrics(metrics.clone()));

    let kv = Arc::new(KvStore::new(Arc::new(NoopSink)));
    let registry = Arc::new(ServiceRegistry::new(cfg.ttl_default, Arc::new(NoopSink)));

    let watch = Arc::new(WatchManager::with_metrics(
        cfg.watch_buffer_size,
        cfg.watcher_quota_per_client,
        Some(acl.clone()),
        metrics.clone(),
    ));
    // Weak: the stores never keep the watch manager alive.
    kv.set_watch_notifier(Arc::downgrade(&watch)).await;

    let raft_node = RaftNode::start(to_raft_config(&cfg), kv.clone(), registry.clone(), metrics.clone()).await?;

    let server_tls = build_server_tls(&cfg)?;
    let shutdown_rx = raft_node.shutdown_signal();
    let raft_handle = raft_node.raft_handle();
    let bind_addr = raft_node.bind_addr().to_string();
    let listener = tokio::spawn(async move {
        if let Err(e) = konsul_raft::server::serve(&bind_addr, server_tls, raft_handle, shutdown_rx).await {
            error!("konsuld: network listener failed: {e}");
        }
    });

    wait_for_shutdown_signal().await;

    info!("konsuld: shutdown signal received, stopping node {}", raft_node.node_id());
    raft_node.shutdown(Duration::from_secs(5)).await?;
    let _ = listener.await;

    Ok(())
}

fn to_raft_config(cfg: &NodeConfig) -> RaftNodeConfig {
    RaftNodeConfig {
        node_id: cfg.node_id,
        bind_addr: cfg.bind_addr.clone(),
        advertise_addr: cfg.advertise_addr.clone(),
        data_dir: cfg.data_dir.clone(),
        heartbeat_interval: cfg.heartbeat_interval,
        election_timeout_min: cfg.election_timeout_min,
        election_timeout_max: cfg.election_timeout_max,
        snapshot_threshold_entries: cfg.snapshot_threshold_entries,
        snapshot_retention: cfg.snapshot_retention,
        bootstrap: cfg.bootstrap,
        tls: cfg.tls.as_ref().map(|tls| RaftTlsConfig {
            cert_path: tls.cert_path.clone(),
            key_path: tls.key_path.clone(),
            client_ca_path: if tls.mtls { tls.ca_path.clone() } else { None },
        }),
    }
}

fn build_server_tls(cfg: &NodeConfig) -> anyhow::Result<ServerTlsConfig> {
    match &cfg.tls {
        None => Ok(ServerTlsConfig::default()),
        Some(tls) => {
            let client_ca_path = if tls.mtls { tls.ca_path.as_deref() } else { None };
            let server_config = konsul_raft::server::load_server_tls(&tls.cert_path, &tls.key_path, client_ca_path)?;
            Ok(ServerTlsConfig {
                acceptor: Some(tokio_rustls::TlsAcceptor::from(Arc::new(server_config))),
            })
        }
    }
}

/// `log_format = "json"` emits one JSON object per line; anything else falls
/// back to `env_logger`'s own text format. The level is whatever
/// `NodeConfig` resolved from file/env/CLI, not a separate `RUST_LOG` read.
fn init_logging(cfg: &NodeConfig) {
    let level = cfg.log_level.parse::<log::LevelFilter>().unwrap_or(log::LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if cfg.log_format.eq_ignore_ascii_case("json") {
        builder.format(|buf, record| {
            use std::io::Write;
            let line = serde_json::json!({
                "level": record.level().to_string(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }

    builder.init();
}

async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("konsuld: failed to install ctrl-c handler, shutting down immediately: {e}");
    }
}
