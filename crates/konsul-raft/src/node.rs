//! The Raft node wrapper itself: bootstrap, membership,
//! apply-with-timeout, the linearizable-read barrier, cluster introspection,
//! a background metrics monitor, and graceful shutdown.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use konsul_raft_store::ApplyResponse;
use konsul_raft_store::Fsm;
use konsul_raft_store::RaftInstance;
use konsul_raft_store::StateMachine;
use konsul_raft_store::TypeConfig;
use konsul_store_api::KvApplyApi;
use konsul_store_api::MetricsSink;
use konsul_store_api::RegistryApplyApi;
use konsul_types::Command;
use konsul_types::CommandPayload;
use konsul_types::KonsulError;
use konsul_types::Result;
use log::info;
use log::warn;
use openraft::error::ClientWriteError;
use openraft::error::RaftError;
use openraft::BasicNode;
use openraft::ServerState;

use crate::config::RaftNodeConfig;
use crate::log_store::SledLogStore;
use crate::network::ClientTlsConfig;
use crate::network::TcpNetworkFactory;

type NodeId = konsul_raft_store::NodeId;

/// The subset of `openraft::RaftMetrics` this crate surfaces to an operator.
#[derive(Debug, Clone, Default)]
pub struct RaftStats {
    pub term: u64,
    pub vote_node_id: Option<NodeId>,
    pub last_log_index: Option<u64>,
    pub last_applied: Option<u64>,
    pub snapshot_index: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub node_id: NodeId,
    pub state: &'static str,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub peers: Vec<(NodeId, String)>,
    pub last_index: Option<u64>,
    pub applied_index: Option<u64>,
    pub commit_index: Option<u64>,
    pub raft_stats: RaftStats,
}

fn server_state_label(state: ServerState) -> &'static str {
    match state {
        ServerState::Leader => "leader",
        ServerState::Candidate => "candidate",
        ServerState::Follower => "follower",
        ServerState::Learner => "follower",
        ServerState::Shutdown => "shutdown",
    }
}

/// A running Raft node: the consensus engine, its config, and the
/// bookkeeping the graceful-shutdown/metrics-monitor tasks need.
pub struct RaftNode {
    config: RaftNodeConfig,
    raft: RaftInstance,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutting_down: Arc<AtomicBool>,
    leader_changes_total: Arc<AtomicU64>,
    metrics: Arc<dyn MetricsSink>,
    monitor_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RaftNode {
    /// Opens the sled-backed log store, constructs the FSM over the
    /// supplied stores, and instantiates `openraft::Raft`. If `bootstrap`
    /// is set and no log entries exist yet, initializes a single-member
    /// cluster containing only this node.
    pub async fn start(
        config: RaftNodeConfig,
        kv: Arc<dyn KvApplyApi>,
        registry: Arc<dyn RegistryApplyApi>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Arc<RaftNode>> {
        config.validate()?;

        let sled_path = config.data_dir.join("raft.sled");
        let sled_db = sled::open(&sled_path).map_err(|e| KonsulError::internal(format!("opening sled db: {e}")))?;
        let log_store = SledLogStore::open(sled_db).map_err(|e| KonsulError::internal(format!("opening log tree: {e}")))?;

        let fsm = Fsm::new(kv, registry, metrics.clone());
        let state_machine = StateMachine::new(fsm);

        let tls = match &config.tls {
            None => ClientTlsConfig::default(),
            Some(tls_cfg) => match &tls_cfg.client_ca_path {
                None => {
                    warn!("konsul-raft: tls configured without client_ca_path, outbound peer connections will use plain TCP");
                    ClientTlsConfig::default()
                }
                Some(ca_path) => {
                    let client_config = crate::server::load_client_tls(ca_path, Some((&tls_cfg.cert_path, &tls_cfg.key_path)))
                        .map_err(|e| KonsulError::internal(format!("loading client tls material: {e}")))?;
                    ClientTlsConfig {
                        connector: Some(tokio_rustls::TlsConnector::from(Arc::new(client_config))),
                        server_name: None,
                    }
                }
            },
        };
        let network = TcpNetworkFactory::new(tls);

        let openraft_config = Arc::new(
            config
                .to_openraft_config()
                .validate()
                .map_err(|e| KonsulError::internal(format!("invalid openraft config: {e}")))?,
        );

        let raft = openraft::Raft::new(config.node_id, openraft_config, network, log_store, state_machine)
            .await
            .map_err(|e| KonsulError::internal(format!("starting raft instance: {e}")))?;

        if config.bootstrap {
            let mut members = BTreeMap::new();
            members.insert(config.node_id, BasicNode { addr: config.advertise_addr.clone() });
            match raft.initialize(members).await {
                Ok(()) => info!("konsul-raft: bootstrapped single-node cluster as node {}", config.node_id),
                Err(e) => info!("konsul-raft: skipping bootstrap, cluster already initialized: {e}"),
            }
        }

        let (shutdown_tx, _shutdown_rx) = tokio::sync::watch::channel(false);

        let node = Arc::new(RaftNode {
            config,
            raft,
            shutdown_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
            leader_changes_total: Arc::new(AtomicU64::new(0)),
            metrics,
            monitor_handle: tokio::sync::Mutex::new(None),
        });

        node.spawn_metrics_monitor();
        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.config.node_id)
    }

    /// A cheap clone of the underlying consensus engine handle, for the
    /// network listener (`server::serve`) to dispatch accepted RPCs into.
    /// `openraft::Raft` is itself an `Arc`-backed handle, so this is not a
    /// deep copy of node state.
    pub fn raft_handle(&self) -> Arc<RaftInstance> {
        Arc::new(self.raft.clone())
    }

    /// A receiver that fires once when [`RaftNode::shutdown`] begins, for
    /// collaborators (the network listener) that must stop alongside the
    /// node.
    pub fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn reject_if_shutting_down(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(KonsulError::Shutdown);
        }
        Ok(())
    }

    /// `Join(id, addr)`: requires leadership; idempotent for
    /// a matching existing member, otherwise removes and re-adds the member
    /// at its new address.
    pub async fn join(&self, id: NodeId, addr: String) -> Result<()> {
        self.reject_if_shutting_down()?;
        self.require_leader()?;

        let current = self.raft.metrics().borrow().membership_config.clone();
        if let Some(node) = current.membership().nodes().find(|(nid, _)| **nid == id).map(|(_, n)| n.clone()) {
            if node.addr == addr {
                return Ok(());
            }
            self.raft
                .remove_learner(id)
                .await
                .map_err(|e| KonsulError::internal(format!("remove_learner before rejoin: {e}")))
                .ok();
        }

        self.raft
            .add_learner(id, BasicNode { addr: addr.clone() }, true)
            .await
            .map_err(|e| KonsulError::internal(format!("add_learner: {e}")))?;

        let mut members: BTreeSet<NodeId> = current.membership().voter_ids().collect();
        members.insert(id);
        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| KonsulError::internal(format!("change_membership: {e}")))?;
        Ok(())
    }

    /// `Leave(id)`: requires leadership.
    pub async fn leave(&self, id: NodeId) -> Result<()> {
        self.reject_if_shutting_down()?;
        self.require_leader()?;

        let current = self.raft.metrics().borrow().membership_config.clone();
        let mut members: BTreeSet<NodeId> = current.membership().voter_ids().collect();
        members.remove(&id);
        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| KonsulError::internal(format!("change_membership: {e}")))?;
        Ok(())
    }

    fn require_leader(&self) -> Result<()> {
        let metrics = self.raft.metrics().borrow().clone();
        if metrics.current_leader != Some(self.config.node_id) {
            let leader_addr = metrics
                .current_leader
                .and_then(|id| metrics.membership_config.membership().nodes().find(|(nid, _)| **nid == id).map(|(_, n)| n.addr.clone()));
            return Err(KonsulError::not_leader(metrics.current_leader, leader_addr));
        }
        Ok(())
    }

    /// `ApplyEntry(command, timeout)`: replicates `command`
    /// and blocks until it is committed and applied, or `timeout` elapses.
    pub async fn apply_entry(&self, payload: CommandPayload, timeout: Duration) -> Result<ApplyResponse> {
        self.reject_if_shutting_down()?;

        let command = Command::new(konsul_types::now_ms(), payload);

        let result = tokio::time::timeout(timeout, self.raft.client_write(command)).await;

        match result {
            Err(_elapsed) => Err(KonsulError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                Err(KonsulError::not_leader(fwd.leader_id, fwd.leader_node.map(|n| n.addr)))
            }
            Ok(Err(e)) => Err(KonsulError::internal(format!("raft apply failed: {e}"))),
            Ok(Ok(resp)) => Ok(resp.data),
        }
    }

    /// `EnsureLinearizableRead(timeout)`: valid only on the
    /// leader. `Raft::ensure_linearizable` performs the heartbeat-quorum
    /// verification; the FSM has already applied everything committed as of
    /// that point once this resolves, because application is synchronous
    /// with respect to the apply loop `client_write` also waits on.
    pub async fn ensure_linearizable_read(&self, timeout: Duration) -> Result<()> {
        self.reject_if_shutting_down()?;

        let result = tokio::time::timeout(timeout, self.raft.ensure_linearizable()).await;
        match result {
            Err(_elapsed) => Err(KonsulError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
            Ok(Err(e)) => Err(KonsulError::not_leader(None, Some(e.to_string()))),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Cluster introspection: `{node_id, state, leader_id,
    /// leader_addr, peers[], last_index, applied_index, commit_index,
    /// raft_stats{..}}`.
    pub fn cluster_info(&self) -> ClusterInfo {
        let metrics = self.raft.metrics().borrow().clone();

        let leader_addr = metrics
            .current_leader
            .and_then(|id| metrics.membership_config.membership().nodes().find(|(nid, _)| **nid == id).map(|(_, n)| n.addr.clone()));

        let peers = metrics
            .membership_config
            .nodes()
            .map(|(id, node)| (*id, node.addr.clone()))
            .collect();

        ClusterInfo {
            node_id: self.config.node_id,
            state: server_state_label(metrics.state),
            leader_id: metrics.current_leader,
            leader_addr,
            peers,
            last_index: metrics.last_log_index,
            applied_index: metrics.last_applied.map(|id| id.index),
            commit_index: metrics.last_log_index,
            raft_stats: RaftStats {
                term: metrics.current_term,
                vote_node_id: metrics.current_leader,
                last_log_index: metrics.last_log_index,
                last_applied: metrics.last_applied.map(|id| id.index),
                snapshot_index: metrics.snapshot.map(|id| id.index),
            },
        }
    }

    /// Updates `raft_*` metrics once per second until shutdown. Leader transitions (into or out of
    /// leader) increment `raft_leader_changes_total`.
    fn spawn_metrics_monitor(self: &Arc<Self>) {
        let node = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut was_leader = node.is_leader();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        let info = node.cluster_info();
                        let now_is_leader = info.leader_id == Some(node.config.node_id);

                        if now_is_leader != was_leader {
                            node.leader_changes_total.fetch_add(1, Ordering::Relaxed);
                            node.metrics.incr_counter("raft_leader_changes_total", &[]);
                            was_leader = now_is_leader;
                        }

                        node.metrics.set_gauge("raft_is_leader", &[], now_is_leader as i64);
                        node.metrics.set_gauge("raft_state", &[("state", info.state)], 1);
                        node.metrics.set_gauge("raft_peers_total", &[], info.peers.len() as i64);
                        node.metrics.set_gauge("raft_last_index", &[], info.last_index.unwrap_or(0) as i64);
                        node.metrics.set_gauge("raft_commit_index", &[], info.commit_index.unwrap_or(0) as i64);
                        node.metrics.set_gauge("raft_applied_index", &[], info.applied_index.unwrap_or(0) as i64);

                        let lag = info.last_index.unwrap_or(0).saturating_sub(info.applied_index.unwrap_or(0));
                        node.metrics.set_gauge("raft_replication_lag", &[], lag as i64);
                    }
                }
            }
        });

        // best-effort: if a previous handle is somehow already set, this
        // node was started twice, which the caller shouldn't do.
        if let Ok(mut guard) = self.monitor_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    /// Graceful shutdown: stops accepting new applies/barriers,
    /// waits briefly for in-flight ones to finish, then tears down the
    /// consensus engine and the metrics-monitor task.
    pub async fn shutdown(&self, grace_period: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::Release);
        warn!("konsul-raft: node {} shutting down", self.config.node_id);

        tokio::time::sleep(grace_period).await;

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.raft
            .shutdown()
            .await
            .map_err(|e| KonsulError::internal(format!("raft shutdown: {e}")))?;
        Ok(())
    }
}
