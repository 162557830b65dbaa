//! The Raft node wrapper: configuration, the sled-backed log store, the
//! inter-node network transport and listener, and the `RaftNode` handle that
//! ties them to an `openraft::Raft` instance.

pub mod config;
pub mod log_store;
pub mod network;
pub mod node;
pub mod server;

pub use config::RaftNodeConfig;
pub use config::RaftTlsConfig;
pub use log_store::SledLogStore;
pub use network::ClientTlsConfig;
pub use network::TcpNetwork;
pub use network::TcpNetworkFactory;
pub use node::ClusterInfo;
pub use node::RaftNode;
pub use node::RaftStats;
pub use server::ServerTlsConfig;

pub use konsul_raft_store::NodeId;
pub use konsul_raft_store::TypeConfig;
