//! The inter-node network transport.
//!
//! No gRPC stack sits in this workspace's dependency tree, so the usual
//! "serialize the openraft request type, send it, deserialize the response"
//! shape is built over a raw length-prefixed TCP frame instead: a `u32`
//! big-endian byte count followed by a `bincode`-encoded
//! [`RpcRequest`]/[`RpcResponse`]. TLS (optionally with client-certificate
//! verification) wraps the stream when the node is configured with
//! certificates; otherwise frames travel over plain TCP.

use std::io;
use std::sync::Arc;

use konsul_raft_store::TypeConfig;
use openraft::error::InstallSnapshotError;
use openraft::error::RPCError;
use openraft::error::RaftError;
use openraft::error::Unreachable;
use openraft::network::RPCOption;
use openraft::network::RaftNetwork;
use openraft::network::RaftNetworkFactory;
use openraft::raft::AppendEntriesRequest;
use openraft::raft::AppendEntriesResponse;
use openraft::raft::InstallSnapshotRequest;
use openraft::raft::InstallSnapshotResponse;
use openraft::raft::VoteRequest;
use openraft::raft::VoteResponse;
use openraft::AnyError;
use openraft::BasicNode;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

type NodeId = konsul_raft_store::NodeId;

#[derive(Serialize, Deserialize)]
enum RpcRequest {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<NodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

#[derive(Serialize, Deserialize)]
enum RpcResponse {
    AppendEntries(AppendEntriesResponse<NodeId>),
    Vote(VoteResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Error(String),
}

/// Shared client-side TLS configuration. `None` means plain TCP.
#[derive(Clone, Default)]
pub struct ClientTlsConfig {
    pub connector: Option<TlsConnector>,
    pub server_name: Option<String>,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

async fn connect(addr: &str, tls: &ClientTlsConfig) -> io::Result<Box<dyn AsyncStream>> {
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true).ok();

    match &tls.connector {
        None => Ok(Box::new(tcp)),
        Some(connector) => {
            let name_str = tls.server_name.clone().unwrap_or_else(|| addr.to_string());
            let server_name = rustls::pki_types::ServerName::try_from(name_str)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?
                .to_owned();
            let stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(stream))
        }
    }
}

async fn send_frame(stream: &mut (dyn AsyncStream), bytes: &[u8]) -> io::Result<()> {
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut (dyn AsyncStream)) -> io::Result<Vec<u8>> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

fn unreachable<E>(msg: impl std::fmt::Display) -> RPCError<NodeId, BasicNode, RaftError<NodeId, E>> {
    RPCError::Unreachable(Unreachable::new(&AnyError::error(msg.to_string())))
}

/// A `RaftNetwork` handle for one target peer. Connects lazily and
/// reconnects on the next call if the stream is dropped or errors --
/// openraft already retries RPCs against a peer on its own schedule, so
/// this layer doesn't need its own retry loop.
pub struct TcpNetwork {
    addr: String,
    tls: ClientTlsConfig,
    stream: Option<Box<dyn AsyncStream>>,
}

impl TcpNetwork {
    async fn roundtrip(&mut self, req: RpcRequest) -> io::Result<RpcResponse> {
        if self.stream.is_none() {
            self.stream = Some(connect(&self.addr, &self.tls).await?);
        }

        let body = bincode::serialize(&req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let result = async {
            let stream = self.stream.as_mut().unwrap();
            send_frame(stream.as_mut(), &body).await?;
            let resp_bytes = read_frame(stream.as_mut()).await?;
            bincode::deserialize(&resp_bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        }
        .await;

        if result.is_err() {
            // Drop the stream so the next call reconnects instead of
            // reusing a half-broken connection.
            self.stream = None;
        }
        result
    }
}

impl RaftNetwork<TypeConfig> for TcpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.roundtrip(RpcRequest::AppendEntries(rpc)).await.map_err(unreachable)? {
            RpcResponse::AppendEntries(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(unreachable(msg)),
            _ => Err(unreachable("unexpected response variant for append_entries")),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        match self.roundtrip(RpcRequest::Vote(rpc)).await.map_err(unreachable)? {
            RpcResponse::Vote(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(unreachable(msg)),
            _ => Err(unreachable("unexpected response variant for vote")),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>> {
        match self.roundtrip(RpcRequest::InstallSnapshot(rpc)).await.map_err(unreachable)? {
            RpcResponse::InstallSnapshot(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(unreachable(msg)),
            _ => Err(unreachable("unexpected response variant for install_snapshot")),
        }
    }
}

#[derive(Clone)]
pub struct TcpNetworkFactory {
    tls: ClientTlsConfig,
}

impl TcpNetworkFactory {
    pub fn new(tls: ClientTlsConfig) -> Self {
        TcpNetworkFactory { tls }
    }
}

impl RaftNetworkFactory<TypeConfig> for TcpNetworkFactory {
    type Network = TcpNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        TcpNetwork {
            addr: node.addr.clone(),
            tls: self.tls.clone(),
            stream: None,
        }
    }
}

/// Server-side dispatch: decodes one `RpcRequest` frame and routes it into
/// the local `Raft` instance's handlers, returning the matching
/// `RpcResponse` frame. Used by the TCP listener in `server.rs`.
async fn dispatch(
    raft: &openraft::Raft<TypeConfig>,
    req: RpcRequest,
) -> RpcResponse {
    match req {
        RpcRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
            Ok(resp) => RpcResponse::AppendEntries(resp),
            Err(e) => RpcResponse::Error(e.to_string()),
        },
        RpcRequest::Vote(rpc) => match raft.vote(rpc).await {
            Ok(resp) => RpcResponse::Vote(resp),
            Err(e) => RpcResponse::Error(e.to_string()),
        },
        RpcRequest::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
            Ok(resp) => RpcResponse::InstallSnapshot(resp),
            Err(e) => RpcResponse::Error(e.to_string()),
        },
    }
}

pub(crate) async fn serve_connection(
    mut stream: Box<dyn AsyncStream>,
    raft: Arc<openraft::Raft<TypeConfig>>,
) -> io::Result<()> {
    loop {
        let frame = match read_frame(stream.as_mut()).await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let req: RpcRequest = bincode::deserialize(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let resp = dispatch(&raft, req).await;
        let body = bincode::serialize(&resp).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        send_frame(stream.as_mut(), &body).await?;
    }
}
