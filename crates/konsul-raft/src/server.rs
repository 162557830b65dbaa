//! The inter-node network listener: accepts TCP (optionally TLS)
//! connections on the node's bind address and dispatches framed RPC
//! requests into the local `Raft` instance, mirroring `TcpNetwork`'s client
//! side in `network.rs`.

use std::io;
use std::sync::Arc;

use konsul_raft_store::TypeConfig;
use log::debug;
use log::warn;
use tokio::net::TcpListener;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

/// Server-side TLS configuration. `None` means plain TCP.
#[derive(Clone, Default)]
pub struct ServerTlsConfig {
    pub acceptor: Option<TlsAcceptor>,
}

/// Runs the accept loop until `shutdown` resolves. Each accepted connection
/// is handled on its own task so one slow peer can't block RPCs from
/// others.
pub async fn serve(
    bind_addr: &str,
    tls: ServerTlsConfig,
    raft: Arc<openraft::Raft<TypeConfig>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("konsul-raft: listening on {bind_addr}");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("konsul-raft: listener on {bind_addr} shutting down");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("konsul-raft: accept error: {e}");
                        continue;
                    }
                };
                stream.set_nodelay(true).ok();
                debug!("konsul-raft: accepted connection from {peer}");

                let raft = raft.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    let result = match &tls.acceptor {
                        None => crate::network::serve_connection(Box::new(stream), raft).await,
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => crate::network::serve_connection(Box::new(tls_stream), raft).await,
                            Err(e) => {
                                warn!("konsul-raft: tls handshake with {peer} failed: {e}");
                                return;
                            }
                        },
                    };
                    if let Err(e) = result {
                        debug!("konsul-raft: connection from {peer} closed: {e}");
                    }
                });
            }
        }
    }
}

/// Builds a client `rustls::ClientConfig` from PEM-encoded certificate
/// material, accepting either a plain trust-root CA file (server-auth only)
/// or -- when `client_cert`/`client_key` are given -- full mTLS.
pub fn load_client_tls(
    ca_path: &std::path::Path,
    client_cert: Option<(&std::path::Path, &std::path::Path)>,
) -> io::Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in read_certs(ca_path)? {
        roots.add(cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match client_cert {
        None => builder.with_no_client_auth(),
        Some((cert_path, key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = read_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        }
    };
    Ok(config)
}

/// Builds a server `rustls::ServerConfig`. `client_ca_path` enables mTLS by
/// requiring and verifying a client certificate against that CA.
pub fn load_server_tls(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
    client_ca_path: Option<&std::path::Path>,
) -> io::Result<rustls::ServerConfig> {
    let certs = read_certs(cert_path)?;
    let key = read_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let config = match client_ca_path {
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?,
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in read_certs(ca_path)? {
                roots.add(cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            }
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        }
    };
    Ok(config)
}

fn read_certs(path: &std::path::Path) -> io::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()
}

fn read_key(path: &std::path::Path) -> io::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))
}
