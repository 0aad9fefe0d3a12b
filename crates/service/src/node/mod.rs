//! Long-running node roles
//!
//! Each role owns everything it needs: the server its registry, ledgers and
//! connection pool; agents and clients their credentials and an upstream
//! verifier pinned to the root and the server. Nothing lives in globals.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iroh::{Endpoint, NodeId};

use common::enrollment::EnrollmentError;
use common::pki::{Certificate, Credentials, PkiError, Verifier};
use common::rpc::handshake;
use common::rpc::transport::quic::IrohTransport;
use common::rpc::{Connection, Dialer, RpcError};
use common::store::StoreError;

use crate::config::ConfigError;
use crate::state::StateError;

pub mod agent;
pub mod client;
pub mod server;

pub use agent::Agent;
pub use client::Client;
pub use server::Server;

/// Bind an iroh endpoint with the node's transport key
pub async fn bind_endpoint(
    secret_key: iroh::SecretKey,
    listen_addr: Option<SocketAddr>,
) -> Result<Endpoint, NodeError> {
    let socket_addr =
        listen_addr.unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
    let ip = match socket_addr {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => {
            return Err(NodeError::Bind(format!(
                "only IPv4 listen addresses are supported, got {socket_addr}"
            )))
        }
    };

    let endpoint = Endpoint::builder()
        .secret_key(secret_key)
        .discovery_n0()
        .bind_addr_v4(SocketAddrV4::new(ip, socket_addr.port()))
        .bind()
        .await
        .map_err(|e| NodeError::Bind(e.to_string()))?;
    tracing::info!(node_id = %endpoint.node_id(), "endpoint bound");
    Ok(endpoint)
}

pub(crate) fn parse_node_id(raw: &str) -> Result<NodeId, RpcError> {
    raw.parse()
        .map_err(|_| RpcError::Dial(format!("invalid node id {raw}")))
}

/// Dial `node_id` on the authenticated protocol and run the hello exchange
pub async fn connect_authenticated(
    endpoint: &Endpoint,
    node_id: NodeId,
    credentials: &Credentials,
    verifier: &dyn Verifier,
    expiration: Duration,
) -> Result<Connection, RpcError> {
    let transport = IrohTransport::connect(endpoint, node_id, common::rpc::RPC_ALPN).await?;
    let connection = Connection::new(Arc::new(transport));
    if let Err(e) = handshake::initiate(&connection, credentials, verifier, expiration).await {
        connection.close();
        return Err(e);
    }
    Ok(connection)
}

/// Open a bootstrap connection; nothing is verified on these
pub async fn connect_bootstrap(
    endpoint: &Endpoint,
    node_id: NodeId,
    alpn: &[u8],
) -> Result<Connection, RpcError> {
    let transport = IrohTransport::connect(endpoint, node_id, alpn).await?;
    Ok(Connection::new(Arc::new(transport)))
}

/// Reaches pooled peers that dropped off, at the node id they last
/// connected from
#[derive(Debug)]
pub struct IrohDialer {
    endpoint: Endpoint,
    credentials: Credentials,
    verifier: Arc<dyn Verifier>,
    expiration: Duration,
}

impl IrohDialer {
    pub fn new(
        endpoint: Endpoint,
        credentials: Credentials,
        verifier: Arc<dyn Verifier>,
        expiration: Duration,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            verifier,
            expiration,
        }
    }
}

#[async_trait]
impl Dialer for IrohDialer {
    async fn dial(
        &self,
        target: &Certificate,
        last_seen: Option<&str>,
    ) -> Result<Connection, RpcError> {
        let last_seen = last_seen
            .ok_or_else(|| RpcError::Dial(format!("{} has never connected", target.name())))?;
        let connection = connect_authenticated(
            &self.endpoint,
            parse_node_id(last_seen)?,
            &self.credentials,
            self.verifier.as_ref(),
            self.expiration,
        )
        .await?;

        // Whoever answers at that address must be the peer we meant
        let answered = connection.peer_certificate();
        if answered.as_ref().map(Certificate::fingerprint) != Some(target.fingerprint()) {
            tracing::warn!(target = %target.name(), node = %last_seen, "a different peer answered");
            connection.close();
            return Err(RpcError::Dial(format!(
                "{} no longer answers at {last_seen}",
                target.name()
            )));
        }
        Ok(connection)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("failed to bind endpoint: {0}")]
    Bind(String),
    #[error("{0}")]
    Refused(String),
    #[error("router failed: {0}")]
    Router(String),
    #[error("interrupted")]
    Interrupted,
}
