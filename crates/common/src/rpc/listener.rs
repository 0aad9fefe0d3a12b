use std::sync::Arc;

use futures::future::BoxFuture;
use iroh::protocol::{AcceptError, ProtocolHandler};

use crate::pki::{Credentials, NonceStore};

use super::command::CommandCollection;
use super::connection::Connection;
use super::context::Capabilities;
use super::error::RpcError;
use super::handshake;
use super::transport::quic::IrohTransport;
use super::transport::Transport;

/// ALPN for the authenticated command protocol
pub const RPC_ALPN: &[u8] = b"/rmm/rpc/1";
/// ALPN for first-time server setup
pub const SETUP_ALPN: &[u8] = b"/rmm/setup/1";
/// ALPN for username/password login
pub const LOGIN_ALPN: &[u8] = b"/rmm/login/1";
/// ALPN for device enrollment
pub const ENROLL_ALPN: &[u8] = b"/rmm/enroll/1";

#[derive(Debug, Clone)]
enum Mode {
    /// Mutual certificate handshake before any command
    Authenticated { credentials: Arc<Credentials> },
    /// No peer identity; commands authenticate their own payloads
    Bootstrap { nonces: NonceStore },
}

/// Accepts connections on one protocol and serves its command collection
#[derive(Debug, Clone)]
pub struct Listener {
    alpn: &'static [u8],
    mode: Mode,
    capabilities: Arc<Capabilities>,
    commands: Arc<CommandCollection>,
    local_id: String,
}

impl Listener {
    pub fn authenticated(
        alpn: &'static [u8],
        credentials: Credentials,
        capabilities: Capabilities,
        commands: CommandCollection,
    ) -> Self {
        Self {
            alpn,
            mode: Mode::Authenticated {
                credentials: Arc::new(credentials),
            },
            capabilities: Arc::new(capabilities),
            commands: Arc::new(commands),
            local_id: String::new(),
        }
    }

    /// A listener whose connections share one replay store
    pub fn bootstrap(
        alpn: &'static [u8],
        capabilities: Capabilities,
        commands: CommandCollection,
    ) -> Self {
        // Enrollment listeners use the manager's store so its sweeps prune it
        let nonces = capabilities
            .bootstrap_nonces
            .clone()
            .or_else(|| capabilities.enrollments.as_ref().map(|e| e.nonces().clone()))
            .unwrap_or_default();
        let capabilities = capabilities.with_bootstrap_nonces(nonces.clone());
        Self {
            alpn,
            mode: Mode::Bootstrap { nonces },
            capabilities: Arc::new(capabilities),
            commands: Arc::new(commands),
            local_id: String::new(),
        }
    }

    /// Our transport identity, as peers address hellos to it
    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = local_id.into();
        self
    }

    pub fn alpn(&self) -> &'static [u8] {
        self.alpn
    }

    pub fn capabilities(&self) -> &Arc<Capabilities> {
        &self.capabilities
    }

    /// Serve one accepted transport until it closes
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<(), RpcError> {
        match &self.mode {
            Mode::Bootstrap { nonces } => {
                let connection = Connection::with_nonces(transport, nonces.clone());
                tracing::debug!(
                    remote = %connection.remote_id(),
                    alpn = %String::from_utf8_lossy(self.alpn),
                    "bootstrap connection"
                );
                connection
                    .serve(self.capabilities.clone(), self.commands.clone())
                    .await;
                Ok(())
            }
            Mode::Authenticated { credentials } => {
                let connection = Connection::new(transport);
                let chain = handshake::accept(
                    &connection,
                    credentials,
                    self.capabilities.verifier.as_ref(),
                    self.capabilities.expiration,
                )
                .await?;
                let peer = chain.leaf().map(|leaf| (leaf.fingerprint(), leaf.name().to_string()));

                if let (Some(pool), Some((fingerprint, _))) = (&self.capabilities.pool, &peer) {
                    pool.insert(fingerprint.clone(), connection.clone());
                }
                if let Some((_, name)) = &peer {
                    tracing::info!(peer = %name, remote = %connection.remote_id(), "peer connected");
                }
                connection
                    .serve(self.capabilities.clone(), self.commands.clone())
                    .await;
                if let (Some(pool), Some((fingerprint, _))) = (&self.capabilities.pool, &peer) {
                    pool.remove(fingerprint, &connection);
                }
                if let Some((_, name)) = &peer {
                    tracing::info!(peer = %name, "peer disconnected");
                }
                Ok(())
            }
        }
    }
}

impl ProtocolHandler for Listener {
    #[allow(refining_impl_trait)]
    fn accept(
        &self,
        conn: iroh::endpoint::Connection,
    ) -> BoxFuture<'static, Result<(), AcceptError>> {
        let this = self.clone();
        Box::pin(async move {
            tracing::debug!("new connection from {:?}", conn.remote_node_id());
            let transport = Arc::new(IrohTransport::new(conn, this.local_id.clone()));
            this.serve(transport).await.map_err(|e| {
                tracing::warn!(
                    alpn = %String::from_utf8_lossy(this.alpn),
                    "connection rejected: {}",
                    e
                );
                AcceptError::from(std::io::Error::other(e))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::NilVerifier;
    use crate::rpc::commands::{self, Ping};
    use crate::rpc::transport::memory;

    #[tokio::test]
    async fn bootstrap_listener_serves_without_handshake() {
        let (client, server) = memory::pair();
        let listener = Listener::bootstrap(
            ENROLL_ALPN,
            Capabilities::new(Arc::new(NilVerifier)),
            CommandCollection::new().register::<Ping>(),
        );
        tokio::spawn(async move { listener.serve(Arc::new(server)).await });

        let client = Connection::new(Arc::new(client));
        let mut ping = Ping::new("hi");
        client.call(&mut ping).await.unwrap();
    }

    #[tokio::test]
    async fn unlisted_commands_are_unknown() {
        let (client, server) = memory::pair();
        let listener = Listener::bootstrap(
            LOGIN_ALPN,
            Capabilities::new(Arc::new(NilVerifier)),
            commands::login_commands(),
        );
        tokio::spawn(async move { listener.serve(Arc::new(server)).await });

        let client = Connection::new(Arc::new(client));
        let err = client.call(&mut Ping::new("hi")).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: 404, .. }));
    }
}
