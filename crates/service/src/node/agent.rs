use std::sync::Arc;
use std::time::Duration;

use iroh::protocol::Router;
use iroh::{Endpoint, NodeId};
use tokio::sync::watch;

use common::clock;
use common::crypto::SecretKey;
use common::enrollment::{EnrollmentError, EnrollmentOutcome};
use common::host_config::{check_synced, HostConfigStore};
use common::pki::{Credentials, FallbackVerifier, PkiError, RevocationStore, UpstreamVerifier};
use common::rpc::commands::{self, host_config::next_event, Enroll, SyncEvent, SyncHostConfigs};
use common::rpc::{Capabilities, Connection, Listener, RpcError, ENROLL_ALPN, RPC_ALPN};

use super::{connect_authenticated, connect_bootstrap, parse_node_id, NodeError};
use crate::state::NodeState;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A managed device
///
/// Keeps one authenticated connection up to its server. The server opens
/// sessions toward the agent over that same connection, so the agent
/// serves its command set on it; the same commands are also offered to
/// servers that dial the agent directly.
pub struct Agent {
    state: NodeState,
    credentials: Credentials,
    verifier: Arc<UpstreamVerifier>,
    server: NodeId,
    host_configs: HostConfigStore,
}

impl Agent {
    /// Ask the server for a certificate and wait for an operator to grant it
    pub async fn enroll(state: &NodeState, endpoint: &Endpoint) -> Result<Credentials, NodeError> {
        let upstream = state.config.upstream()?;
        let key = SecretKey::generate();
        let connection =
            connect_bootstrap(endpoint, parse_node_id(&upstream.node_id)?, ENROLL_ALPN).await?;

        let mut request = Enroll::new(&state.config.name, &key)?;
        tracing::info!(
            name = %state.config.name,
            fingerprint = %key.public().fingerprint(),
            "waiting for an operator to accept the enrollment"
        );
        let result = connection.call(&mut request).await;
        connection.close();
        result?;

        match request.into_outcome() {
            Some(EnrollmentOutcome::Accepted { certificate, chain }) => {
                let root = chain
                    .root()
                    .ok_or_else(|| PkiError::ChainBuildFailed("enrollment chain has no root".into()))?;
                if state.has_root() && state.load_root()?.der() != root.der() {
                    return Err(NodeError::Refused(
                        "enrollment was granted under a different root".into(),
                    ));
                }
                state.save_root(root)?;
                let credentials = Credentials::new(certificate, key)?;
                state.save_credentials(&credentials)?;
                tracing::info!(name = %state.config.name, "enrolled");
                Ok(credentials)
            }
            Some(EnrollmentOutcome::TimedOut) | None => Err(EnrollmentError::TimedOut.into()),
        }
    }

    pub fn open(state: NodeState) -> Result<Self, NodeError> {
        let credentials = state.load_credentials()?;
        let fallback = FallbackVerifier::new(state.load_root()?, state.load_upstream()?);
        let revocations = RevocationStore::new(state.open_store()?.scope("revocations"));
        let server = parse_node_id(&state.config.upstream()?.node_id)?;
        Ok(Self {
            verifier: Arc::new(UpstreamVerifier::new(fallback, revocations)),
            host_configs: HostConfigStore::new(),
            state,
            credentials,
            server,
        })
    }

    pub fn host_configs(&self) -> &HostConfigStore {
        &self.host_configs
    }

    fn capabilities(&self) -> Result<Capabilities, NodeError> {
        Ok(Capabilities::new(self.verifier.clone())
            .with_expiration(self.state.config.expiration())
            .with_identity(self.credentials.certificate()?.clone())
            .with_tunnels(self.state.config.tunnels))
    }

    pub async fn run(
        self,
        endpoint: Endpoint,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<(), NodeError> {
        let capabilities = Arc::new(self.capabilities()?);
        let commands = Arc::new(commands::agent_commands());
        let listener = Listener::authenticated(
            RPC_ALPN,
            self.credentials.clone(),
            self.capabilities()?,
            commands::agent_commands(),
        )
        .with_local_id(endpoint.node_id().to_string());
        let router = Router::builder(endpoint.clone())
            .accept(RPC_ALPN, listener)
            .spawn();

        loop {
            let session = async {
                let connection = connect_authenticated(
                    &endpoint,
                    self.server,
                    &self.credentials,
                    &*self.verifier,
                    self.state.config.expiration(),
                )
                .await?;
                self.verifier.attach(connection.clone());
                tracing::info!(server = %self.server, "connected to server");

                let serving = connection.clone();
                let (capabilities, commands) = (capabilities.clone(), commands.clone());
                tokio::spawn(async move { serving.serve(capabilities, commands).await });

                let result = self.follow_host_configs(&connection).await;
                connection.close();
                result
            };

            let result = tokio::select! {
                result = session => result,
                _ = shutdown_rx.changed() => break,
            };
            self.verifier.detach();
            if let Err(e) = result {
                tracing::warn!(server = %self.server, "lost the server: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.verifier.detach();
        tracing::info!("agent shutting down");
        router
            .shutdown()
            .await
            .map_err(|e| NodeError::Router(e.to_string()))
    }

    /// Apply host configuration changes pushed by the server until the
    /// stream ends
    async fn follow_host_configs(&self, connection: &Connection) -> Result<(), RpcError> {
        let mut session = connection.open_session().await?;
        session.call(&mut SyncHostConfigs::new()).await?;
        loop {
            match next_event(&mut session).await? {
                SyncEvent::Remove(target) => {
                    self.host_configs.remove(&target)?;
                    tracing::info!(target_host = %target, "host configuration removed");
                }
                event => {
                    let Some(artifact) = event.artifact()? else {
                        continue;
                    };
                    // Same author rules as the server, against our own ledger
                    if let Err(e) = check_synced(
                        &artifact,
                        &*self.verifier,
                        self.verifier.revocations(),
                        self.state.config.expiration(),
                        clock::now(),
                    )
                    .await
                    {
                        tracing::warn!(
                            target_host = %artifact.body().target,
                            "refused host configuration: {}",
                            e
                        );
                        continue;
                    }
                    self.host_configs.apply(artifact)?;
                }
            }
        }
    }
}
