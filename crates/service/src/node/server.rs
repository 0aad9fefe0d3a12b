use std::sync::Arc;
use std::time::Duration;

use iroh::protocol::Router;
use iroh::Endpoint;
use tokio::sync::watch;

use common::enrollment::EnrollmentManager;
use common::host_config::HostConfigStore;
use common::login::LoginDirectory;
use common::pki::{
    Certificate, CertificateRegistry, Credentials, LocalVerifier, NilVerifier, RevocationStore,
};
use common::rpc::commands::{self, SetupOutcome, SetupState};
use common::rpc::{
    Capabilities, ConnectionPool, Listener, ENROLL_ALPN, LOGIN_ALPN, RPC_ALPN, SETUP_ALPN,
};
use common::store::Store;

use super::{IrohDialer, NodeError};
use crate::state::NodeState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The server root: registry, ledgers and the connections it relays over
pub struct Server {
    state: NodeState,
    credentials: Credentials,
    trust: Arc<LocalVerifier>,
    enrollments: EnrollmentManager,
    host_configs: HostConfigStore,
    logins: LoginDirectory,
}

impl Server {
    /// Open a server that has been set up
    pub fn open(state: NodeState) -> Result<Self, NodeError> {
        let credentials = state.load_credentials()?;
        let root = state.load_root()?;
        let store = state.open_store()?;
        Self::from_parts(state, credentials, root, &store)
    }

    pub fn from_parts(
        state: NodeState,
        credentials: Credentials,
        root: Certificate,
        store: &Store,
    ) -> Result<Self, NodeError> {
        let trust = Arc::new(LocalVerifier::new(
            root,
            CertificateRegistry::new(store),
            RevocationStore::new(store.scope("revocations")),
        ));
        let host_configs = HostConfigStore::persistent(store.scope("host_configs"))?;
        tracing::debug!(configs = host_configs.len(), "loaded host configurations");
        Ok(Self {
            enrollments: EnrollmentManager::new(state.config.enrollment_lifetime())
                .with_nonce_window(state.config.expiration()),
            logins: LoginDirectory::new(store),
            state,
            credentials,
            trust,
            host_configs,
        })
    }

    pub fn trust(&self) -> &Arc<LocalVerifier> {
        &self.trust
    }

    pub fn enrollments(&self) -> &EnrollmentManager {
        &self.enrollments
    }

    pub fn host_configs(&self) -> &HostConfigStore {
        &self.host_configs
    }

    /// Serve the setup protocol until an administrator sets this server up
    ///
    /// The router is shut down afterwards, which closes `endpoint`.
    pub async fn setup(
        state: &NodeState,
        endpoint: Endpoint,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> Result<(), NodeError> {
        let (setup, completed) = SetupState::new(Credentials::temporary());
        let listener = Listener::bootstrap(
            SETUP_ALPN,
            Capabilities::new(Arc::new(NilVerifier))
                .with_expiration(state.config.expiration())
                .with_setup(setup),
            commands::setup_commands(),
        )
        .with_local_id(endpoint.node_id().to_string());
        let router = Router::builder(endpoint.clone())
            .accept(SETUP_ALPN, listener)
            .spawn();
        tracing::info!(node_id = %endpoint.node_id(), "waiting for an administrator to run setup");

        let outcome = tokio::select! {
            outcome = completed.recv_async() => outcome.map_err(|_| NodeError::Interrupted),
            _ = shutdown_rx.changed() => Err(NodeError::Interrupted),
        };
        router
            .shutdown()
            .await
            .map_err(|e| NodeError::Router(e.to_string()))?;
        Self::persist_setup(state, outcome?)
    }

    /// Write what setup handed over: root, credentials, the admin's
    /// registration and login
    pub fn persist_setup(state: &NodeState, outcome: SetupOutcome) -> Result<(), NodeError> {
        state.save_root(&outcome.root)?;
        state.save_credentials(&outcome.credentials)?;

        let store = state.open_store()?;
        let registry = CertificateRegistry::new(&store);
        registry.put_user(&outcome.admin)?;
        registry.put_device(outcome.credentials.certificate()?)?;
        if let Some(login) = &outcome.login {
            LoginDirectory::new(&store).put(login)?;
        }
        tracing::info!(
            root = %outcome.root.name(),
            admin = %outcome.admin.name(),
            "server set up"
        );
        Ok(())
    }

    fn bootstrap_capabilities(&self) -> Capabilities {
        Capabilities::new(Arc::new(NilVerifier)).with_expiration(self.state.config.expiration())
    }

    /// Listeners for every protocol the server speaks
    pub fn listeners(&self, pool: ConnectionPool, local_id: &str) -> Result<Vec<Listener>, NodeError> {
        let identity = self.credentials.certificate()?.clone();
        let rpc = Capabilities::new(self.trust.clone())
            .with_expiration(self.state.config.expiration())
            .with_identity(identity.clone())
            .with_trust(self.trust.clone())
            .with_enrollments(self.enrollments.clone())
            .with_host_configs(self.host_configs.clone())
            .with_pool(pool);
        let login = self
            .bootstrap_capabilities()
            .with_identity(identity)
            .with_trust(self.trust.clone())
            .with_logins(self.logins.clone());
        let enroll = self
            .bootstrap_capabilities()
            .with_enrollments(self.enrollments.clone());

        Ok(vec![
            Listener::authenticated(
                RPC_ALPN,
                self.credentials.clone(),
                rpc,
                commands::server_commands(),
            )
            .with_local_id(local_id),
            Listener::bootstrap(LOGIN_ALPN, login, commands::login_commands())
                .with_local_id(local_id),
            Listener::bootstrap(ENROLL_ALPN, enroll, commands::enroll_commands())
                .with_local_id(local_id),
        ])
    }

    pub async fn run(
        self,
        endpoint: Endpoint,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> Result<(), NodeError> {
        let local_id = endpoint.node_id().to_string();
        let dialer = IrohDialer::new(
            endpoint.clone(),
            self.credentials.clone(),
            self.trust.clone(),
            self.state.config.expiration(),
        );
        let pool = ConnectionPool::new().with_dialer(Arc::new(dialer));

        let mut router = Router::builder(endpoint.clone());
        for listener in self.listeners(pool, &local_id)? {
            router = router.accept(listener.alpn(), listener);
        }
        let router = router.spawn();
        tracing::info!(
            node_id = %local_id,
            name = %self.credentials.certificate()?.name(),
            "server running"
        );

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let expired = self.enrollments.sweep();
                    if expired > 0 {
                        tracing::info!(expired, "expired stale enrollments");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("server shutting down");
        router
            .shutdown()
            .await
            .map_err(|e| NodeError::Router(e.to_string()))
    }
}
