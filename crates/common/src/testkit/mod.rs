//! Small in-process deployments for tests
//!
//! [`TestPki`] builds a root, an administrator, a registered server and a
//! registered agent over a memory store. The `connect_*` helpers wire
//! listeners to clients over [`memory`] transports, so whole flows
//! (handshake, relay, enrollment, setup) run without sockets.
//!
//! ```rust,ignore
//! let pki = TestPki::new()?;
//! let server = pki.server_listener();
//! let client = connect(&server, &pki.admin, &pki.client_verifier()).await?;
//! client.call(&mut Ping::new("hi")).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::crypto::SecretKey;
use crate::enrollment::{EnrollmentManager, DEFAULT_LIFETIME};
use crate::host_config::HostConfigStore;
use crate::pki::{
    authority, Certificate, CertificateRegistry, CertificateType, Credentials, FallbackVerifier,
    LocalVerifier, RevocationStore, Verifier,
};
use crate::rpc::commands;
use crate::rpc::handshake;
use crate::rpc::transport::memory;
use crate::rpc::{
    Capabilities, CommandCollection, Connection, ConnectionPool, Listener, RpcError,
    DEFAULT_EXPIRATION, RPC_ALPN,
};
use crate::store::Store;

/// Validity of every certificate the kit issues
pub const VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// A root, one administrator and one registered server and agent
pub struct TestPki {
    pub store: Store,
    pub root: Credentials,
    pub admin: Credentials,
    pub server: Credentials,
    pub agent: Credentials,
    pub registry: CertificateRegistry,
    pub revocations: RevocationStore,
    pub trust: Arc<LocalVerifier>,
    pub enrollments: EnrollmentManager,
    pub host_configs: HostConfigStore,
    pub pool: ConnectionPool,
    root_certificate: Certificate,
    server_certificate: Certificate,
}

impl TestPki {
    pub fn new() -> Result<Self> {
        Self::with_enrollment_lifetime(DEFAULT_LIFETIME)
    }

    pub fn with_enrollment_lifetime(lifetime: Duration) -> Result<Self> {
        let store = Store::memory();
        let root = authority::create_root("acme", VALIDITY)?;
        let admin = issue(&root, "admin", CertificateType::User)?;
        let server = issue(&admin, "server", CertificateType::Server)?;
        let agent = issue(&admin, "agent", CertificateType::Agent)?;

        let registry = CertificateRegistry::new(&store);
        registry.put_user(admin.certificate()?)?;
        registry.put_device(server.certificate()?)?;
        registry.put_device(agent.certificate()?)?;
        let revocations = RevocationStore::new(store.scope("revocations"));
        let root_certificate = root.certificate()?.clone();
        let server_certificate = server.certificate()?.clone();
        let trust = Arc::new(LocalVerifier::new(
            root_certificate.clone(),
            registry.clone(),
            revocations.clone(),
        ));

        Ok(Self {
            store,
            root,
            admin,
            server,
            agent,
            registry,
            revocations,
            trust,
            enrollments: EnrollmentManager::new(lifetime),
            host_configs: HostConfigStore::new(),
            pool: ConnectionPool::new(),
            root_certificate,
            server_certificate,
        })
    }

    pub fn root_certificate(&self) -> &Certificate {
        &self.root_certificate
    }

    pub fn server_certificate(&self) -> &Certificate {
        &self.server_certificate
    }

    /// A fresh credential issued by the administrator, not registered
    pub fn issue(&self, name: &str, kind: CertificateType) -> Result<Credentials> {
        issue(&self.admin, name, kind)
    }

    /// What agents and operators trust before they reach the server
    pub fn client_verifier(&self) -> FallbackVerifier {
        FallbackVerifier::new(
            self.root_certificate().clone(),
            self.server_certificate().clone(),
        )
        .with_revocations(self.revocations.clone())
    }

    pub fn server_capabilities(&self) -> Capabilities {
        Capabilities::new(self.trust.clone())
            .with_identity(self.server_certificate().clone())
            .with_trust(self.trust.clone())
            .with_enrollments(self.enrollments.clone())
            .with_host_configs(self.host_configs.clone())
            .with_pool(self.pool.clone())
    }

    /// The server's authenticated listener
    pub fn server_listener(&self) -> Listener {
        Listener::authenticated(
            RPC_ALPN,
            self.server.clone(),
            self.server_capabilities(),
            commands::server_commands(),
        )
    }
}

fn issue(issuer: &Credentials, name: &str, kind: CertificateType) -> Result<Credentials> {
    let key = SecretKey::generate();
    let certificate = authority::issue(issuer, &key.public(), name, kind, VALIDITY)?;
    Ok(Credentials::new(certificate, key)?)
}

/// Dial `listener` over a memory transport and run the hello handshake
pub async fn connect(
    listener: &Listener,
    credentials: &Credentials,
    verifier: &dyn Verifier,
) -> Result<Connection, RpcError> {
    let (ours, theirs) = memory::pair();
    let listener = listener.clone();
    tokio::spawn(async move { listener.serve(Arc::new(theirs)).await });

    let connection = Connection::new(Arc::new(ours));
    handshake::initiate(&connection, credentials, verifier, DEFAULT_EXPIRATION).await?;
    Ok(connection)
}

/// Like [`connect`], and serve `commands` on our side of the link too
///
/// This is how an agent sits on the server: the server opens sessions
/// toward it over the agent's own connection.
pub async fn connect_serving(
    listener: &Listener,
    credentials: &Credentials,
    verifier: Arc<dyn Verifier>,
    capabilities: Capabilities,
    commands: CommandCollection,
) -> Result<Connection, RpcError> {
    let connection = connect(listener, credentials, verifier.as_ref()).await?;
    let serving = connection.clone();
    let capabilities = Arc::new(capabilities);
    let commands = Arc::new(commands);
    tokio::spawn(async move { serving.serve(capabilities, commands).await });
    Ok(connection)
}

/// Wait until the peer with `fingerprint` shows up in `pool`
///
/// The listener registers a peer just after its side of the handshake, which
/// can trail the dialer's side by a few polls.
pub async fn wait_for_peer(pool: &ConnectionPool, fingerprint: &str) -> Result<Connection> {
    for _ in 0..100 {
        if let Some(connection) = pool.get(fingerprint) {
            return Ok(connection);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("peer {fingerprint} never joined the pool")
}

/// Open a bootstrap connection; no handshake takes place
pub fn connect_bootstrap(listener: &Listener) -> Connection {
    let (ours, theirs) = memory::pair();
    let listener = listener.clone();
    tokio::spawn(async move { listener.serve(Arc::new(theirs)).await });
    Connection::new(Arc::new(ours))
}
