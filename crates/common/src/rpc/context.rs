use std::sync::Arc;
use std::time::Duration;

use crate::enrollment::EnrollmentManager;
use crate::host_config::HostConfigStore;
use crate::login::LoginDirectory;
use crate::pki::{
    Certificate, CertificateRegistry, CertificateType, LocalVerifier, NonceStore, PkiError,
    RevocationStore, Verifier,
};

use super::commands::setup::SetupState;
use super::command::CommandCollection;
use super::connection::Connection;
use super::error::RpcError;
use super::pool::ConnectionPool;

/// Default freshness window for requests and signed artifacts
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(30);

/// Everything a command handler may reach on this node
///
/// Built once per listener by the owning node. Optional parts are only
/// present on nodes that play the corresponding role; a handler asking
/// for a missing part gets a 503.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub verifier: Arc<dyn Verifier>,
    /// This node's own certificate, once it has one
    pub identity: Option<Certificate>,
    pub expiration: Duration,
    /// Shared replay store for bootstrap listeners, which have no
    /// per-connection identity to scope one to
    pub bootstrap_nonces: Option<NonceStore>,
    pub trust: Option<Arc<LocalVerifier>>,
    pub registry: Option<CertificateRegistry>,
    pub revocations: Option<RevocationStore>,
    pub enrollments: Option<EnrollmentManager>,
    pub host_configs: Option<HostConfigStore>,
    pub pool: Option<ConnectionPool>,
    pub setup: Option<SetupState>,
    pub logins: Option<LoginDirectory>,
    pub tunnels: bool,
}

impl Capabilities {
    pub fn new(verifier: Arc<dyn Verifier>) -> Self {
        Self {
            verifier,
            identity: None,
            expiration: DEFAULT_EXPIRATION,
            bootstrap_nonces: None,
            trust: None,
            registry: None,
            revocations: None,
            enrollments: None,
            host_configs: None,
            pool: None,
            setup: None,
            logins: None,
            tunnels: false,
        }
    }

    pub fn with_identity(mut self, certificate: Certificate) -> Self {
        self.identity = Some(certificate);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_bootstrap_nonces(mut self, nonces: NonceStore) -> Self {
        self.bootstrap_nonces = Some(nonces);
        self
    }

    /// Local trust: the server's verifier, registry and revocation ledger
    pub fn with_trust(mut self, trust: Arc<LocalVerifier>) -> Self {
        self.registry = Some(trust.registry().clone());
        self.revocations = Some(trust.revocations().clone());
        self.trust = Some(trust);
        self
    }

    pub fn with_revocations(mut self, revocations: RevocationStore) -> Self {
        self.revocations = Some(revocations);
        self
    }

    pub fn with_enrollments(mut self, enrollments: EnrollmentManager) -> Self {
        self.enrollments = Some(enrollments);
        self
    }

    pub fn with_host_configs(mut self, host_configs: HostConfigStore) -> Self {
        self.host_configs = Some(host_configs);
        self
    }

    pub fn with_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_setup(mut self, setup: SetupState) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn with_logins(mut self, logins: LoginDirectory) -> Self {
        self.logins = Some(logins);
        self
    }

    pub fn with_tunnels(mut self, enabled: bool) -> Self {
        self.tunnels = enabled;
        self
    }
}

fn require<'a, T>(part: &'a Option<T>, name: &'static str) -> Result<&'a T, RpcError> {
    part.as_ref().ok_or(RpcError::Unavailable(name))
}

/// Per-session view handed to command handlers
#[derive(Debug, Clone)]
pub struct Context {
    pub connection: Connection,
    pub capabilities: Arc<Capabilities>,
    pub commands: Arc<CommandCollection>,
}

impl Context {
    pub fn verifier(&self) -> &Arc<dyn Verifier> {
        &self.capabilities.verifier
    }

    pub fn expiration(&self) -> Duration {
        self.capabilities.expiration
    }

    /// Replay store for this request: the listener's shared one during
    /// bootstrap, otherwise the connection's own
    pub fn nonces(&self) -> NonceStore {
        self.capabilities
            .bootstrap_nonces
            .clone()
            .unwrap_or_else(|| self.connection.nonces().clone())
    }

    pub fn identity(&self) -> Result<&Certificate, RpcError> {
        require(&self.capabilities.identity, "node identity")
    }

    pub fn trust(&self) -> Result<&Arc<LocalVerifier>, RpcError> {
        require(&self.capabilities.trust, "local trust")
    }

    pub fn registry(&self) -> Result<&CertificateRegistry, RpcError> {
        require(&self.capabilities.registry, "certificate registry")
    }

    pub fn revocations(&self) -> Result<&RevocationStore, RpcError> {
        require(&self.capabilities.revocations, "revocation store")
    }

    pub fn enrollments(&self) -> Result<&EnrollmentManager, RpcError> {
        require(&self.capabilities.enrollments, "enrollment")
    }

    pub fn host_configs(&self) -> Result<&HostConfigStore, RpcError> {
        require(&self.capabilities.host_configs, "host configuration")
    }

    pub fn pool(&self) -> Result<&ConnectionPool, RpcError> {
        require(&self.capabilities.pool, "relay")
    }

    pub fn setup(&self) -> Result<&SetupState, RpcError> {
        require(&self.capabilities.setup, "setup")
    }

    pub fn logins(&self) -> Result<&LoginDirectory, RpcError> {
        require(&self.capabilities.logins, "login")
    }

    /// The verified certificate of the peer on this connection
    pub fn peer_certificate(&self) -> Result<Certificate, RpcError> {
        self.connection.peer_certificate().ok_or_else(|| {
            PkiError::PermissionDenied("peer identity is not verified".into()).into()
        })
    }

    /// Reject unless the verified peer holds one of `allowed`
    pub fn require_type(&self, allowed: &[CertificateType]) -> Result<Certificate, RpcError> {
        let certificate = self.peer_certificate()?;
        if !allowed.contains(&certificate.kind()) {
            return Err(PkiError::PermissionDenied(format!(
                "{} peers may not run this command",
                certificate.kind()
            ))
            .into());
        }
        Ok(certificate)
    }
}
