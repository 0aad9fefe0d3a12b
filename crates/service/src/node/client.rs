use std::sync::Arc;
use std::time::Duration;

use iroh::Endpoint;
use tokio::net::TcpStream;

use common::enrollment::PendingEnrollment;
use common::host_config::{HostConfig, HostConfigArtifact};
use common::login::LoginRecord;
use common::pki::{
    authority, Certificate, CertificateType, Credentials, FallbackVerifier, HashAlgorithm,
    PkiError, RevocationRecord, RevocationStore, SignedArtifact, UpstreamVerifier,
};
use common::rpc::commands::{
    open_relayed, tcp_forward, AcceptEnrollment, ListEnrollments, Login, LoginResult, Ping,
    PublishHostConfig, Revoke, Setup, TcpForward,
};
use common::rpc::{Connection, SpliceStats, LOGIN_ALPN, SETUP_ALPN};

use super::{connect_authenticated, connect_bootstrap, parse_node_id, NodeError};
use crate::state::NodeState;

/// How long certificates issued by operators stay valid
pub const DEVICE_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Run first-time setup against a fresh server
///
/// `admin` must be the user credentials the root issued; the login record
/// lets the administrator sign in from other machines later.
pub async fn setup_server(
    endpoint: &Endpoint,
    server: &str,
    root: &Certificate,
    admin: &Credentials,
    server_name: &str,
    login: Option<(&str, &str)>,
) -> Result<Certificate, NodeError> {
    let login = login
        .map(|(username, password)| LoginRecord::new(username, password, admin))
        .transpose()?;
    let mut setup = Setup::new(root, admin, server_name, login)?;
    let connection = connect_bootstrap(endpoint, parse_node_id(server)?, SETUP_ALPN).await?;
    let result = connection.call(&mut setup).await;
    connection.close();
    result?;
    setup
        .certificate()
        .cloned()
        .ok_or_else(|| NodeError::Refused("server did not accept a certificate".into()))
}

/// Sign in with a username and password
///
/// Returns the user's certificate with its still-sealed key, and the root
/// and server certificates to pin.
pub async fn login(
    endpoint: &Endpoint,
    server: &str,
    username: &str,
    password: &str,
) -> Result<LoginResult, NodeError> {
    let connection = connect_bootstrap(endpoint, parse_node_id(server)?, LOGIN_ALPN).await?;
    let mut request = Login::new(username, password);
    let result = connection.call(&mut request).await;
    connection.close();
    result?;
    request
        .into_result()
        .ok_or_else(|| NodeError::Refused("login returned nothing".into()))
}

/// An operator connected to its server
pub struct Client {
    credentials: Credentials,
    verifier: Arc<UpstreamVerifier>,
    connection: Connection,
}

impl Client {
    pub async fn connect(state: &NodeState, endpoint: &Endpoint) -> Result<Self, NodeError> {
        let credentials = state.load_credentials()?;
        let upstream = state.load_upstream()?;
        let fallback = FallbackVerifier::new(state.load_root()?, upstream);
        let revocations = RevocationStore::new(state.open_store()?.scope("revocations"));
        let verifier = Arc::new(UpstreamVerifier::new(fallback, revocations));

        let server = parse_node_id(&state.config.upstream()?.node_id)?;
        let connection = connect_authenticated(
            endpoint,
            server,
            &credentials,
            verifier.as_ref(),
            state.config.expiration(),
        )
        .await?;
        verifier.attach(connection.clone());
        Ok(Self {
            credentials,
            verifier,
            connection,
        })
    }

    pub fn verifier(&self) -> &Arc<UpstreamVerifier> {
        &self.verifier
    }

    pub async fn ping(&self, payload: &str) -> Result<(), NodeError> {
        self.connection.call(&mut Ping::new(payload)).await?;
        Ok(())
    }

    /// Ping `target` through the server, end-to-end encrypted
    pub async fn ping_through(&self, target: &Certificate, payload: &str) -> Result<(), NodeError> {
        let mut session = open_relayed(&self.connection, target).await?;
        session.call(&mut Ping::new(payload)).await?;
        session.close().await;
        Ok(())
    }

    pub async fn list_enrollments(&self) -> Result<Vec<PendingEnrollment>, NodeError> {
        let mut list = ListEnrollments::new();
        self.connection.call(&mut list).await?;
        Ok(list.enrollments().to_vec())
    }

    /// Issue an agent certificate for the pending device with `fingerprint`
    /// and hand it to the server
    pub async fn accept_enrollment(&self, fingerprint: &str) -> Result<Certificate, NodeError> {
        let pending = self
            .list_enrollments()
            .await?
            .into_iter()
            .find(|pending| pending.fingerprint() == fingerprint)
            .ok_or_else(|| NodeError::Refused(format!("no pending enrollment for {fingerprint}")))?;
        let certificate = authority::issue(
            &self.credentials,
            &pending.public_key,
            &pending.name,
            CertificateType::Agent,
            DEVICE_VALIDITY,
        )?;
        self.connection
            .call(&mut AcceptEnrollment::new(&certificate))
            .await?;
        tracing::info!(name = %pending.name, fingerprint, "enrollment accepted");
        Ok(certificate)
    }

    /// Revoke on the server, then in this operator's own ledger
    pub async fn revoke(&self, certificate: &Certificate) -> Result<(), NodeError> {
        self.connection
            .call(&mut Revoke::of(certificate.der(), HashAlgorithm::Sha256))
            .await?;
        self.verifier
            .revocations()
            .revoke(&RevocationRecord::of(certificate.der(), HashAlgorithm::Sha256))?;
        tracing::info!(name = %certificate.name(), "certificate revoked");
        Ok(())
    }

    pub async fn publish_host_config(&self, config: HostConfig) -> Result<(), NodeError> {
        let artifact: HostConfigArtifact =
            SignedArtifact::sign(config, self.credentials.secret_key())?;
        self.connection
            .call(&mut PublishHostConfig::new(&artifact))
            .await?;
        Ok(())
    }

    /// Splice `local` with `address` as dialed by `target`
    pub async fn tunnel(
        &self,
        target: &Certificate,
        address: &str,
        local: TcpStream,
    ) -> Result<SpliceStats, NodeError> {
        let mut session = open_relayed(&self.connection, target).await?;
        session
            .call(&mut TcpForward::new(address))
            .await?;
        Ok(tcp_forward::tunnel(&mut session, local).await?)
    }

    pub fn close(&self) {
        self.verifier.detach();
        self.connection.close();
    }
}

/// Unseal a login result and persist it as this client's identity
pub fn store_login(
    state: &NodeState,
    result: &LoginResult,
    password: &str,
) -> Result<Credentials, NodeError> {
    let credentials = result.credentials(password)?;
    if result.certificate.kind() != CertificateType::User {
        return Err(PkiError::PermissionDenied(format!(
            "login is for a {} certificate",
            result.certificate.kind()
        ))
        .into());
    }
    state.save_root(&result.root)?;
    state.save_upstream(&result.server)?;
    state.save_credentials(&credentials)?;
    Ok(credentials)
}
