use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::crypto::PublicKey;
use crate::login::LoginRecord;
use crate::pki::{
    authority, build_chain, Certificate, CertificateType, Credentials, PkiError, SignedArtifact,
};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::{RpcError, Status};
use crate::rpc::header::{self, b64, ResponseHeader};
use crate::rpc::session::Session;

/// Validity of the server certificate issued during setup
pub const SERVER_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What the administrator uploads to a fresh server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRequest {
    pub root: Certificate,
    pub admin: Certificate,
    pub server_name: String,
    pub login: Option<LoginRecord>,
}

/// Handed to the server node once setup went through
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub root: Certificate,
    pub admin: Certificate,
    pub credentials: Credentials,
    pub login: Option<LoginRecord>,
}

/// The not-yet-configured server's side of setup
///
/// Holds the temporary credentials until one setup succeeds; a second
/// attempt finds them gone and is refused.
#[derive(Clone)]
pub struct SetupState {
    credentials: Arc<Mutex<Option<Credentials>>>,
    completed: flume::Sender<SetupOutcome>,
}

impl fmt::Debug for SetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupState")
            .field("pending", &self.credentials.lock().is_some())
            .finish()
    }
}

impl SetupState {
    pub fn new(credentials: Credentials) -> (Self, flume::Receiver<SetupOutcome>) {
        let (completed, receiver) = flume::bounded(1);
        let state = Self {
            credentials: Arc::new(Mutex::new(Some(credentials))),
            completed,
        };
        (state, receiver)
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.credentials.lock().as_ref().map(Credentials::public_key)
    }

    fn take(&self) -> Option<Credentials> {
        self.credentials.lock().take()
    }

    fn restore(&self, credentials: Credentials) {
        *self.credentials.lock() = Some(credentials);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SetupReply {
    #[serde(with = "b64")]
    public_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SetupAck {
    error: Option<String>,
}

/// First-time server setup, run by the administrator on the setup protocol
#[derive(Serialize, Deserialize)]
pub struct Setup {
    #[serde(with = "b64")]
    pub artifact: Vec<u8>,
    #[serde(skip)]
    issuer: Option<Credentials>,
    #[serde(skip)]
    server_name: String,
    #[serde(skip)]
    certificate: Option<Certificate>,
}

impl fmt::Debug for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setup")
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl Setup {
    pub fn new(
        root: &Certificate,
        admin: &Credentials,
        server_name: impl Into<String>,
        login: Option<LoginRecord>,
    ) -> Result<Self, RpcError> {
        let server_name = server_name.into();
        let request = SetupRequest {
            root: root.clone(),
            admin: admin.certificate()?.clone(),
            server_name: server_name.clone(),
            login,
        };
        let artifact = SignedArtifact::sign(request, admin.secret_key())?;
        Ok(Self {
            artifact: artifact.to_bytes().to_vec(),
            issuer: Some(admin.clone()),
            server_name,
            certificate: None,
        })
    }

    /// The server certificate issued during the exchange
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }
}

fn check_request(artifact: &SignedArtifact<SetupRequest>) -> Result<(), PkiError> {
    let request = artifact.body();
    if request.root.kind() != CertificateType::Root || request.admin.kind() != CertificateType::User
    {
        return Err(PkiError::PermissionDenied(
            "setup needs a root and a user certificate".into(),
        ));
    }
    request.root.verify_issued_by(&request.root)?;
    request.admin.verify_issued_by(&request.root)?;
    if artifact.creator() != request.admin.public_key() {
        return Err(PkiError::SignatureInvalid);
    }
    if let Some(login) = &request.login {
        if login.certificate != request.admin {
            return Err(PkiError::PermissionDenied(
                "login record is not for the administrator".into(),
            ));
        }
    }
    Ok(())
}

fn admit_server_certificate(
    der: &[u8],
    request: &SetupRequest,
    credentials: &mut Credentials,
) -> Result<(), PkiError> {
    let certificate = Certificate::from_der(der)?;
    if certificate.kind() != CertificateType::Server {
        return Err(PkiError::PermissionDenied(format!(
            "expected a server certificate, got {}",
            certificate.kind()
        )));
    }
    build_chain(
        &certificate,
        &request.root,
        std::slice::from_ref(&request.admin),
        clock::now(),
    )?;
    credentials.promote(certificate)
}

#[async_trait]
impl Command for Setup {
    const KEY: &'static str = "setup";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let artifact = SignedArtifact::<SetupRequest>::from_bytes(&self.artifact)?;
        artifact.check_freshness(&ctx.nonces(), ctx.expiration(), clock::now())?;
        check_request(&artifact)?;

        let setup = ctx.setup()?;
        let mut credentials = setup
            .take()
            .ok_or_else(|| RpcError::Conflict("server is already set up".into()))?;
        let reply = SetupReply {
            public_key: credentials.public_key().to_der().to_vec(),
        };
        if let Err(e) = session
            .respond_with(ResponseHeader::ok().with_info(serde_json::to_value(reply)?))
            .await
        {
            setup.restore(credentials);
            return Err(e);
        }

        let der: Vec<u8> = match session.recv().await {
            Ok(der) => der,
            Err(e) => {
                setup.restore(credentials);
                return Err(e);
            }
        };
        let request = artifact.into_body();
        if let Err(e) = admit_server_certificate(&der, &request, &mut credentials) {
            tracing::warn!("setup rejected the issued certificate: {}", e);
            setup.restore(credentials);
            session
                .send(&SetupAck {
                    error: Some(e.to_string()),
                })
                .await?;
            return Ok(Outcome::Done);
        }

        session.send(&SetupAck { error: None }).await?;
        tracing::info!(admin = %request.admin.name(), server = %request.server_name, "server set up");
        let outcome = SetupOutcome {
            root: request.root,
            admin: request.admin,
            credentials,
            login: request.login,
        };
        setup
            .completed
            .send_async(outcome)
            .await
            .map_err(|_| RpcError::Unavailable("setup"))?;
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        let reply: SetupReply = header::parse_info(response)?;
        let server_key = PublicKey::from_der(&reply.public_key)?;
        let issuer = self
            .issuer
            .as_ref()
            .ok_or_else(|| RpcError::BadRequest("setup has no issuing credentials".into()))?;
        let certificate = authority::issue(
            issuer,
            &server_key,
            &self.server_name,
            CertificateType::Server,
            SERVER_VALIDITY,
        )?;
        session.send(&certificate.der().to_vec()).await?;

        let ack: SetupAck = session.recv().await?;
        if let Some(error) = ack.error {
            return Err(RpcError::Remote {
                code: Status::BadRequest.code(),
                msg: error,
            });
        }
        self.certificate = Some(certificate);
        Ok(())
    }
}
