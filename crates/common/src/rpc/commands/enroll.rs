use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::crypto::SecretKey;
use crate::enrollment::{EnrollmentError, EnrollmentOutcome, PendingEnrollment};
use crate::pki::{Certificate, CertificateType, SignedArtifact};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::{b64, ResponseHeader};
use crate::rpc::session::Session;

/// What a device asks to be enrolled as
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub name: String,
}

/// Device side of enrollment, on the bootstrap protocol
///
/// The request is signed with the device key, which proves possession of
/// the key the certificate will be issued for. After the `200` the device
/// keeps the session open until the server sends the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enroll {
    #[serde(with = "b64")]
    pub artifact: Vec<u8>,
    #[serde(skip)]
    outcome: Option<EnrollmentOutcome>,
}

impl Enroll {
    pub fn new(name: impl Into<String>, key: &SecretKey) -> Result<Self, RpcError> {
        let artifact = SignedArtifact::sign(EnrollRequest { name: name.into() }, key)?;
        Ok(Self {
            artifact: artifact.to_bytes().to_vec(),
            outcome: None,
        })
    }

    pub fn outcome(&self) -> Option<&EnrollmentOutcome> {
        self.outcome.as_ref()
    }

    pub fn into_outcome(self) -> Option<EnrollmentOutcome> {
        self.outcome
    }
}

enum Wait {
    Verdict(EnrollmentOutcome),
    Expired,
    Gone,
}

#[async_trait]
impl Command for Enroll {
    const KEY: &'static str = "enroll";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let artifact = SignedArtifact::<EnrollRequest>::from_bytes(&self.artifact)?;
        artifact.check_freshness(&ctx.nonces(), ctx.expiration(), clock::now())?;

        let manager = ctx.enrollments()?;
        let fingerprint = artifact.creator().fingerprint();
        let mut verdict = manager.request(
            artifact.creator().clone(),
            artifact.body().name.clone(),
            ctx.connection.remote_address(),
        )?;
        if let Err(e) = session.respond_ok().await {
            manager.expire(&fingerprint);
            return Err(e);
        }
        manager.mark_pending(&fingerprint);

        let wait = tokio::select! {
            outcome = &mut verdict => Wait::Verdict(outcome.unwrap_or(EnrollmentOutcome::TimedOut)),
            _ = tokio::time::sleep(manager.lifetime()) => Wait::Expired,
            _ = ctx.connection.closed() => Wait::Gone,
        };
        let outcome = match wait {
            Wait::Verdict(outcome) => outcome,
            Wait::Expired => {
                // An accept may have won the race; the receiver says which
                manager.expire(&fingerprint);
                verdict.await.unwrap_or(EnrollmentOutcome::TimedOut)
            }
            Wait::Gone => {
                manager.expire(&fingerprint);
                return Ok(Outcome::Done);
            }
        };
        session.send(&outcome).await?;
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        session: &mut Session,
        _response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        self.outcome = Some(session.recv().await?);
        Ok(())
    }
}

/// Operator view of waiting devices
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListEnrollments {
    #[serde(skip)]
    enrollments: Vec<PendingEnrollment>,
}

impl ListEnrollments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enrollments(&self) -> &[PendingEnrollment] {
        &self.enrollments
    }
}

#[async_trait]
impl Command for ListEnrollments {
    const KEY: &'static str = "list_enrollments";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        ctx.require_type(&[CertificateType::Root, CertificateType::User])?;
        let enrollments = ctx.enrollments()?.list();
        session.respond_ok().await?;
        session.send(&enrollments).await?;
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        session: &mut Session,
        _response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        self.enrollments = session.recv().await?;
        Ok(())
    }
}

/// Approve a waiting device with a certificate the operator issued
///
/// The server admits the certificate only if it is for the waiting key
/// and chains to the root through registered users; it then registers
/// the device and hands the certificate down the device's open session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptEnrollment {
    #[serde(with = "b64")]
    pub certificate: Vec<u8>,
}

impl AcceptEnrollment {
    pub fn new(certificate: &Certificate) -> Self {
        Self {
            certificate: certificate.der().to_vec(),
        }
    }
}

#[async_trait]
impl Command for AcceptEnrollment {
    const KEY: &'static str = "accept_enrollment";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let operator = ctx.require_type(&[CertificateType::Root, CertificateType::User])?;
        let certificate = Certificate::from_der(&self.certificate)
            .map_err(|e| RpcError::BadRequest(format!("certificate: {e}")))?;
        let trust = ctx.trust()?;
        let registry = ctx.registry()?;

        let accepted = ctx
            .enrollments()?
            .accept(&certificate.fingerprint(), |pending| {
                if certificate.public_key() != &pending.public_key {
                    return Err(EnrollmentError::NotFound(certificate.fingerprint()));
                }
                if !matches!(
                    certificate.kind(),
                    CertificateType::Agent | CertificateType::Server
                ) {
                    return Err(crate::pki::PkiError::PermissionDenied(format!(
                        "devices cannot hold {} certificates",
                        certificate.kind()
                    ))
                    .into());
                }
                let chain = trust.verify_unregistered(&certificate)?;
                registry.put_device(&certificate)?;
                Ok((certificate.clone(), chain))
            })?;

        tracing::info!(
            operator = %operator.name(),
            device = %accepted.name(),
            key = %accepted.fingerprint(),
            "device enrolled"
        );
        session.respond_ok().await?;
        Ok(Outcome::Done)
    }
}
