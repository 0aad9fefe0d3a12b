use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pki::{Certificate, CertificateType};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::connection::Connection;
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::b64;
use crate::rpc::session::Session;
use crate::rpc::splice::splice;

use super::e2e;

/// Relay this session to another peer through the server
///
/// After a `200` the session is a byte pipe to a fresh session on the
/// target; the relay never looks at what flows through. Callers are
/// expected to run [`e2e::secure`] over it before anything else, which
/// [`open_relayed`] does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    /// Target certificate, DER
    #[serde(with = "b64")]
    pub target: Vec<u8>,
}

impl Forward {
    pub fn new(target: &Certificate) -> Self {
        Self {
            target: target.der().to_vec(),
        }
    }
}

#[async_trait]
impl Command for Forward {
    const KEY: &'static str = "forward";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let requester = ctx.require_type(&[CertificateType::Root, CertificateType::User])?;
        let target = Certificate::from_der(&self.target)
            .map_err(|e| RpcError::BadRequest(format!("target certificate: {e}")))?;
        if !matches!(target.kind(), CertificateType::Server | CertificateType::Agent) {
            return Err(RpcError::BadRequest(format!(
                "cannot forward to a {} certificate",
                target.kind()
            )));
        }

        // Nothing is dialed for a target we cannot vouch for
        if let Err(e) = ctx.verifier().verify(&target).await {
            tracing::warn!(
                requester = %requester.name(),
                target = %target.name(),
                "refusing to forward: {}",
                e
            );
            return Err(e.into());
        }

        let connection = ctx.pool()?.get_or_connect(&target).await?;
        let mut outbound = connection
            .open_session()
            .await
            .map_err(|e| RpcError::Dial(format!("{}: {}", target.name(), e)))?;
        session.respond_ok().await?;
        tracing::info!(
            requester = %requester.name(),
            target = %target.name(),
            session = session.id(),
            "relaying session"
        );

        let inbound_stream = session.take_stream()?;
        let result = match outbound.take_stream() {
            Ok(outbound_stream) => splice(inbound_stream, outbound_stream).await.map(|_| ()),
            Err(e) => Err(e),
        };
        outbound.close().await;
        result?;
        Ok(Outcome::Done)
    }
}

/// Open an encrypted session to `target` relayed through `relay`
///
/// The returned session is ready for the inner command.
pub async fn open_relayed(relay: &Connection, target: &Certificate) -> Result<Session, RpcError> {
    let mut session = relay.open_session().await?;
    let result: Result<(), RpcError> = async {
        session.call(&mut Forward::new(target)).await?;
        e2e::secure(&mut session).await
    }
    .await;
    match result {
        Ok(()) => Ok(session),
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}
