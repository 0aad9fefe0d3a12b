//! Mutual authentication on the steady-state protocol
//!
//! Before any command runs, the dialer opens one session and sends a
//! `hello` carrying a signed artifact over its certificate and the
//! responder's transport id. The responder answers with its own artifact
//! bound to the dialer's id. Binding the transport id stops a captured
//! hello from being replayed on a different link; the nonce stops it from
//! being replayed on the same one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::pki::{Certificate, Chain, Credentials, NonceStore, PkiError, SignedArtifact, Verifier};

use super::connection::{Connection, PeerIdentity};
use super::error::RpcError;
use super::header::{self, b64, ResponseHeader};

pub const HELLO: &str = "hello";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub certificate: Certificate,
    /// Transport id of the side this hello is addressed to
    pub responder: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloMessage {
    #[serde(with = "b64")]
    artifact: Vec<u8>,
}

fn sign_hello(credentials: &Credentials, responder: String) -> Result<Vec<u8>, RpcError> {
    let hello = Hello {
        certificate: credentials.certificate()?.clone(),
        responder,
    };
    let artifact = SignedArtifact::sign(hello, credentials.secret_key())?;
    Ok(artifact.to_bytes().to_vec())
}

/// Check a peer's hello; all of it before the peer is trusted with anything
async fn check_hello(
    bytes: &[u8],
    nonces: &NonceStore,
    expiration: Duration,
    local_id: &str,
    verifier: &dyn Verifier,
) -> Result<Chain, RpcError> {
    let artifact = SignedArtifact::<Hello>::from_bytes(bytes)?;
    artifact.check_freshness(nonces, expiration, clock::now())?;
    let hello = artifact.body();
    if artifact.creator() != hello.certificate.public_key() {
        return Err(PkiError::SignatureInvalid.into());
    }
    if hello.responder != local_id {
        return Err(PkiError::PermissionDenied("hello addressed to another node".into()).into());
    }
    Ok(verifier.verify(&hello.certificate).await?)
}

/// Dialer side: send our hello, verify the responder's
pub async fn initiate(
    connection: &Connection,
    credentials: &Credentials,
    verifier: &dyn Verifier,
    expiration: Duration,
) -> Result<Chain, RpcError> {
    let message = HelloMessage {
        artifact: sign_hello(credentials, connection.remote_id())?,
    };
    let mut session = connection.open_session().await?;
    let result: Result<Chain, RpcError> = async {
        session
            .write_request(&header::RequestHeader {
                cmd: HELLO.to_string(),
                timestamp: clock::now(),
                args: header::to_args(&message)?,
            })
            .await?;
        let response = session.read_response().await?;
        if !response.is_ok() {
            return Err(response.into_error());
        }
        let reply: HelloMessage = header::parse_info(&response)?;
        check_hello(
            &reply.artifact,
            connection.nonces(),
            expiration,
            &connection.local_id(),
            verifier,
        )
        .await
    }
    .await;
    session.close().await;

    match result {
        Ok(chain) => {
            connection.set_peer(PeerIdentity::Verified(chain.clone()));
            Ok(chain)
        }
        Err(e) => {
            tracing::warn!(remote = %connection.remote_id(), "handshake failed: {}", e);
            connection.close();
            Err(e)
        }
    }
}

/// Responder side: verify the dialer's hello and answer with ours
///
/// Any failure is reported on the hello session and closes the connection.
pub async fn accept(
    connection: &Connection,
    credentials: &Credentials,
    verifier: &dyn Verifier,
    expiration: Duration,
) -> Result<Chain, RpcError> {
    let mut session = connection.accept_session().await?;
    let result: Result<Chain, RpcError> = async {
        let request = session.read_request().await?;
        if request.cmd != HELLO {
            return Err(RpcError::BadRequest(format!(
                "expected {HELLO}, got {}",
                request.cmd
            )));
        }
        let message: HelloMessage = serde_json::from_value(serde_json::Value::Object(request.args))
            .map_err(|e| RpcError::BadRequest(e.to_string()))?;
        check_hello(
            &message.artifact,
            connection.nonces(),
            expiration,
            &connection.local_id(),
            verifier,
        )
        .await
    }
    .await;

    let outcome = match result {
        Ok(chain) => {
            let reply = sign_hello(credentials, connection.remote_id()).and_then(|artifact| {
                Ok(ResponseHeader::ok().with_info(serde_json::to_value(HelloMessage { artifact })?))
            });
            match reply {
                Ok(reply) => session.respond_with(reply).await.map(|_| chain),
                Err(e) => Err(e),
            }
        }
        Err(e) => {
            let _ = session.respond(e.status(), e.to_string()).await;
            Err(e)
        }
    };
    session.close().await;

    match outcome {
        Ok(chain) => {
            tracing::debug!(
                remote = %connection.remote_id(),
                peer = %chain.leaf().map(Certificate::name).unwrap_or_default(),
                "peer verified"
            );
            connection.set_peer(PeerIdentity::Verified(chain.clone()));
            Ok(chain)
        }
        Err(e) => {
            tracing::warn!(remote = %connection.remote_id(), "rejected hello: {}", e);
            connection.close();
            Err(e)
        }
    }
}
