//! End-to-end encryption over an open session
//!
//! The client sends an ephemeral P-384 key in the request header. The
//! server answers with its own ephemeral key, fresh Argon2 parameters and
//! one IV per direction, then both sides stretch the ECDH secret into an
//! AES-256 key and wrap the session in AES-CFB. The next request on the
//! session travels encrypted and is dispatched like any other.
//!
//! Only what follows the handshake is protected; the handshake itself is
//! visible to anything relaying the session.

use std::fmt;

use async_trait::async_trait;
use p384::ecdh::EphemeralSecret;
use p384::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::{KdfParams, IV_SIZE};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::{self, b64, ResponseHeader};
use crate::rpc::session::Session;

#[derive(Serialize, Deserialize)]
pub struct E2e {
    /// The initiator's ephemeral key, SPKI DER
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(skip)]
    secret: Option<EphemeralSecret>,
}

impl fmt::Debug for E2e {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("E2e")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct E2eReply {
    #[serde(with = "b64")]
    public_key: Vec<u8>,
    params: KdfParams,
    #[serde(with = "b64")]
    server_iv: Vec<u8>,
    #[serde(with = "b64")]
    client_iv: Vec<u8>,
}

fn ephemeral() -> Result<(EphemeralSecret, Vec<u8>), RpcError> {
    let secret = EphemeralSecret::random(&mut OsRng);
    let public = secret
        .public_key()
        .to_public_key_der()
        .map_err(|e| RpcError::Encoding(e.to_string()))?;
    Ok((secret, public.as_bytes().to_vec()))
}

fn iv(bytes: &[u8]) -> Result<[u8; IV_SIZE], RpcError> {
    bytes
        .try_into()
        .map_err(|_| RpcError::BadRequest(format!("iv must be {IV_SIZE} bytes")))
}

/// Stretch the shared secret with `params` and wrap the session
fn seal(
    session: &mut Session,
    secret: &EphemeralSecret,
    peer_public: &[u8],
    params: &KdfParams,
    write_iv: &[u8; IV_SIZE],
    read_iv: &[u8; IV_SIZE],
) -> Result<(), RpcError> {
    let peer = p384::PublicKey::from_public_key_der(peer_public)
        .map_err(|e| RpcError::BadRequest(format!("ephemeral key: {e}")))?;
    let shared = secret.diffie_hellman(&peer);
    let key = params.derive(shared.raw_secret_bytes().as_slice())?;
    session.encrypt(&key, write_iv, read_iv)
}

impl E2e {
    pub fn new() -> Result<Self, RpcError> {
        let (secret, public_key) = ephemeral()?;
        Ok(Self {
            public_key,
            secret: Some(secret),
        })
    }
}

#[async_trait]
impl Command for E2e {
    const KEY: &'static str = "e2e";

    async fn execute_server(self, session: &mut Session, _ctx: &Context) -> Result<Outcome, RpcError> {
        let (secret, public_key) = ephemeral()?;
        let params = KdfParams::generate();
        let mut server_iv = [0u8; IV_SIZE];
        let mut client_iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut server_iv);
        OsRng.fill_bytes(&mut client_iv);

        // Reject a bad client key before answering
        p384::PublicKey::from_public_key_der(&self.public_key)
            .map_err(|e| RpcError::BadRequest(format!("ephemeral key: {e}")))?;

        let reply = E2eReply {
            public_key,
            params: params.clone(),
            server_iv: server_iv.to_vec(),
            client_iv: client_iv.to_vec(),
        };
        session
            .respond_with(ResponseHeader::ok().with_info(serde_json::to_value(&reply)?))
            .await?;
        seal(session, &secret, &self.public_key, &params, &server_iv, &client_iv)?;
        tracing::debug!(session = session.id(), "session encrypted");
        Ok(Outcome::Continue)
    }

    async fn execute_client(
        &mut self,
        session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        let reply: E2eReply = header::parse_info(response)?;
        let secret = self
            .secret
            .take()
            .ok_or_else(|| RpcError::BadRequest("e2e handshake already used".into()))?;
        seal(
            session,
            &secret,
            &reply.public_key,
            &reply.params,
            &iv(&reply.client_iv)?,
            &iv(&reply.server_iv)?,
        )
    }
}

/// Run the handshake on `session`; later traffic on it is encrypted
pub async fn secure(session: &mut Session) -> Result<(), RpcError> {
    let mut handshake = E2e::new()?;
    session.call(&mut handshake).await?;
    Ok(())
}
