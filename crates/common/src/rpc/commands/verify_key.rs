use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::pki::Certificate;
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::{self, b64, ResponseHeader};
use crate::rpc::session::Session;

/// Ask the server to verify a public key and return its chain
///
/// The answer is only chain data: the asking side rebuilds and checks the
/// chain itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyKey {
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    #[serde(skip)]
    chain: Vec<Certificate>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChainInfo {
    #[serde(with = "b64::list")]
    chain: Vec<Vec<u8>>,
}

impl VerifyKey {
    pub fn new(key: &PublicKey) -> Self {
        Self {
            public_key: key.to_der().to_vec(),
            chain: Vec::new(),
        }
    }

    /// Leaf first, as returned by the server
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn into_chain(self) -> Vec<Certificate> {
        self.chain
    }
}

#[async_trait]
impl Command for VerifyKey {
    const KEY: &'static str = "verify_key";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        ctx.peer_certificate()?;
        let key = PublicKey::from_der(&self.public_key)
            .map_err(|e| RpcError::BadRequest(e.to_string()))?;
        let chain = ctx.verifier().verify_public_key(&key).await?;
        let info = ChainInfo {
            chain: chain
                .certificates()
                .iter()
                .map(|certificate| certificate.der().to_vec())
                .collect(),
        };
        session
            .respond_with(ResponseHeader::ok().with_info(serde_json::to_value(info)?))
            .await?;
        Ok(Outcome::Done)
    }

    async fn execute_client(
        &mut self,
        _session: &mut Session,
        response: &ResponseHeader,
    ) -> Result<(), RpcError> {
        let info: ChainInfo = header::parse_info(response)?;
        self.chain = info
            .chain
            .iter()
            .map(|der| Certificate::from_der(der))
            .collect::<Result<_, _>>()
            .map_err(|e| RpcError::Encoding(e.to_string()))?;
        Ok(())
    }
}
