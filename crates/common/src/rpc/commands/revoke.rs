use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::pki::{CertificateType, HashAlgorithm, RevocationRecord};
use crate::rpc::command::{Command, Outcome};
use crate::rpc::context::Context;
use crate::rpc::error::RpcError;
use crate::rpc::header::b64;
use crate::rpc::session::Session;

/// Put a payload hash on the server's revocation ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revoke {
    #[serde(with = "b64")]
    pub hash: Vec<u8>,
    pub algorithm: HashAlgorithm,
}

impl Revoke {
    /// Revoke whatever hashes to `data`'s digest, e.g. a certificate DER
    pub fn of(data: &[u8], algorithm: HashAlgorithm) -> Self {
        let record = RevocationRecord::of(data, algorithm);
        Self {
            hash: record.hash,
            algorithm: record.algorithm,
        }
    }
}

#[async_trait]
impl Command for Revoke {
    const KEY: &'static str = "revoke";

    async fn execute_server(self, session: &mut Session, ctx: &Context) -> Result<Outcome, RpcError> {
        let operator = ctx.require_type(&[CertificateType::Root, CertificateType::User])?;
        let expected = self.algorithm.digest(b"").len();
        if self.hash.len() != expected {
            return Err(RpcError::BadRequest(format!(
                "{} hashes are {} bytes",
                self.algorithm.as_str(),
                expected
            )));
        }
        let record = RevocationRecord {
            hash: self.hash,
            algorithm: self.algorithm,
        };
        ctx.revocations()?.revoke(&record)?;
        tracing::info!(
            operator = %operator.name(),
            hash = %hex::encode(&record.hash),
            algorithm = record.algorithm.as_str(),
            "revoked"
        );
        session.respond_ok().await?;
        Ok(Outcome::Done)
    }
}
