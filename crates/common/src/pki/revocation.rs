use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};

use crate::store::Scope;

use super::error::PkiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 2] = [HashAlgorithm::Sha256, HashAlgorithm::Sha384];

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        }
    }
}

/// Identifies a revoked artifact by the hash of its signed bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub hash: Vec<u8>,
    pub algorithm: HashAlgorithm,
}

impl RevocationRecord {
    /// Record for `data` hashed with `algorithm`
    pub fn of(data: &[u8], algorithm: HashAlgorithm) -> Self {
        Self {
            hash: algorithm.digest(data),
            algorithm,
        }
    }

    fn key(&self) -> Vec<u8> {
        format!("{}:{}", self.algorithm.as_str(), hex::encode(&self.hash)).into_bytes()
    }
}

/// Hash-indexed revocation ledger
///
/// Any signed object can be revoked, certificates included (their DER is
/// the signed bytes). Lookups that cannot be answered are errors.
#[derive(Debug, Clone)]
pub struct RevocationStore {
    scope: Scope,
}

impl RevocationStore {
    pub fn new(scope: Scope) -> Self {
        Self { scope }
    }

    pub fn revoke(&self, record: &RevocationRecord) -> Result<(), PkiError> {
        let key = record.key();
        self.scope.update(|tx| {
            tx.put(&key, crate::clock::now().to_be_bytes().to_vec());
            Ok(())
        })?;
        tracing::info!(
            algorithm = record.algorithm.as_str(),
            hash = %hex::encode(&record.hash),
            "recorded revocation"
        );
        Ok(())
    }

    pub fn is_revoked(&self, record: &RevocationRecord) -> Result<bool, PkiError> {
        let key = record.key();
        Ok(self.scope.view(|tx| Ok(tx.get(&key).is_some()))?)
    }

    /// Fail with `Revoked` if `data` hashes to any recorded value
    pub fn check(&self, data: &[u8]) -> Result<(), PkiError> {
        for algorithm in HashAlgorithm::ALL {
            if self.is_revoked(&RevocationRecord::of(data, algorithm))? {
                return Err(PkiError::Revoked);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize, PkiError> {
        Ok(self.scope.view(|tx| Ok(tx.scan_prefix(b"").len()))?)
    }
}
