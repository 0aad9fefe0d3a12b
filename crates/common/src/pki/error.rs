use crate::crypto::KeyError;
use crate::store::StoreError;

use super::certificate::CertificateError;

/// Trust failures
///
/// Every variant is a rejection; no call site treats one of these as
/// "allow". Storage and key failures met while deciding trust are carried
/// through as errors as well, so an undeterminable answer fails closed.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("certificate not verified: {0}")]
    CertificateNotVerified(String),
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("revoked")]
    Revoked,
    #[error("replay detected")]
    ReplayDetected,
    #[error("expired: {0}")]
    Expired(String),
    #[error("unknown key {0}")]
    UnknownKey(String),
    #[error("chain build failed: {0}")]
    ChainBuildFailed(String),
    #[error("verifier unreachable: {0}")]
    VerifierUnreachable(String),
    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for PkiError {
    fn from(e: bincode::Error) -> Self {
        PkiError::Encoding(e.to_string())
    }
}
