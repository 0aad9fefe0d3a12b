use async_trait::async_trait;

use crate::crypto::PublicKey;
use crate::pki::{Certificate, Chain, PkiError};

use super::Verifier;

/// Accepts everything
///
/// Only for the bootstrap protocols (first-time setup, enrollment, login)
/// that run before any trust exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct NilVerifier;

#[async_trait]
impl Verifier for NilVerifier {
    async fn verify(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        Ok(Chain::new(vec![certificate.clone()]))
    }

    async fn verify_public_key(&self, _key: &PublicKey) -> Result<Chain, PkiError> {
        Ok(Chain::default())
    }
}
