use async_trait::async_trait;

use crate::clock;
use crate::crypto::PublicKey;
use crate::pki::chain::build_chain;
use crate::pki::{Certificate, CertificateRegistry, Chain, PkiError, RevocationStore};

use super::Verifier;

/// Verifies against the root plus every registered user certificate
///
/// Used by the server, which holds the full registry. A presented
/// certificate must be byte-identical to the one registered for its key.
#[derive(Debug, Clone)]
pub struct LocalVerifier {
    root: Certificate,
    registry: CertificateRegistry,
    revocations: RevocationStore,
}

impl LocalVerifier {
    pub fn new(
        root: Certificate,
        registry: CertificateRegistry,
        revocations: RevocationStore,
    ) -> Self {
        Self {
            root,
            registry,
            revocations,
        }
    }

    pub fn root(&self) -> &Certificate {
        &self.root
    }

    pub fn registry(&self) -> &CertificateRegistry {
        &self.registry
    }

    pub fn revocations(&self) -> &RevocationStore {
        &self.revocations
    }

    /// Chain for a certificate that is not (yet) registered
    ///
    /// Used when admitting new certificates: the chain must still end at
    /// the root, through registered intermediates, with nothing revoked.
    pub fn verify_unregistered(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        self.chain_for(certificate)
    }

    fn chain_for(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        let intermediates = self.registry.users()?;
        let chain = build_chain(certificate, &self.root, &intermediates, clock::now())?;
        for member in chain.certificates() {
            self.revocations.check(member.der())?;
        }
        Ok(chain)
    }
}

#[async_trait]
impl Verifier for LocalVerifier {
    async fn verify(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        if certificate.der() == self.root.der() {
            return self.chain_for(certificate);
        }
        let stored = self
            .registry
            .get_by_key(certificate.public_key())?
            .ok_or_else(|| PkiError::UnknownKey(certificate.fingerprint()))?;
        if stored.der() != certificate.der() {
            tracing::warn!(
                key = %certificate.fingerprint(),
                "presented certificate differs from the registered one"
            );
            return Err(PkiError::CertificateNotVerified(
                "certificate does not match the registered certificate for its key".into(),
            ));
        }
        self.chain_for(&stored)
    }

    async fn verify_public_key(&self, key: &PublicKey) -> Result<Chain, PkiError> {
        if key == self.root.public_key() {
            return self.chain_for(&self.root);
        }
        let stored = self
            .registry
            .get_by_key(key)?
            .ok_or_else(|| PkiError::UnknownKey(key.fingerprint()))?;
        self.chain_for(&stored)
    }
}
