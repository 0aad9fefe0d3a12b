use async_trait::async_trait;

use crate::clock;
use crate::crypto::PublicKey;
use crate::pki::{Certificate, Chain, PkiError, RevocationStore};

use super::Verifier;

/// Trusts exactly the pinned root and the pinned upstream, nothing else
#[derive(Debug, Clone)]
pub struct FallbackVerifier {
    root: Certificate,
    upstream: Certificate,
    revocations: Option<RevocationStore>,
}

impl FallbackVerifier {
    pub fn new(root: Certificate, upstream: Certificate) -> Self {
        Self {
            root,
            upstream,
            revocations: None,
        }
    }

    pub fn with_revocations(mut self, revocations: RevocationStore) -> Self {
        self.revocations = Some(revocations);
        self
    }

    pub fn root(&self) -> &Certificate {
        &self.root
    }

    pub fn upstream(&self) -> &Certificate {
        &self.upstream
    }

    /// Chain for a pinned certificate, if `certificate` is one
    pub(crate) fn pinned(&self, certificate: &Certificate) -> Option<Result<Chain, PkiError>> {
        if certificate.der() == self.root.der() {
            return Some(self.finish(vec![self.root.clone()]));
        }
        if certificate.der() == self.upstream.der() {
            return Some(self.finish(vec![self.upstream.clone(), self.root.clone()]));
        }
        None
    }

    pub(crate) fn pinned_key(&self, key: &PublicKey) -> Option<Result<Chain, PkiError>> {
        if key == self.root.public_key() {
            return self.pinned(&self.root.clone());
        }
        if key == self.upstream.public_key() {
            return self.pinned(&self.upstream.clone());
        }
        None
    }

    fn finish(&self, chain: Vec<Certificate>) -> Result<Chain, PkiError> {
        let now = clock::now();
        for certificate in &chain {
            if !certificate.is_valid_at(now) {
                return Err(PkiError::Expired(format!(
                    "pinned certificate {} is outside its validity window",
                    certificate.name()
                )));
            }
            if let Some(revocations) = &self.revocations {
                revocations.check(certificate.der())?;
            }
        }
        Ok(Chain::new(chain))
    }
}

#[async_trait]
impl Verifier for FallbackVerifier {
    async fn verify(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        self.pinned(certificate).unwrap_or_else(|| {
            Err(PkiError::CertificateNotVerified(format!(
                "{} is not a pinned certificate",
                certificate.name()
            )))
        })
    }

    async fn verify_public_key(&self, key: &PublicKey) -> Result<Chain, PkiError> {
        self.pinned_key(key)
            .unwrap_or_else(|| Err(PkiError::UnknownKey(key.fingerprint())))
    }
}
