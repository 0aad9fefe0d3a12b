use async_trait::async_trait;
use parking_lot::RwLock;

use crate::clock;
use crate::crypto::PublicKey;
use crate::pki::chain::build_chain;
use crate::pki::{Certificate, Chain, PkiError, RevocationStore};
use crate::rpc::commands::VerifyKey;
use crate::rpc::{Connection, RpcError, Status};

use super::fallback::FallbackVerifier;
use super::Verifier;

/// Asks the upstream server for chains it cannot build itself
///
/// Used by agents and operators, which only pin the root and their
/// upstream. The pinned certificates are answered locally; anything else
/// goes out as a `verify_key` call on the attached connection. The chain
/// that comes back is rebuilt against the locally pinned root, so the
/// upstream can only vouch for what the root's signatures already allow,
/// and every member is checked against this node's own revocation ledger.
#[derive(Debug)]
pub struct UpstreamVerifier {
    fallback: FallbackVerifier,
    revocations: RevocationStore,
    connection: RwLock<Option<Connection>>,
}

impl UpstreamVerifier {
    /// The ledger also guards the pinned certificates `fallback` answers for
    pub fn new(fallback: FallbackVerifier, revocations: RevocationStore) -> Self {
        Self {
            fallback: fallback.with_revocations(revocations.clone()),
            revocations,
            connection: RwLock::new(None),
        }
    }

    pub fn revocations(&self) -> &RevocationStore {
        &self.revocations
    }

    /// Route lookups over `connection` from now on
    pub fn attach(&self, connection: Connection) {
        *self.connection.write() = Some(connection);
    }

    pub fn detach(&self) {
        *self.connection.write() = None;
    }

    pub fn fallback(&self) -> &FallbackVerifier {
        &self.fallback
    }

    fn upstream(&self) -> Result<Connection, PkiError> {
        self.connection
            .read()
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
            .ok_or_else(|| PkiError::VerifierUnreachable("no upstream connection".into()))
    }

    async fn ask(&self, key: &PublicKey) -> Result<Chain, PkiError> {
        let connection = self.upstream()?;
        let mut lookup = VerifyKey::new(key);
        connection
            .call(&mut lookup)
            .await
            .map_err(|e| remote_failure(key, e))?;

        let mut certificates = lookup.into_chain();
        if certificates.is_empty() {
            return Err(PkiError::UnknownKey(key.fingerprint()));
        }
        let leaf = certificates.remove(0);
        if leaf.public_key() != key {
            tracing::warn!(key = %key.fingerprint(), "upstream answered for a different key");
            return Err(PkiError::CertificateNotVerified(
                "upstream chain is for a different key".into(),
            ));
        }

        let chain = build_chain(&leaf, self.fallback.root(), &certificates, clock::now())?;
        for member in chain.certificates() {
            self.revocations.check(member.der())?;
        }
        Ok(chain)
    }
}

fn remote_failure(key: &PublicKey, error: RpcError) -> PkiError {
    match error {
        RpcError::Remote { code, msg } => match Status::from_code(code) {
            Some(Status::NotFound) => PkiError::UnknownKey(key.fingerprint()),
            Some(Status::Unavailable) | Some(Status::Internal) | None => {
                PkiError::VerifierUnreachable(msg)
            }
            Some(_) if (400..500).contains(&code) => PkiError::CertificateNotVerified(msg),
            Some(_) => PkiError::VerifierUnreachable(msg),
        },
        RpcError::Pki(e) => e,
        other => PkiError::VerifierUnreachable(other.to_string()),
    }
}

#[async_trait]
impl Verifier for UpstreamVerifier {
    async fn verify(&self, certificate: &Certificate) -> Result<Chain, PkiError> {
        if let Some(chain) = self.fallback.pinned(certificate) {
            return chain;
        }
        let chain = self.ask(certificate.public_key()).await?;
        match chain.leaf() {
            Some(leaf) if leaf.der() == certificate.der() => Ok(chain),
            _ => Err(PkiError::CertificateNotVerified(
                "certificate does not match the one upstream holds for its key".into(),
            )),
        }
    }

    async fn verify_public_key(&self, key: &PublicKey) -> Result<Chain, PkiError> {
        if let Some(chain) = self.fallback.pinned_key(key) {
            return chain;
        }
        self.ask(key).await
    }
}
