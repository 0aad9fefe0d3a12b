use serde::{Deserialize, Serialize};

use super::certificate::Certificate;
use super::error::PkiError;

/// Longest chain we are willing to walk (leaf, intermediates, root)
const MAX_DEPTH: usize = 8;

/// Certificates from a leaf up to the trusted root, each signed by the next
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chain(Vec<Certificate>);

impl Chain {
    pub fn new(certificates: Vec<Certificate>) -> Self {
        Self(certificates)
    }

    pub fn leaf(&self) -> Option<&Certificate> {
        self.0.first()
    }

    pub fn root(&self) -> Option<&Certificate> {
        self.0.last()
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Certificate> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn check_validity(cert: &Certificate, now: i64) -> Result<(), PkiError> {
    if cert.is_valid_at(now) {
        Ok(())
    } else {
        Err(PkiError::Expired(format!(
            "certificate {} is outside its validity window",
            cert.name()
        )))
    }
}

/// Walk from `leaf` to `root` through `intermediates`
///
/// The chain is only built if it ends at exactly `root` (compared by DER)
/// and every member is inside its validity window at `now`.
pub fn build_chain(
    leaf: &Certificate,
    root: &Certificate,
    intermediates: &[Certificate],
    now: i64,
) -> Result<Chain, PkiError> {
    check_validity(root, now)?;
    check_validity(leaf, now)?;

    let mut chain = vec![leaf.clone()];
    let mut current = leaf.clone();
    for _ in 0..MAX_DEPTH {
        if current.der() == root.der() {
            return Ok(Chain(chain));
        }
        if current.verify_issued_by(root).is_ok() {
            chain.push(root.clone());
            return Ok(Chain(chain));
        }

        let issuer = intermediates
            .iter()
            .filter(|c| c.is_ca() && c.der() != current.der() && c.is_valid_at(now))
            .filter(|c| !chain.contains(c))
            .find(|c| current.verify_issued_by(c).is_ok())
            .ok_or_else(|| {
                PkiError::ChainBuildFailed(format!("no trusted issuer for {}", current.name()))
            })?
            .clone();
        chain.push(issuer.clone());
        current = issuer;
    }
    Err(PkiError::ChainBuildFailed("chain too deep".into()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::pki::{authority, CertificateType, Credentials};

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn builds_through_intermediate() {
        let root = authority::create_root("acme", HOUR).unwrap();
        let user_key = SecretKey::generate();
        let user_cert =
            authority::issue(&root, &user_key.public(), "admin", CertificateType::User, HOUR)
                .unwrap();
        let user = Credentials::new(user_cert.clone(), user_key).unwrap();
        let agent = authority::issue(
            &user,
            &SecretKey::generate().public(),
            "host",
            CertificateType::Agent,
            HOUR,
        )
        .unwrap();

        let root_cert = root.certificate().unwrap();
        let now = crate::clock::now();
        let chain = build_chain(&agent, root_cert, &[user_cert.clone()], now).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.root().unwrap().der(), root_cert.der());

        // Without the intermediate there is no path to the root
        assert!(matches!(
            build_chain(&agent, root_cert, &[], now),
            Err(PkiError::ChainBuildFailed(_))
        ));
    }

    #[test]
    fn rejects_expired_leaf() {
        let root = authority::create_root("acme", HOUR).unwrap();
        let agent = authority::issue(
            &root,
            &SecretKey::generate().public(),
            "host",
            CertificateType::Agent,
            HOUR,
        )
        .unwrap();
        let later = crate::clock::now() + 2 * 3600;
        assert!(matches!(
            build_chain(&agent, root.certificate().unwrap(), &[], later),
            Err(PkiError::Expired(_))
        ));
    }
}
