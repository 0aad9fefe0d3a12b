use std::fs;
use std::path::Path;

use crate::crypto::{EncryptedKey, PublicKey, SecretKey};

use super::certificate::{Certificate, CertificateError};
use super::error::PkiError;

pub const CERTIFICATE_FILE: &str = "credentials.pem";
pub const KEY_FILE: &str = "credentials.key.pem";

/// Where a set of credentials lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// In memory only, created for a single bootstrap exchange
    Temporary,
    /// Bound to an issued certificate and persisted encrypted
    Permanent,
}

/// A certificate bound to its private key
#[derive(Debug, Clone)]
pub struct Credentials {
    key: SecretKey,
    certificate: Option<Certificate>,
    lifecycle: Lifecycle,
}

impl Credentials {
    /// Pair an issued certificate with its key
    pub fn new(certificate: Certificate, key: SecretKey) -> Result<Self, PkiError> {
        if certificate.public_key() != &key.public() {
            return Err(CertificateError::KeyMismatch.into());
        }
        Ok(Self {
            key,
            certificate: Some(certificate),
            lifecycle: Lifecycle::Permanent,
        })
    }

    /// A fresh key with no certificate yet
    pub fn temporary() -> Self {
        Self {
            key: SecretKey::generate(),
            certificate: None,
            lifecycle: Lifecycle::Temporary,
        }
    }

    /// Attach the certificate issued for this key and make it permanent
    pub fn promote(&mut self, certificate: Certificate) -> Result<(), PkiError> {
        if certificate.public_key() != &self.key.public() {
            return Err(CertificateError::KeyMismatch.into());
        }
        self.certificate = Some(certificate);
        self.lifecycle = Lifecycle::Permanent;
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn certificate(&self) -> Result<&Certificate, PkiError> {
        self.certificate
            .as_ref()
            .ok_or_else(|| CertificateError::MissingCertificate.into())
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.key
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.key.sign(msg)
    }

    /// Write the certificate and the password-encrypted key into `dir`
    pub fn save(&self, dir: &Path, password: &str) -> Result<(), PkiError> {
        if self.lifecycle == Lifecycle::Temporary {
            return Err(PkiError::PermissionDenied(
                "temporary credentials are never persisted".into(),
            ));
        }
        let certificate = self.certificate()?;
        let sealed = self.key.encrypt(password)?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(CERTIFICATE_FILE), certificate.to_pem())?;
        fs::write(dir.join(KEY_FILE), sealed.to_pem()?)?;
        tracing::debug!(dir = %dir.display(), name = %certificate.name(), "saved credentials");
        Ok(())
    }

    /// Read credentials written by [`Credentials::save`]
    pub fn load(dir: &Path, password: &str) -> Result<Self, PkiError> {
        let certificate = Certificate::from_pem(&fs::read_to_string(dir.join(CERTIFICATE_FILE))?)?;
        let sealed = EncryptedKey::from_pem(&fs::read_to_string(dir.join(KEY_FILE))?)?;
        let key = sealed.decrypt(password)?;
        Self::new(certificate, key)
    }

    /// Whether credentials have been saved in `dir`
    pub fn exist_in(dir: &Path) -> bool {
        dir.join(CERTIFICATE_FILE).exists() && dir.join(KEY_FILE).exists()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::KeyError;
    use crate::pki::authority;
    use crate::pki::CertificateType;

    #[test]
    fn temporary_promotes_once_certificate_arrives() {
        let root = authority::create_root("acme", Duration::from_secs(600)).unwrap();
        let mut temp = Credentials::temporary();
        assert_eq!(temp.lifecycle(), Lifecycle::Temporary);
        assert!(temp.certificate().is_err());

        let wrong = authority::issue(
            &root,
            &SecretKey::generate().public(),
            "server",
            CertificateType::Server,
            Duration::from_secs(600),
        )
        .unwrap();
        assert!(temp.promote(wrong).is_err());
        assert_eq!(temp.lifecycle(), Lifecycle::Temporary);

        let right = authority::issue(
            &root,
            &temp.public_key(),
            "server",
            CertificateType::Server,
            Duration::from_secs(600),
        )
        .unwrap();
        temp.promote(right).unwrap();
        assert_eq!(temp.lifecycle(), Lifecycle::Permanent);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let root = authority::create_root("acme", Duration::from_secs(600)).unwrap();
        root.save(dir.path(), "pw").unwrap();
        assert!(Credentials::exist_in(dir.path()));

        let loaded = Credentials::load(dir.path(), "pw").unwrap();
        assert_eq!(loaded.certificate().unwrap(), root.certificate().unwrap());
        assert_eq!(loaded.public_key(), root.public_key());

        let wrong = Credentials::load(dir.path(), "not-pw");
        assert!(matches!(wrong, Err(PkiError::Key(KeyError::Decryption))));
    }

    #[test]
    fn temporary_credentials_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Credentials::temporary().save(dir.path(), "pw").is_err());
    }
}
