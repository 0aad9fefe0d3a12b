use crate::crypto::PublicKey;
use crate::store::{Scope, Store, StoreError};

use super::certificate::{Certificate, CertificateType};
use super::error::PkiError;

/// Known user (intermediate) and device certificates, by key fingerprint
#[derive(Debug, Clone)]
pub struct CertificateRegistry {
    users: Scope,
    devices: Scope,
}

fn decode(key: &[u8], value: &[u8]) -> Result<Certificate, StoreError> {
    let pem = std::str::from_utf8(value)
        .map_err(|_| StoreError::InvalidRecord(String::from_utf8_lossy(key).into_owned()))?;
    Certificate::from_pem(pem)
        .map_err(|_| StoreError::InvalidRecord(String::from_utf8_lossy(key).into_owned()))
}

fn put(scope: &Scope, certificate: &Certificate) -> Result<(), PkiError> {
    let key = certificate.fingerprint();
    let pem = certificate.to_pem();
    scope.update(|tx| {
        tx.put(key.as_bytes(), pem.into_bytes());
        Ok(())
    })?;
    Ok(())
}

fn all(scope: &Scope) -> Result<Vec<Certificate>, PkiError> {
    Ok(scope.view(|tx| {
        tx.scan_prefix(b"")
            .into_iter()
            .map(|(k, v)| decode(&k, &v))
            .collect()
    })?)
}

impl CertificateRegistry {
    pub fn new(store: &Store) -> Self {
        let pki = store.scope("pki");
        Self {
            users: pki.scope("users"),
            devices: pki.scope("devices"),
        }
    }

    pub fn put_user(&self, certificate: &Certificate) -> Result<(), PkiError> {
        if certificate.kind() != CertificateType::User {
            return Err(PkiError::PermissionDenied(format!(
                "{} certificate registered as a user",
                certificate.kind()
            )));
        }
        put(&self.users, certificate)
    }

    pub fn put_device(&self, certificate: &Certificate) -> Result<(), PkiError> {
        if !matches!(
            certificate.kind(),
            CertificateType::Server | CertificateType::Agent
        ) {
            return Err(PkiError::PermissionDenied(format!(
                "{} certificate registered as a device",
                certificate.kind()
            )));
        }
        put(&self.devices, certificate)
    }

    /// Registered certificate for `key`, users first
    pub fn get_by_key(&self, key: &PublicKey) -> Result<Option<Certificate>, PkiError> {
        let fingerprint = key.fingerprint();
        for scope in [&self.users, &self.devices] {
            let found = scope.view(|tx| {
                tx.get(fingerprint.as_bytes())
                    .map(|v| decode(fingerprint.as_bytes(), &v))
                    .transpose()
            })?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// The intermediate pool
    pub fn users(&self) -> Result<Vec<Certificate>, PkiError> {
        all(&self.users)
    }

    pub fn devices(&self) -> Result<Vec<Certificate>, PkiError> {
        all(&self.devices)
    }

    pub fn remove(&self, key: &PublicKey) -> Result<bool, PkiError> {
        let fingerprint = key.fingerprint();
        let mut removed = false;
        for scope in [&self.users, &self.devices] {
            removed |= scope.update(|tx| Ok(tx.delete(fingerprint.as_bytes())))?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::pki::authority;

    #[test]
    fn registers_by_role() {
        let registry = CertificateRegistry::new(&Store::memory());
        let root = authority::create_root("acme", Duration::from_secs(600)).unwrap();
        let user_key = SecretKey::generate();
        let user = authority::issue(
            &root,
            &user_key.public(),
            "admin",
            CertificateType::User,
            Duration::from_secs(600),
        )
        .unwrap();

        assert!(registry.put_device(&user).is_err());
        registry.put_user(&user).unwrap();

        assert_eq!(registry.get_by_key(&user_key.public()).unwrap(), Some(user));
        assert_eq!(registry.users().unwrap().len(), 1);
        assert!(registry.devices().unwrap().is_empty());

        assert!(registry.remove(&user_key.public()).unwrap());
        assert_eq!(registry.get_by_key(&user_key.public()).unwrap(), None);
    }
}
