use serde::{Deserialize, Serialize};

use crate::crypto::{hash_password, verify_password, EncryptedKey, KeyError};
use crate::pki::{Certificate, Credentials, PkiError};
use crate::store::{Scope, Store, StoreError};

/// A user account that can sign in with a password
///
/// The server keeps the user's private key only in password-sealed form;
/// it can hand it out but never read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    pub certificate: Certificate,
    pub key: EncryptedKey,
}

impl LoginRecord {
    pub fn new(username: &str, password: &str, credentials: &Credentials) -> Result<Self, PkiError> {
        let password_hash = hash_password(password).map_err(KeyError::from)?;
        Ok(Self {
            username: username.to_string(),
            password_hash,
            certificate: credentials.certificate()?.clone(),
            key: credentials.secret_key().encrypt(password)?,
        })
    }

    pub fn check_password(&self, password: &str) -> bool {
        verify_password(password, &self.password_hash)
    }

    /// Unseal the key with `password` and pair it with the certificate
    pub fn credentials(&self, password: &str) -> Result<Credentials, PkiError> {
        Credentials::new(self.certificate.clone(), self.key.decrypt(password)?)
    }
}

/// Login records by username
#[derive(Debug, Clone)]
pub struct LoginDirectory {
    scope: Scope,
}

impl LoginDirectory {
    pub fn new(store: &Store) -> Self {
        Self {
            scope: store.scope("logins"),
        }
    }

    pub fn put(&self, record: &LoginRecord) -> Result<(), PkiError> {
        let bytes = bincode::serialize(record)?;
        self.scope.update(|tx| {
            tx.put(record.username.as_bytes(), bytes);
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, username: &str) -> Result<Option<LoginRecord>, PkiError> {
        let bytes = self.scope.view(|tx| Ok(tx.get(username.as_bytes())))?;
        bytes
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|_| StoreError::InvalidRecord(username.to_string()).into())
            })
            .transpose()
    }

    /// The record for `username` if `password` matches
    pub fn verify(&self, username: &str, password: &str) -> Result<Option<LoginRecord>, PkiError> {
        Ok(self
            .get(username)?
            .filter(|record| record.check_password(password)))
    }

    pub fn remove(&self, username: &str) -> Result<bool, PkiError> {
        Ok(self.scope.update(|tx| Ok(tx.delete(username.as_bytes())))?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::pki::{authority, CertificateType};

    #[test]
    fn password_unlocks_the_stored_key() {
        let root = authority::create_root("root", Duration::from_secs(3600)).unwrap();
        let key = SecretKey::generate();
        let cert = authority::issue(
            &root,
            &key.public(),
            "alice",
            CertificateType::User,
            Duration::from_secs(3600),
        )
        .unwrap();
        let alice = Credentials::new(cert, key).unwrap();

        let directory = LoginDirectory::new(&Store::memory());
        directory
            .put(&LoginRecord::new("alice", "hunter2", &alice).unwrap())
            .unwrap();

        assert!(directory.verify("alice", "wrong").unwrap().is_none());
        assert!(directory.verify("bob", "hunter2").unwrap().is_none());

        let record = directory.verify("alice", "hunter2").unwrap().unwrap();
        let restored = record.credentials("hunter2").unwrap();
        assert_eq!(restored.public_key(), alice.public_key());
        assert!(record.credentials("wrong").is_err());
    }
}
