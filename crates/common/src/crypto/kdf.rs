use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Size of a derived symmetric key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;
/// Size of a freshly generated salt in bytes
const SALT_SIZE: usize = 16;

// Upper bounds on parameters accepted from a remote peer.
const MAX_MEMORY_KIB: u32 = 256 * 1024;
const MAX_ITERATIONS: u32 = 16;
const MAX_PARALLELISM: u32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum KdfError {
    #[error("invalid kdf parameters: {0}")]
    Params(String),
    #[error("key derivation failed: {0}")]
    Derive(String),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Argon2id parameters, carried next to whatever they protect
///
/// Used both for sealing private keys under a password and for stretching
/// an ECDH shared secret into the key of an encrypted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: Vec<u8>,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt and the argon2 default costs
    pub fn generate() -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            salt,
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>, KdfError> {
        if self.memory_kib > MAX_MEMORY_KIB
            || self.iterations > MAX_ITERATIONS
            || self.parallelism > MAX_PARALLELISM
        {
            return Err(KdfError::Params(format!(
                "costs out of range (m={}, t={}, p={})",
                self.memory_kib, self.iterations, self.parallelism
            )));
        }
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| KdfError::Params(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Derive a symmetric key from `secret` (a password or a shared secret)
    pub fn derive(&self, secret: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>, KdfError> {
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        self.argon2()?
            .hash_password_into(secret, &self.salt, &mut out[..])
            .map_err(|e| KdfError::Derive(e.to_string()))?;
        Ok(out)
    }
}

/// Hash a login password into a PHC string for storage
pub fn hash_password(password: &str) -> Result<String, KdfError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| KdfError::Hash(e.to_string()))
}

/// Check a login password against a stored PHC string
pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
