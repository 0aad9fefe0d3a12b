use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::kdf::{KdfError, KdfParams};

/// PEM tag for a public key (SPKI DER body)
pub const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";
/// PEM tag for a password-sealed private key
pub const ENCRYPTED_KEY_TAG: &str = "RMM ENCRYPTED PRIVATE KEY";
/// Nonce length for AES-256-GCM
const NONCE_SIZE: usize = 12;

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key encoding error: {0}")]
    Encoding(String),
    #[error("failed to parse PEM: {0}")]
    Pem(#[from] pem::PemError),
    #[error("invalid PEM tag, expected {expected}, got {found}")]
    PemTag {
        expected: &'static str,
        found: String,
    },
    #[error("key derivation error: {0}")]
    Kdf(#[from] KdfError),
    #[error("failed to encrypt private key")]
    Encryption,
    #[error("failed to decrypt private key (wrong password?)")]
    Decryption,
    #[error("invalid signature")]
    Signature,
}

/// Public key for node identity and signature verification
///
/// A thin wrapper around a P-384 `VerifyingKey` that remembers its
/// SubjectPublicKeyInfo DER encoding. Equality, hashing and serialization
/// all go through that encoding, which is also what certificates embed.
#[derive(Clone)]
pub struct PublicKey {
    key: VerifyingKey,
    der: Vec<u8>,
}

impl Deref for PublicKey {
    type Target = VerifyingKey;
    fn deref(&self) -> &Self::Target {
        &self.key
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.der.hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint()).finish()
    }
}

impl TryFrom<VerifyingKey> for PublicKey {
    type Error = KeyError;
    fn try_from(key: VerifyingKey) -> Result<Self, Self::Error> {
        let der = key
            .to_public_key_der()
            .map_err(|e| KeyError::Encoding(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self { key, der })
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Self::from_der(bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.der)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::de::Deserialize::deserialize(deserializer)?;
        Self::from_der(&bytes).map_err(serde::de::Error::custom)
    }
}

impl PublicKey {
    /// Parse a public key from SubjectPublicKeyInfo DER
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        let key =
            VerifyingKey::from_public_key_der(der).map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(Self {
            key,
            der: der.to_vec(),
        })
    }

    /// SubjectPublicKeyInfo DER encoding
    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    /// Encode in PEM format with tag "PUBLIC KEY"
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PUBLIC_KEY_TAG, self.der.clone()))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str)?;
        if pem.tag() != PUBLIC_KEY_TAG {
            return Err(KeyError::PemTag {
                expected: PUBLIC_KEY_TAG,
                found: pem.tag().to_string(),
            });
        }
        Self::from_der(pem.contents())
    }

    /// Lowercase hex SHA-256 of the DER encoding
    ///
    /// This is the key under which certificates, enrollments and
    /// connections are indexed.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// Verify a DER-encoded ECDSA signature over `msg`
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let signature = Signature::from_der(signature).map_err(|_| KeyError::Signature)?;
        self.key
            .verify(msg, &signature)
            .map_err(|_| KeyError::Signature)
    }
}

/// Secret key for signing and certificate issuance
///
/// Never leaves the node in plaintext: on disk and on the wire it only
/// appears as an `EncryptedKey`.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&"<redacted>").finish()
    }
}

impl SecretKey {
    /// Generate a new random secret key using the OS CSPRNG
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    /// Derive the public key from this secret key
    pub fn public(&self) -> PublicKey {
        let key = VerifyingKey::from(&self.0);
        let der = key
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .unwrap_or_default();
        PublicKey { key, der }
    }

    /// Sign a message, returning a DER-encoded ECDSA/SHA-384 signature
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let signature: Signature = self.0.sign(msg);
        signature.to_der().as_bytes().to_vec()
    }

    /// PKCS#8 PEM, as consumed by certificate builders
    pub fn to_pkcs8_pem(&self) -> Result<Zeroizing<String>, KeyError> {
        self.0
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }

    fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        self.0
            .to_pkcs8_der()
            .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }

    fn from_pkcs8_der(der: &[u8]) -> Result<Self, KeyError> {
        SigningKey::from_pkcs8_der(der)
            .map(Self)
            .map_err(|e| KeyError::Encoding(e.to_string()))
    }

    /// Seal this key under a password
    pub fn encrypt(&self, password: &str) -> Result<EncryptedKey, KeyError> {
        let params = KdfParams::generate();
        let key = params.derive(password.as_bytes())?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| KeyError::Encryption)?;

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let plaintext = self.to_pkcs8_der()?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| KeyError::Encryption)?;

        Ok(EncryptedKey {
            params,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }
}

/// A private key sealed with AES-256-GCM under an Argon2id-derived key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub params: KdfParams,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl EncryptedKey {
    /// Recover the secret key; fails with `Decryption` on a wrong password
    pub fn decrypt(&self, password: &str) -> Result<SecretKey, KeyError> {
        if self.nonce.len() != NONCE_SIZE {
            return Err(KeyError::Decryption);
        }
        let key = self.params.derive(password.as_bytes())?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| KeyError::Decryption)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
                .map_err(|_| KeyError::Decryption)?,
        );
        SecretKey::from_pkcs8_der(&plaintext)
    }

    /// Encode as PEM with tag "RMM ENCRYPTED PRIVATE KEY"
    pub fn to_pem(&self) -> Result<String, KeyError> {
        let body = bincode::serialize(self).map_err(|e| KeyError::Encoding(e.to_string()))?;
        Ok(pem::encode(&pem::Pem::new(ENCRYPTED_KEY_TAG, body)))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str)?;
        if pem.tag() != ENCRYPTED_KEY_TAG {
            return Err(KeyError::PemTag {
                expected: ENCRYPTED_KEY_TAG,
                found: pem.tag().to_string(),
            });
        }
        bincode::deserialize(pem.contents()).map_err(|e| KeyError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_public_key_der_round_trip() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();

        let recovered = PublicKey::from_der(public_key.to_der()).unwrap();
        assert_eq!(public_key, recovered);
        assert_eq!(public_key.fingerprint(), recovered.fingerprint());

        let pem = public_key.to_pem();
        assert_eq!(PublicKey::from_pem(&pem).unwrap(), public_key);
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate();
        let public_key = secret_key.public();
        let message = b"hello, world!";

        let signature = secret_key.sign(message);
        assert!(public_key.verify(message, &signature).is_ok());

        // Verify fails with wrong message
        assert!(public_key.verify(b"hello, world?", &signature).is_err());

        // Verify fails with wrong key
        let other_key = SecretKey::generate().public();
        assert!(other_key.verify(message, &signature).is_err());

        // Garbage signatures are rejected rather than panicking
        assert!(public_key.verify(message, &[0u8; 12]).is_err());
    }

    #[test]
    fn test_encrypted_key_round_trip() {
        let secret_key = SecretKey::generate();
        let sealed = secret_key.encrypt("correct horse").unwrap();

        let pem = sealed.to_pem().unwrap();
        let parsed = EncryptedKey::from_pem(&pem).unwrap();
        assert_eq!(parsed, sealed);

        let recovered = parsed.decrypt("correct horse").unwrap();
        assert_eq!(recovered.public(), secret_key.public());

        assert!(matches!(
            parsed.decrypt("battery staple"),
            Err(KeyError::Decryption)
        ));
    }

    #[test]
    fn test_pem_tag_is_checked() {
        let public_pem = SecretKey::generate().public().to_pem();
        assert!(matches!(
            EncryptedKey::from_pem(&public_pem),
            Err(KeyError::PemTag { .. })
        ));
    }
}
