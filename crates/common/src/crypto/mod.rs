//! Cryptographic primitives for the RMM trust core
//!
//! - **Identity & Signing**: ECDSA P-384 keypairs (`SecretKey`/`PublicKey`);
//!   public keys travel as SPKI DER and are addressed by their SHA-256
//!   fingerprint.
//! - **Keys at rest**: private keys are sealed with AES-256-GCM under an
//!   Argon2id key derived from the owner's password (`EncryptedKey`).
//! - **Key derivation**: the same Argon2id function turns an ECDH shared
//!   secret into the symmetric key of an end-to-end encrypted session.
//! - **Session cipher**: `CipherStream` wraps any async byte stream in
//!   AES-256-CFB, one IV per direction.

mod kdf;
mod keys;
mod stream;

pub use kdf::{hash_password, verify_password, KdfError, KdfParams, KEY_SIZE};
pub use keys::{EncryptedKey, KeyError, PublicKey, SecretKey};
pub use stream::{CipherError, CipherStream, IV_SIZE};
