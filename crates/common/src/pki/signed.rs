use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::clock;
use crate::crypto::{PublicKey, SecretKey};

use super::error::PkiError;
use super::nonce::NonceStore;
use super::revocation::RevocationStore;

pub const NONCE_SIZE: usize = 32;

/// `{data, signature}` over arbitrary serialized bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Serialize `payload`, sign it and pack the envelope
    pub fn sign<T: Serialize>(payload: &T, key: &SecretKey) -> Result<Vec<u8>, PkiError> {
        let data = bincode::serialize(payload)?;
        let signature = key.sign(&data);
        Ok(bincode::serialize(&SignedEnvelope { data, signature })?)
    }

    /// Unpack an envelope and check its signature against `public_key`
    ///
    /// With `revocations` set, the signed bytes are also looked up in the
    /// ledger; a failed lookup rejects the envelope.
    pub fn verify<T: DeserializeOwned>(
        bytes: &[u8],
        public_key: &PublicKey,
        revocations: Option<&RevocationStore>,
    ) -> Result<T, PkiError> {
        let envelope: SignedEnvelope = bincode::deserialize(bytes)?;
        envelope.open(public_key, revocations)
    }

    fn open<T: DeserializeOwned>(
        &self,
        public_key: &PublicKey,
        revocations: Option<&RevocationStore>,
    ) -> Result<T, PkiError> {
        public_key
            .verify(&self.data, &self.signature)
            .map_err(|_| PkiError::SignatureInvalid)?;
        if let Some(revocations) = revocations {
            revocations.check(&self.data)?;
        }
        Ok(bincode::deserialize(&self.data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactPayload<T> {
    timestamp: i64,
    nonce: [u8; NONCE_SIZE],
    creator: PublicKey,
    body: T,
}

/// A signed envelope whose payload carries freshness and its author
///
/// Decoding checks the signature against the embedded creator key, so a
/// `SignedArtifact` value is always self-consistent. Whether the creator
/// is trusted is a separate question for a `Verifier`; whether the
/// artifact is fresh is checked with [`SignedArtifact::check_freshness`].
#[derive(Debug, Clone)]
pub struct SignedArtifact<T> {
    bytes: Vec<u8>,
    timestamp: i64,
    nonce: [u8; NONCE_SIZE],
    creator: PublicKey,
    body: T,
}

impl<T: Serialize + DeserializeOwned> SignedArtifact<T> {
    pub fn sign(body: T, key: &SecretKey) -> Result<Self, PkiError> {
        Self::sign_at(body, key, clock::now())
    }

    /// Sign with an explicit timestamp
    pub fn sign_at(body: T, key: &SecretKey, timestamp: i64) -> Result<Self, PkiError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let payload = ArtifactPayload {
            timestamp,
            nonce,
            creator: key.public(),
            body,
        };
        let bytes = SignedEnvelope::sign(&payload, key)?;
        Ok(Self {
            bytes,
            timestamp: payload.timestamp,
            nonce: payload.nonce,
            creator: payload.creator,
            body: payload.body,
        })
    }

    /// Decode and check the creator's signature
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PkiError> {
        let envelope: SignedEnvelope = bincode::deserialize(bytes)?;
        let payload: ArtifactPayload<T> = bincode::deserialize(&envelope.data)?;
        let checked: ArtifactPayload<T> = envelope.open(&payload.creator, None)?;
        Ok(Self {
            bytes: bytes.to_vec(),
            timestamp: checked.timestamp,
            nonce: checked.nonce,
            creator: checked.creator,
            body: checked.body,
        })
    }
}

impl<T> SignedArtifact<T> {
    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    pub fn creator(&self) -> &PublicKey {
        &self.creator
    }

    pub fn body(&self) -> &T {
        &self.body
    }

    pub fn into_body(self) -> T {
        self.body
    }

    /// Reject if the signed payload bytes are on the revocation ledger
    pub fn check_revocation(&self, revocations: &RevocationStore) -> Result<(), PkiError> {
        let envelope: SignedEnvelope = bincode::deserialize(&self.bytes)?;
        revocations.check(&envelope.data)
    }

    /// Timestamp within `window` of `now`, then nonce unseen
    ///
    /// The nonce is only recorded once the timestamp check passes, and
    /// both checks run before the caller acts on the body.
    pub fn check_freshness(
        &self,
        nonces: &NonceStore,
        window: Duration,
        now: i64,
    ) -> Result<(), PkiError> {
        if !clock::within_window(self.timestamp, now, window) {
            return Err(PkiError::Expired(format!(
                "signed at {}, now {}",
                self.timestamp, now
            )));
        }
        if !nonces.check_and_add(&self.nonce, self.timestamp) {
            return Err(PkiError::ReplayDetected);
        }
        Ok(())
    }
}

impl<T> Serialize for SignedArtifact<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.bytes)
    }
}

impl<'de, T: Serialize + DeserializeOwned> Deserialize<'de> for SignedArtifact<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::revocation::{HashAlgorithm, RevocationRecord};
    use crate::store::Store;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        target: String,
        values: Vec<u32>,
    }

    fn payload() -> Payload {
        Payload {
            target: "host-1".into(),
            values: vec![1, 2, 3],
        }
    }

    #[test]
    fn envelope_round_trip() {
        let key = SecretKey::generate();
        let bytes = SignedEnvelope::sign(&payload(), &key).unwrap();
        let opened: Payload = SignedEnvelope::verify(&bytes, &key.public(), None).unwrap();
        assert_eq!(opened, payload());

        let other = SecretKey::generate().public();
        assert!(matches!(
            SignedEnvelope::verify::<Payload>(&bytes, &other, None),
            Err(PkiError::SignatureInvalid)
        ));
    }

    #[test]
    fn revoked_envelope_fails_despite_valid_signature() {
        let key = SecretKey::generate();
        let revocations = RevocationStore::new(Store::memory().scope("revocations"));
        let bytes = SignedEnvelope::sign(&payload(), &key).unwrap();
        let envelope: SignedEnvelope = bincode::deserialize(&bytes).unwrap();

        revocations
            .revoke(&RevocationRecord::of(&envelope.data, HashAlgorithm::Sha256))
            .unwrap();
        assert!(matches!(
            SignedEnvelope::verify::<Payload>(&bytes, &key.public(), Some(&revocations)),
            Err(PkiError::Revoked)
        ));
    }

    #[test]
    fn artifact_freshness_and_replay() {
        let key = SecretKey::generate();
        let nonces = NonceStore::new();
        let window = Duration::from_secs(30);
        let now = clock::now();

        let artifact = SignedArtifact::sign_at(payload(), &key, now).unwrap();
        let decoded = SignedArtifact::<Payload>::from_bytes(artifact.to_bytes()).unwrap();
        assert_eq!(decoded.creator(), &key.public());
        assert_eq!(decoded.body(), &payload());

        decoded.check_freshness(&nonces, window, now + 30).unwrap();
        assert!(matches!(
            decoded.check_freshness(&nonces, window, now + 30),
            Err(PkiError::ReplayDetected)
        ));

        let stale = SignedArtifact::sign_at(payload(), &key, now - 31).unwrap();
        assert!(matches!(
            stale.check_freshness(&nonces, window, now),
            Err(PkiError::Expired(_))
        ));
        // The stale nonce was not consumed by the failed check
        assert!(nonces.check_nonce(stale.nonce()));
    }

    #[test]
    fn future_dated_artifact_stays_spent_after_cleanup() {
        let key = SecretKey::generate();
        let nonces = NonceStore::new();
        let window = Duration::from_secs(30);
        let now = clock::now();

        let ahead = SignedArtifact::sign_at(payload(), &key, now + 30).unwrap();
        ahead.check_freshness(&nonces, window, now).unwrap();
        nonces.cleanup(now + 31, window);
        assert!(matches!(
            ahead.check_freshness(&nonces, window, now + 31),
            Err(PkiError::ReplayDetected)
        ));

        nonces.cleanup(now + 61, window);
        assert!(matches!(
            ahead.check_freshness(&nonces, window, now + 61),
            Err(PkiError::Expired(_))
        ));
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let key = SecretKey::generate();
        let artifact = SignedArtifact::sign(payload(), &key).unwrap();
        let mut envelope: SignedEnvelope = bincode::deserialize(artifact.to_bytes()).unwrap();
        let last = envelope.data.len() - 1;
        envelope.data[last] ^= 0xff;
        let tampered = bincode::serialize(&envelope).unwrap();
        assert!(SignedArtifact::<Payload>::from_bytes(&tampered).is_err());
    }
}
