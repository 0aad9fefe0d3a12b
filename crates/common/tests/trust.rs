//! Freshness, chain termination, revocation and envelope round trips

mod common;

use std::time::Duration;

use ::common::clock;
use ::common::crypto::SecretKey;
use ::common::host_config::HostConfig;
use ::common::pki::{
    CertificateType, HashAlgorithm, NonceStore, PkiError, RevocationRecord, SignedArtifact,
    SignedEnvelope, Verifier,
};
use ::common::testkit::TestPki;
use serde::{Deserialize, Serialize};

const WINDOW: Duration = Duration::from_secs(30);

#[test]
fn stale_artifacts_are_rejected() {
    let key = SecretKey::generate();
    let now = clock::now();
    let nonces = NonceStore::new();

    let old = SignedArtifact::sign_at(HostConfig::new("a"), &key, now - 31).unwrap();
    assert!(matches!(
        old.check_freshness(&nonces, WINDOW, now),
        Err(PkiError::Expired(_))
    ));
    // A rejected timestamp does not burn the nonce
    assert!(nonces.is_empty());

    let edge = SignedArtifact::sign_at(HostConfig::new("a"), &key, now - 30).unwrap();
    edge.check_freshness(&nonces, WINDOW, now).unwrap();
}

#[test]
fn replayed_artifacts_are_rejected() {
    let key = SecretKey::generate();
    let nonces = NonceStore::new();
    let artifact = SignedArtifact::sign(HostConfig::new("a"), &key).unwrap();
    let now = clock::now();

    artifact.check_freshness(&nonces, WINDOW, now).unwrap();
    let replayed = SignedArtifact::<HostConfig>::from_bytes(artifact.to_bytes()).unwrap();
    assert!(matches!(
        replayed.check_freshness(&nonces, WINDOW, now),
        Err(PkiError::ReplayDetected)
    ));
}

#[tokio::test]
async fn local_chains_end_at_the_root() {
    let pki = TestPki::new().unwrap();
    let root = pki.root_certificate();

    for credentials in [&pki.root, &pki.admin, &pki.server, &pki.agent] {
        let certificate = credentials.certificate().unwrap();
        let chain = pki.trust.verify(certificate).await.unwrap();
        assert_eq!(chain.leaf().unwrap().der(), certificate.der());
        assert_eq!(chain.root().unwrap().der(), root.der());

        let by_key = pki
            .trust
            .verify_public_key(&credentials.public_key())
            .await
            .unwrap();
        assert_eq!(by_key.root().unwrap().der(), root.der());
    }
}

#[tokio::test]
async fn foreign_roots_never_verify() {
    let pki = TestPki::new().unwrap();
    let other = TestPki::new().unwrap();

    // Registered by key, but issued under someone else's root
    pki.registry
        .put_device(other.agent.certificate().unwrap())
        .unwrap();
    assert!(pki
        .trust
        .verify(other.agent.certificate().unwrap())
        .await
        .is_err());
    assert!(pki.trust.verify(other.root_certificate()).await.is_err());
}

#[test]
fn revocation_beats_a_valid_signature() {
    let pki = TestPki::new().unwrap();
    let artifact = SignedArtifact::sign(HostConfig::new("agent"), pki.admin.secret_key()).unwrap();
    artifact.check_revocation(&pki.revocations).unwrap();

    let envelope: SignedEnvelope = bincode::deserialize(artifact.to_bytes()).unwrap();
    pki.revocations
        .revoke(&RevocationRecord::of(&envelope.data, HashAlgorithm::Sha384))
        .unwrap();

    assert!(matches!(
        artifact.check_revocation(&pki.revocations),
        Err(PkiError::Revoked)
    ));
    // Still a perfectly good signature
    let decoded = SignedArtifact::<HostConfig>::from_bytes(artifact.to_bytes()).unwrap();
    assert!(matches!(
        decoded.check_revocation(&pki.revocations),
        Err(PkiError::Revoked)
    ));
    let opened: Result<serde_json::Value, _> = SignedEnvelope::verify(
        artifact.to_bytes(),
        &pki.admin.public_key(),
        Some(&pki.revocations),
    );
    assert!(matches!(opened, Err(PkiError::Revoked)));
}

#[tokio::test]
async fn revoked_certificates_fail_verification() {
    let pki = TestPki::new().unwrap();
    let agent = pki.agent.certificate().unwrap();
    pki.trust.verify(agent).await.unwrap();

    pki.revocations
        .revoke(&RevocationRecord::of(agent.der(), HashAlgorithm::Sha256))
        .unwrap();
    assert!(matches!(
        pki.trust.verify(agent).await,
        Err(PkiError::Revoked)
    ));
    assert!(matches!(
        pki.trust.verify_public_key(&pki.agent.public_key()).await,
        Err(PkiError::Revoked)
    ));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Inventory {
    host: String,
    disks: Vec<(String, u64)>,
    tags: Option<Vec<String>>,
}

#[test]
fn envelopes_round_trip() {
    let pki = TestPki::new().unwrap();
    let payload = Inventory {
        host: "db-1".into(),
        disks: vec![("sda".into(), 512), ("sdb".into(), 2048)],
        tags: Some(vec!["prod".into()]),
    };
    let bytes = SignedEnvelope::sign(&payload, pki.server.secret_key()).unwrap();
    let opened: Inventory =
        SignedEnvelope::verify(&bytes, &pki.server.public_key(), None).unwrap();
    assert_eq!(opened, payload);

    let wrong: Result<Inventory, _> = SignedEnvelope::verify(&bytes, &pki.agent.public_key(), None);
    assert!(matches!(wrong, Err(PkiError::SignatureInvalid)));
}

#[test]
fn leaf_certificates_cannot_issue() {
    let pki = TestPki::new().unwrap();
    let result = ::common::pki::authority::issue(
        &pki.agent,
        &SecretKey::generate().public(),
        "rogue",
        CertificateType::Agent,
        Duration::from_secs(60),
    );
    assert!(result.is_err());
}
