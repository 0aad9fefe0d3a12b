//! Agents asking the server about keys they cannot place themselves

mod common;

use std::sync::Arc;

use ::common::crypto::SecretKey;
use ::common::pki::{
    CertificateType, HashAlgorithm, PkiError, RevocationRecord, RevocationStore, UpstreamVerifier,
    Verifier,
};
use ::common::rpc::commands::Revoke;
use ::common::store::Store;
use ::common::testkit::TestPki;

/// An agent's verifier over its own, initially empty, revocation ledger
fn agent_verifier(pki: &TestPki) -> Arc<UpstreamVerifier> {
    let ledger = RevocationStore::new(Store::memory().scope("revocations"));
    Arc::new(UpstreamVerifier::new(pki.client_verifier(), ledger))
}

#[tokio::test]
async fn upstream_vouches_for_registered_keys() {
    let pki = TestPki::new().unwrap();
    let verifier = agent_verifier(&pki);
    let link = common::connect_agent(&pki, &pki.server_listener(), false)
        .await
        .unwrap();
    verifier.attach(link);

    let chain = verifier
        .verify_public_key(&pki.admin.public_key())
        .await
        .unwrap();
    assert_eq!(chain.certificates().len(), 2);
    assert_eq!(chain.leaf().unwrap().der(), pki.admin.certificate().unwrap().der());
    assert_eq!(chain.root().unwrap().der(), pki.root_certificate().der());

    verifier
        .verify(pki.admin.certificate().unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn pinned_certificates_need_no_upstream() {
    let pki = TestPki::new().unwrap();
    let verifier = agent_verifier(&pki);
    verifier.verify(pki.server_certificate()).await.unwrap();
    verifier.verify(pki.root_certificate()).await.unwrap();
}

#[tokio::test]
async fn unknown_keys_are_not_an_outage() {
    let pki = TestPki::new().unwrap();
    let verifier = agent_verifier(&pki);
    verifier.attach(
        common::connect_agent(&pki, &pki.server_listener(), false)
            .await
            .unwrap(),
    );

    let stray = SecretKey::generate().public();
    let err = verifier.verify_public_key(&stray).await.unwrap_err();
    assert!(!matches!(err, PkiError::VerifierUnreachable(_)), "{err}");

    // Issued properly, but never registered with the server
    let rogue = pki.issue("rogue", CertificateType::Agent).unwrap();
    assert!(verifier.verify(rogue.certificate().unwrap()).await.is_err());
}

#[tokio::test]
async fn detached_verifiers_report_unreachable() {
    let pki = TestPki::new().unwrap();
    let verifier = agent_verifier(&pki);
    let link = common::connect_agent(&pki, &pki.server_listener(), false)
        .await
        .unwrap();
    verifier.attach(link.clone());
    verifier
        .verify_public_key(&pki.admin.public_key())
        .await
        .unwrap();

    link.close();
    assert!(matches!(
        verifier.verify_public_key(&pki.admin.public_key()).await,
        Err(PkiError::VerifierUnreachable(_))
    ));

    verifier.detach();
    assert!(matches!(
        verifier.verify_public_key(&pki.admin.public_key()).await,
        Err(PkiError::VerifierUnreachable(_))
    ));
}

#[tokio::test]
async fn revoked_keys_stop_verifying_everywhere() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let kiosk = pki.issue("kiosk", CertificateType::Agent).unwrap();
    pki.registry.put_device(kiosk.certificate().unwrap()).unwrap();

    let verifier = agent_verifier(&pki);
    verifier.attach(common::connect_agent(&pki, &listener, false).await.unwrap());
    verifier.verify(kiosk.certificate().unwrap()).await.unwrap();

    let admin = common::connect_admin(&pki, &listener).await.unwrap();
    admin
        .call(&mut Revoke::of(
            kiosk.certificate().unwrap().der(),
            HashAlgorithm::Sha256,
        ))
        .await
        .unwrap();

    let err = verifier
        .verify(kiosk.certificate().unwrap())
        .await
        .unwrap_err();
    assert!(!matches!(err, PkiError::VerifierUnreachable(_)), "{err}");
    assert!(matches!(
        pki.trust.verify(kiosk.certificate().unwrap()).await,
        Err(PkiError::Revoked)
    ));
}

#[tokio::test]
async fn local_revocations_overrule_the_upstream() {
    let pki = TestPki::new().unwrap();
    let kiosk = pki.issue("kiosk", CertificateType::Agent).unwrap();
    pki.registry.put_device(kiosk.certificate().unwrap()).unwrap();

    let verifier = agent_verifier(&pki);
    verifier.attach(
        common::connect_agent(&pki, &pki.server_listener(), false)
            .await
            .unwrap(),
    );
    verifier.verify(kiosk.certificate().unwrap()).await.unwrap();

    // The server still vouches for the administrator that issued the kiosk
    verifier
        .revocations()
        .revoke(&RevocationRecord::of(
            pki.admin.certificate().unwrap().der(),
            HashAlgorithm::Sha256,
        ))
        .unwrap();
    pki.trust.verify(kiosk.certificate().unwrap()).await.unwrap();
    assert!(matches!(
        verifier.verify(kiosk.certificate().unwrap()).await,
        Err(PkiError::Revoked)
    ));
    assert!(matches!(
        verifier.verify_public_key(&pki.admin.public_key()).await,
        Err(PkiError::Revoked)
    ));

    // Pinned certificates answer to the same ledger
    verifier
        .revocations()
        .revoke(&RevocationRecord::of(
            pki.server_certificate().der(),
            HashAlgorithm::Sha384,
        ))
        .unwrap();
    assert!(matches!(
        verifier.verify(pki.server_certificate()).await,
        Err(PkiError::Revoked)
    ));
}

#[tokio::test]
async fn agents_cannot_revoke() {
    let pki = TestPki::new().unwrap();
    let agent = common::connect_agent(&pki, &pki.server_listener(), false)
        .await
        .unwrap();
    let result = agent
        .call(&mut Revoke::of(
            pki.admin.certificate().unwrap().der(),
            HashAlgorithm::Sha384,
        ))
        .await;
    assert!(result.is_err());
    assert_eq!(pki.revocations.len().unwrap(), 0);
}
