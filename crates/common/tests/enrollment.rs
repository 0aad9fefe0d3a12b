//! Device enrollment over the bootstrap protocol

mod common;

use std::sync::Arc;
use std::time::Duration;

use ::common::crypto::SecretKey;
use ::common::enrollment::{EnrollmentOutcome, PendingEnrollment};
use ::common::pki::{authority, CertificateType, NilVerifier, Verifier};
use ::common::rpc::commands::{self, AcceptEnrollment, Enroll, ListEnrollments};
use ::common::rpc::{Capabilities, Connection, Listener, RpcError, ENROLL_ALPN};
use ::common::testkit::{self, TestPki, VALIDITY};

fn enroll_listener(pki: &TestPki) -> Listener {
    Listener::bootstrap(
        ENROLL_ALPN,
        Capabilities::new(Arc::new(NilVerifier)).with_enrollments(pki.enrollments.clone()),
        commands::enroll_commands(),
    )
}

async fn waiting(operator: &Connection) -> Vec<PendingEnrollment> {
    for _ in 0..100 {
        let mut list = ListEnrollments::new();
        operator.call(&mut list).await.unwrap();
        if !list.enrollments().is_empty() {
            return list.enrollments().to_vec();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no enrollment showed up");
}

#[tokio::test]
async fn operator_accepts_a_waiting_device() {
    let pki = TestPki::new().unwrap();
    let device_key = SecretKey::generate();
    let device = testkit::connect_bootstrap(&enroll_listener(&pki));

    let mut request = Enroll::new("laptop-7", &device_key).unwrap();
    let pending = tokio::spawn(async move {
        device.call(&mut request).await?;
        Ok::<_, RpcError>(request.into_outcome())
    });

    let operator = common::connect_admin(&pki, &pki.server_listener())
        .await
        .unwrap();
    let listed = waiting(&operator).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "laptop-7");
    assert_eq!(listed[0].public_key, device_key.public());

    let certificate = authority::issue(
        &pki.admin,
        &listed[0].public_key,
        &listed[0].name,
        CertificateType::Agent,
        VALIDITY,
    )
    .unwrap();
    operator
        .call(&mut AcceptEnrollment::new(&certificate))
        .await
        .unwrap();

    match pending.await.unwrap().unwrap() {
        Some(EnrollmentOutcome::Accepted { certificate: issued, chain }) => {
            assert_eq!(issued.der(), certificate.der());
            assert_eq!(chain.root().unwrap().der(), pki.root_certificate().der());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Registered, so the server now vouches for it
    pki.trust.verify(&certificate).await.unwrap();
    assert!(pki.enrollments.is_empty());
}

#[tokio::test]
async fn certificates_for_other_keys_are_refused() {
    let pki = TestPki::new().unwrap();
    let device_key = SecretKey::generate();
    let device = testkit::connect_bootstrap(&enroll_listener(&pki));
    let mut request = Enroll::new("laptop-8", &device_key).unwrap();
    tokio::spawn(async move { device.call(&mut request).await });

    let operator = common::connect_admin(&pki, &pki.server_listener())
        .await
        .unwrap();
    waiting(&operator).await;

    // Not the waiting key
    let stray = authority::issue(
        &pki.admin,
        &SecretKey::generate().public(),
        "laptop-8",
        CertificateType::Agent,
        VALIDITY,
    )
    .unwrap();
    assert!(operator
        .call(&mut AcceptEnrollment::new(&stray))
        .await
        .is_err());

    // Right key, wrong role
    let user = authority::issue(
        &pki.root,
        &device_key.public(),
        "laptop-8",
        CertificateType::User,
        VALIDITY,
    )
    .unwrap();
    assert!(operator
        .call(&mut AcceptEnrollment::new(&user))
        .await
        .is_err());
    assert_eq!(pki.enrollments.len(), 1);
}

#[tokio::test]
async fn unanswered_enrollments_time_out() {
    let pki = TestPki::with_enrollment_lifetime(Duration::from_secs(1)).unwrap();
    let device = testkit::connect_bootstrap(&enroll_listener(&pki));

    let mut request = Enroll::new("kiosk", &SecretKey::generate()).unwrap();
    device.call(&mut request).await.unwrap();
    assert!(matches!(
        request.outcome(),
        Some(EnrollmentOutcome::TimedOut)
    ));

    let operator = common::connect_admin(&pki, &pki.server_listener())
        .await
        .unwrap();
    let mut list = ListEnrollments::new();
    operator.call(&mut list).await.unwrap();
    assert!(list.enrollments().is_empty());
}

#[tokio::test]
async fn enrollment_requests_cannot_be_replayed() {
    let pki = TestPki::with_enrollment_lifetime(Duration::from_secs(1)).unwrap();
    let listener = enroll_listener(&pki);
    let key = SecretKey::generate();
    let request = Enroll::new("kiosk", &key).unwrap();

    let first = testkit::connect_bootstrap(&listener);
    let mut original = request.clone();
    first.call(&mut original).await.unwrap();
    assert_eq!(pki.enrollments.nonces().len(), 1);

    // A sweep keeps nonces whose requests are still fresh
    pki.enrollments.sweep();
    assert_eq!(pki.enrollments.nonces().len(), 1);

    // Same signed bytes on a fresh connection to the same listener
    let second = testkit::connect_bootstrap(&listener);
    let mut replay = request.clone();
    match second.call(&mut replay).await {
        Err(RpcError::Remote { code, .. }) => assert_eq!(code, 409),
        other => panic!("replay was not rejected: {other:?}"),
    }
}

#[tokio::test]
async fn devices_cannot_list_enrollments() {
    let pki = TestPki::new().unwrap();
    let agent = common::connect_agent(&pki, &pki.server_listener(), false)
        .await
        .unwrap();
    assert!(agent.call(&mut ListEnrollments::new()).await.is_err());
}
