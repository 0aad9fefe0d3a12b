//! First-time server setup and password login on the bootstrap protocols

mod common;

use std::sync::Arc;

use ::common::login::{LoginDirectory, LoginRecord};
use ::common::pki::{CertificateType, Credentials, NilVerifier};
use ::common::rpc::commands::{self, Login, Setup, SetupState};
use ::common::rpc::{Capabilities, Listener, RpcError, LOGIN_ALPN, SETUP_ALPN};
use ::common::testkit::{self, TestPki};

fn remote_code<T: std::fmt::Debug>(result: Result<T, RpcError>) -> u16 {
    match result {
        Err(RpcError::Remote { code, .. }) => code,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn setup_hands_the_server_its_certificate_once() {
    let pki = TestPki::new().unwrap();
    let (state, completed) = SetupState::new(Credentials::temporary());
    let server_key = state.public_key().unwrap();
    let listener = Listener::bootstrap(
        SETUP_ALPN,
        Capabilities::new(Arc::new(NilVerifier)).with_setup(state),
        commands::setup_commands(),
    );

    let login = LoginRecord::new("admin", "hunter2", &pki.admin).unwrap();
    let mut setup = Setup::new(pki.root_certificate(), &pki.admin, "server-2", Some(login)).unwrap();
    let client = testkit::connect_bootstrap(&listener);
    client.call(&mut setup).await.unwrap();

    let issued = setup.certificate().unwrap().clone();
    assert_eq!(issued.kind(), CertificateType::Server);
    assert_eq!(issued.name(), "server-2");
    assert_eq!(issued.public_key(), &server_key);

    let outcome = completed.recv_async().await.unwrap();
    assert_eq!(outcome.credentials.certificate().unwrap().der(), issued.der());
    assert_eq!(outcome.root.der(), pki.root_certificate().der());
    assert_eq!(outcome.login.unwrap().username, "admin");

    // The temporary key is spent
    let mut again = Setup::new(pki.root_certificate(), &pki.admin, "server-3", None).unwrap();
    let other = testkit::connect_bootstrap(&listener);
    assert_eq!(remote_code(other.call(&mut again).await), 409);
}

#[tokio::test]
async fn setup_needs_an_admin_issued_by_the_root() {
    let pki = TestPki::new().unwrap();
    let stranger = TestPki::new().unwrap();
    let (state, completed) = SetupState::new(Credentials::temporary());
    let listener = Listener::bootstrap(
        SETUP_ALPN,
        Capabilities::new(Arc::new(NilVerifier)).with_setup(state.clone()),
        commands::setup_commands(),
    );

    let mut setup =
        Setup::new(pki.root_certificate(), &stranger.admin, "server-2", None).unwrap();
    let client = testkit::connect_bootstrap(&listener);
    assert!(client.call(&mut setup).await.is_err());
    assert!(completed.is_empty());
    assert!(state.public_key().is_some());
}

fn login_listener(pki: &TestPki) -> Listener {
    let logins = LoginDirectory::new(&pki.store);
    logins
        .put(&LoginRecord::new("admin", "hunter2", &pki.admin).unwrap())
        .unwrap();
    Listener::bootstrap(
        LOGIN_ALPN,
        Capabilities::new(Arc::new(NilVerifier))
            .with_logins(logins)
            .with_trust(pki.trust.clone())
            .with_identity(pki.server_certificate().clone()),
        commands::login_commands(),
    )
}

#[tokio::test]
async fn login_returns_the_sealed_identity() {
    let pki = TestPki::new().unwrap();
    let client = testkit::connect_bootstrap(&login_listener(&pki));

    let mut login = Login::new("admin", "hunter2");
    client.call(&mut login).await.unwrap();
    let result = login.into_result().unwrap();
    assert_eq!(result.root.der(), pki.root_certificate().der());
    assert_eq!(result.server.der(), pki.server_certificate().der());

    let credentials = result.credentials("hunter2").unwrap();
    assert_eq!(credentials.public_key(), pki.admin.public_key());
    assert!(result.credentials("wrong").is_err());
}

#[tokio::test]
async fn bad_passwords_are_refused() {
    let pki = TestPki::new().unwrap();
    let listener = login_listener(&pki);

    for (username, password) in [("admin", "hunter3"), ("nobody", "hunter2")] {
        let client = testkit::connect_bootstrap(&listener);
        let mut login = Login::new(username, password);
        assert_eq!(remote_code(client.call(&mut login).await), 401);
        assert!(login.result().is_none());
    }
}

#[test]
fn login_debug_hides_the_password() {
    let login = Login::new("admin", "hunter2");
    assert!(!format!("{login:?}").contains("hunter2"));
}
