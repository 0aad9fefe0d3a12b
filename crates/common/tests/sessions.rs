//! Session lifecycle and connection teardown

mod common;

use std::sync::Arc;

use ::common::clock;
use ::common::rpc::commands::Ping;
use ::common::rpc::transport::memory;
use ::common::rpc::{
    Connection, ConnectionState, RequestHeader, RpcError, Session, SessionState, Status,
};
use ::common::testkit::{self, TestPki};

fn loose_session() -> Session {
    let (ours, _theirs) = tokio::io::duplex(1024);
    Session::new(7, Box::new(ours))
}

#[test]
fn sessions_only_move_forward() {
    let mut session = loose_session();
    assert_eq!(session.state(), SessionState::Created);

    for refused in [SessionState::Encrypted, SessionState::Created] {
        assert!(matches!(
            session.transition(refused),
            Err(RpcError::InvalidTransition { .. })
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    session.open().unwrap();
    assert!(session.open().is_err());
    assert_eq!(session.state(), SessionState::Open);

    session.transition(SessionState::Encrypted).unwrap();
    assert!(session.transition(SessionState::Open).is_err());
    assert_eq!(session.state(), SessionState::Encrypted);

    session.transition(SessionState::Closed).unwrap();
    for refused in [
        SessionState::Created,
        SessionState::Open,
        SessionState::Encrypted,
    ] {
        assert!(session.transition(refused).is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }
}

#[tokio::test]
async fn closed_sessions_refuse_io() {
    let mut session = loose_session();
    session.open().unwrap();
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.send(&1u32).await.is_err());
    assert!(session.recv::<u32>().await.is_err());
}

#[tokio::test]
async fn connection_close_ends_every_session() {
    let pki = TestPki::new().unwrap();
    let client = common::connect_admin(&pki, &pki.server_listener())
        .await
        .unwrap();

    let mut first = client.open_session().await.unwrap();
    let _second = client.open_session().await.unwrap();
    assert_eq!(client.active_sessions(), 2);

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(first.call(&mut Ping::new("late")).await.is_err());
    assert!(client.open_session().await.is_err());
    assert!(client.call(&mut Ping::new("later")).await.is_err());
}

#[tokio::test]
async fn sessions_on_one_connection_are_independent() {
    let pki = TestPki::new().unwrap();
    let client = common::connect_admin(&pki, &pki.server_listener())
        .await
        .unwrap();

    let mut broken = client.open_session().await.unwrap();
    let mut healthy = client.open_session().await.unwrap();

    broken
        .write_request(&RequestHeader {
            cmd: "no_such_command".into(),
            timestamp: clock::now(),
            args: Default::default(),
        })
        .await
        .unwrap();
    let response = broken.read_response().await.unwrap();
    assert_eq!(response.code, Status::NotFound.code());

    healthy.call(&mut Ping::new("still here")).await.unwrap();
    assert!(!client.is_closed());
    client.call(&mut Ping::new("and here")).await.unwrap();
}

#[tokio::test]
async fn unauthenticated_links_cannot_reach_commands() {
    let pki = TestPki::new().unwrap();
    let stranger = TestPki::new().unwrap();

    // Issued under a different root
    let result = testkit::connect(
        &pki.server_listener(),
        &stranger.admin,
        &pki.client_verifier(),
    )
    .await;
    assert!(result.is_err());

    // Skipping the handshake altogether
    let (ours, theirs) = memory::pair();
    let listener = pki.server_listener();
    tokio::spawn(async move { listener.serve(Arc::new(theirs)).await });
    let raw = Connection::new(Arc::new(ours));
    assert!(raw.call(&mut Ping::new("hi")).await.is_err());
}
