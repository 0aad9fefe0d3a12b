//! Relayed sessions: forward, end-to-end encryption and tunnels

mod common;

use std::sync::Arc;

use ::common::pki::CertificateType;
use ::common::rpc::commands::{open_relayed, Forward, Ping, TcpForward};
use ::common::rpc::{ConnectionPool, RpcError, Status};
use ::common::testkit::{self, TestPki};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::common::{CountingDialer, Tap};

fn code(error: RpcError) -> u16 {
    match error {
        RpcError::Remote { code, .. } => code,
        other => panic!("expected a remote error, got {other}"),
    }
}

#[tokio::test]
async fn operator_reaches_agent_through_the_server() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let _agent = common::connect_agent(&pki, &listener, false).await.unwrap();
    testkit::wait_for_peer(&pki.pool, &pki.agent.public_key().fingerprint())
        .await
        .unwrap();

    let admin = common::connect_admin(&pki, &listener).await.unwrap();
    let agent_cert = pki.agent.certificate().unwrap();
    let mut session = open_relayed(&admin, agent_cert).await.unwrap();
    assert!(session.is_encrypted());

    session.call(&mut Ping::new("over the relay")).await.unwrap();
    session.close().await;

    // Each relayed session is its own pipe
    let mut second = open_relayed(&admin, agent_cert).await.unwrap();
    second.call(&mut Ping::new("again")).await.unwrap();
}

#[tokio::test]
async fn relay_never_sees_the_plaintext() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let _agent = common::connect_agent(&pki, &listener, false).await.unwrap();
    testkit::wait_for_peer(&pki.pool, &pki.agent.public_key().fingerprint())
        .await
        .unwrap();

    let tap = Tap::default();
    let admin = common::connect_tapped(&listener, &pki, tap.clone())
        .await
        .unwrap();
    let secret = "correct horse battery staple";
    let mut session = open_relayed(&admin, pki.agent.certificate().unwrap())
        .await
        .unwrap();
    session.call(&mut Ping::new(secret)).await.unwrap();
    session.close().await;

    // The routing header is visible, the payload is not
    assert!(tap.contains(b"forward"));
    assert!(!tap.contains(secret.as_bytes()));
}

#[tokio::test]
async fn unverifiable_targets_are_never_dialed() {
    let mut pki = TestPki::new().unwrap();
    let dialer = Arc::new(CountingDialer::default());
    pki.pool = ConnectionPool::new().with_dialer(dialer.clone());
    let listener = pki.server_listener();
    let admin = common::connect_admin(&pki, &listener).await.unwrap();

    // Issued by the admin, but never enrolled
    let rogue = pki.issue("rogue", CertificateType::Agent).unwrap();
    let err = admin
        .call(&mut Forward::new(rogue.certificate().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(code(err), Status::Unauthorized.code());
    assert_eq!(dialer.dials(), 0);

    // A verified but offline target is dialed, and the failure reported here
    let err = admin
        .call(&mut Forward::new(pki.agent.certificate().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(code(err), Status::BadGateway.code());
    assert_eq!(dialer.dials(), 1);
}

#[tokio::test]
async fn only_operators_may_forward() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let agent = common::connect_agent(&pki, &listener, false).await.unwrap();

    let err = agent
        .call(&mut Forward::new(pki.server.certificate().unwrap()))
        .await
        .unwrap_err();
    assert_eq!(code(err), Status::Forbidden.code());
}

async fn echo_server() -> String {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = socket.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    address
}

#[tokio::test]
async fn tcp_tunnel_through_the_relay() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let _agent = common::connect_agent(&pki, &listener, true).await.unwrap();
    testkit::wait_for_peer(&pki.pool, &pki.agent.public_key().fingerprint())
        .await
        .unwrap();
    let address = echo_server().await;

    let admin = common::connect_admin(&pki, &listener).await.unwrap();
    let mut session = open_relayed(&admin, pki.agent.certificate().unwrap())
        .await
        .unwrap();
    session.call(&mut TcpForward::new(address)).await.unwrap();

    let mut stream = session.take_stream().unwrap();
    stream.write_all(b"through the tunnel").await.unwrap();
    let mut buf = [0u8; 18];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the tunnel");
}

#[tokio::test]
async fn tunnels_are_off_unless_enabled() {
    let pki = TestPki::new().unwrap();
    let listener = pki.server_listener();
    let _agent = common::connect_agent(&pki, &listener, false).await.unwrap();
    testkit::wait_for_peer(&pki.pool, &pki.agent.public_key().fingerprint())
        .await
        .unwrap();
    let address = echo_server().await;

    let admin = common::connect_admin(&pki, &listener).await.unwrap();
    let mut session = open_relayed(&admin, pki.agent.certificate().unwrap())
        .await
        .unwrap();
    let err = session
        .call(&mut TcpForward::new(address))
        .await
        .unwrap_err();
    assert_eq!(code(err), Status::Unavailable.code());
}
