//! Shared fixtures for the RPC and trust integration tests
#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use common::pki::{Certificate, Verifier};
use common::rpc::commands;
use common::rpc::transport::{memory, BoxStream, Transport};
use common::rpc::{
    handshake, Capabilities, Connection, Dialer, Listener, RpcError, DEFAULT_EXPIRATION,
};
use common::testkit::{self, TestPki};

/// Everything that crossed a tapped transport, both directions
#[derive(Debug, Clone, Default)]
pub struct Tap {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Tap {
    pub fn contains(&self, needle: &[u8]) -> bool {
        self.bytes
            .lock()
            .windows(needle.len())
            .any(|window| window == needle)
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }
}

/// Transport that records every byte of every stream
#[derive(Debug)]
pub struct TapTransport<T> {
    inner: T,
    tap: Tap,
}

impl<T: Transport> TapTransport<T> {
    pub fn new(inner: T, tap: Tap) -> Self {
        Self { inner, tap }
    }

    fn wrap(&self, stream: BoxStream) -> BoxStream {
        Box::new(TapStream {
            inner: stream,
            tap: self.tap.clone(),
        })
    }
}

#[async_trait]
impl<T: Transport> Transport for TapTransport<T> {
    async fn open_stream(&self) -> Result<BoxStream, RpcError> {
        Ok(self.wrap(self.inner.open_stream().await?))
    }

    async fn accept_stream(&self) -> Result<BoxStream, RpcError> {
        Ok(self.wrap(self.inner.accept_stream().await?))
    }

    fn local_id(&self) -> String {
        self.inner.local_id()
    }

    fn remote_id(&self) -> String {
        self.inner.remote_id()
    }

    fn remote_address(&self) -> String {
        self.inner.remote_address()
    }

    fn close(&self) {
        self.inner.close()
    }
}

struct TapStream {
    inner: BoxStream,
    tap: Tap,
}

impl AsyncRead for TapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.tap
                .bytes
                .lock()
                .extend_from_slice(&buf.filled()[before..]);
        }
        poll
    }
}

impl AsyncWrite for TapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(written)) = &poll {
            this.tap.bytes.lock().extend_from_slice(&data[..*written]);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Route logs through the test harness; `RUST_LOG` picks what shows
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Dial `listener` through a tap and run the handshake
pub async fn connect_tapped(
    listener: &Listener,
    pki: &TestPki,
    tap: Tap,
) -> Result<Connection, RpcError> {
    init_tracing();
    let (ours, theirs) = memory::pair();
    let listener = listener.clone();
    tokio::spawn(async move { listener.serve(Arc::new(theirs)).await });

    let connection = Connection::new(Arc::new(TapTransport::new(ours, tap)));
    handshake::initiate(
        &connection,
        &pki.admin,
        &pki.client_verifier(),
        DEFAULT_EXPIRATION,
    )
    .await?;
    Ok(connection)
}

/// Counts dial attempts and never reaches anyone
#[derive(Debug, Default)]
pub struct CountingDialer {
    dials: AtomicUsize,
}

impl CountingDialer {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(
        &self,
        target: &Certificate,
        _last_seen: Option<&str>,
    ) -> Result<Connection, RpcError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(RpcError::Dial(format!("{} is unreachable", target.name())))
    }
}

/// The pki's agent connected to `listener`, serving the agent command set
pub async fn connect_agent(
    pki: &TestPki,
    listener: &Listener,
    tunnels: bool,
) -> Result<Connection, RpcError> {
    init_tracing();
    let verifier: Arc<dyn Verifier> = Arc::new(pki.client_verifier());
    let capabilities = Capabilities::new(verifier.clone())
        .with_identity(pki.agent.certificate()?.clone())
        .with_tunnels(tunnels);
    testkit::connect_serving(
        listener,
        &pki.agent,
        verifier,
        capabilities,
        commands::agent_commands(),
    )
    .await
}

pub async fn connect_admin(pki: &TestPki, listener: &Listener) -> Result<Connection, RpcError> {
    init_tracing();
    testkit::connect(listener, &pki.admin, &pki.client_verifier()).await
}
