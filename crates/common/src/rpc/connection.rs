use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::pki::{Certificate, CertificateType, Chain, NonceStore};

use super::command::{ClientCall, CommandCollection};
use super::context::{Capabilities, Context};
use super::dispatch;
use super::error::RpcError;
use super::header::ResponseHeader;
use super::session::Session;
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Running,
    Closed,
}

/// Who is on the other end of a connection
#[derive(Debug, Clone, Default)]
pub enum PeerIdentity {
    /// Bootstrap protocols, or before the hello exchange
    #[default]
    Unverified,
    /// Chain from the peer's certificate to the root
    Verified(Chain),
}

impl PeerIdentity {
    pub fn is_verified(&self) -> bool {
        matches!(self, PeerIdentity::Verified(_))
    }

    pub fn chain(&self) -> Option<&Chain> {
        match self {
            PeerIdentity::Verified(chain) => Some(chain),
            PeerIdentity::Unverified => None,
        }
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.chain().and_then(Chain::leaf)
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    nonces: NonceStore,
    sessions: Mutex<HashSet<u64>>,
    next_session: AtomicU64,
    peer: RwLock<PeerIdentity>,
    closed: CancellationToken,
}

/// One transport link to one peer, carrying many independent sessions
///
/// Cheap to clone; all clones share the same link. Closing the connection
/// tears down every session opened on it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.inner.transport.remote_id())
            .field("state", &*self.inner.state.lock())
            .field("sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

/// Removes a session from its connection's registry when dropped
pub(crate) struct SessionGuard {
    id: u64,
    inner: Arc<Inner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.sessions.lock().remove(&self.id);
    }
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_nonces(transport, NonceStore::new())
    }

    pub fn with_nonces(transport: Arc<dyn Transport>, nonces: NonceStore) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(ConnectionState::Running),
                nonces,
                sessions: Mutex::new(HashSet::new()),
                next_session: AtomicU64::new(1),
                peer: RwLock::new(PeerIdentity::Unverified),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn ensure_running(&self) -> Result<(), RpcError> {
        match self.state() {
            ConnectionState::Running => Ok(()),
            ConnectionState::Closed => Err(RpcError::ConnectionClosed),
        }
    }

    fn register(&self, stream: super::transport::BoxStream) -> Result<Session, RpcError> {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions.lock().insert(id);
        let guard = SessionGuard {
            id,
            inner: self.inner.clone(),
        };
        let mut session = Session::new(id, stream).with_guard(guard);
        session.open()?;
        Ok(session)
    }

    /// Open a new session towards the peer
    pub async fn open_session(&self) -> Result<Session, RpcError> {
        self.ensure_running()?;
        let stream = self.inner.transport.open_stream().await?;
        self.register(stream)
    }

    /// Wait for the peer to open a session
    pub async fn accept_session(&self) -> Result<Session, RpcError> {
        self.ensure_running()?;
        let stream = tokio::select! {
            _ = self.inner.closed.cancelled() => return Err(RpcError::ConnectionClosed),
            stream = self.inner.transport.accept_stream() => stream?,
        };
        // Lost a race with close()
        self.ensure_running()?;
        self.register(stream)
    }

    /// Accept sessions until the connection closes, one task per session
    pub async fn serve(&self, capabilities: Arc<Capabilities>, commands: Arc<CommandCollection>) {
        let ctx = Context {
            connection: self.clone(),
            capabilities,
            commands,
        };
        loop {
            let session = match self.accept_session().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!(remote = %self.remote_id(), "stopped accepting sessions: {}", e);
                    break;
                }
            };
            let ctx = ctx.clone();
            tokio::spawn(async move { dispatch::handle_incoming(session, ctx).await });
        }
        self.close();
    }

    /// Run one command on a fresh session and close it afterwards
    pub async fn call<C: ClientCall + ?Sized>(
        &self,
        command: &mut C,
    ) -> Result<ResponseHeader, RpcError> {
        let mut session = self.open_session().await?;
        let result = session.call(command).await;
        session.close().await;
        result
    }

    /// Mark the connection closed, then tear the transport down
    ///
    /// Accept loops observe the closed state before the transport goes
    /// away, so they exit instead of racing on a dead link.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        self.inner.closed.cancel();
        self.inner.transport.close();
        tracing::debug!(remote = %self.remote_id(), "connection closed");
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.inner.nonces
    }

    pub fn peer(&self) -> PeerIdentity {
        self.inner.peer.read().clone()
    }

    pub fn set_peer(&self, peer: PeerIdentity) {
        *self.inner.peer.write() = peer;
    }

    pub fn peer_certificate(&self) -> Option<Certificate> {
        self.inner.peer.read().certificate().cloned()
    }

    pub fn peer_type(&self) -> Option<CertificateType> {
        self.inner.peer.read().certificate().map(Certificate::kind)
    }

    pub fn local_id(&self) -> String {
        self.inner.transport.local_id()
    }

    pub fn remote_id(&self) -> String {
        self.inner.transport.remote_id()
    }

    /// Whether both handles refer to the same link
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn remote_address(&self) -> String {
        self.inner.transport.remote_address()
    }

    /// Number of sessions currently open on this connection
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }
}
