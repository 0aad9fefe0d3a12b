use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::pki::Certificate;

use super::connection::Connection;
use super::error::RpcError;

/// Establishes an authenticated connection to a peer we are not
/// connected to yet
#[async_trait]
pub trait Dialer: Send + Sync + Debug + 'static {
    /// `last_seen` is the transport id the peer last connected from, if any
    async fn dial(
        &self,
        target: &Certificate,
        last_seen: Option<&str>,
    ) -> Result<Connection, RpcError>;
}

/// Live connections keyed by the peer's key fingerprint
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    /// Transport ids by fingerprint, kept after the connection goes away
    last_seen: Arc<Mutex<HashMap<String, String>>>,
    dialer: Option<Arc<dyn Dialer>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Register a verified connection, replacing any older one for the peer
    pub fn insert(&self, fingerprint: String, connection: Connection) {
        self.last_seen
            .lock()
            .insert(fingerprint.clone(), connection.remote_id());
        if let Some(previous) = self.connections.lock().insert(fingerprint, connection) {
            if !previous.is_closed() {
                tracing::debug!(remote = %previous.remote_id(), "replacing pooled connection");
            }
        }
    }

    /// Drop `connection` from the pool if it is still the registered one
    pub fn remove(&self, fingerprint: &str, connection: &Connection) {
        let mut connections = self.connections.lock();
        if let Some(current) = connections.get(fingerprint) {
            if current.same(connection) {
                connections.remove(fingerprint);
            }
        }
    }

    /// A running connection to `fingerprint`, pruning a closed one
    pub fn get(&self, fingerprint: &str) -> Option<Connection> {
        let mut connections = self.connections.lock();
        match connections.get(fingerprint) {
            Some(connection) if !connection.is_closed() => Some(connection.clone()),
            Some(_) => {
                connections.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Reuse the pooled connection to `target` or dial a new one
    pub async fn get_or_connect(&self, target: &Certificate) -> Result<Connection, RpcError> {
        let fingerprint = target.fingerprint();
        if let Some(connection) = self.get(&fingerprint) {
            return Ok(connection);
        }
        let dialer = self
            .dialer
            .as_ref()
            .ok_or_else(|| RpcError::Dial(format!("{} is not connected", target.name())))?;
        tracing::debug!(peer = %fingerprint, name = %target.name(), "dialing peer");
        let last_seen = self.last_seen(&fingerprint);
        let connection = dialer.dial(target, last_seen.as_deref()).await?;
        self.insert(fingerprint, connection.clone());
        Ok(connection)
    }

    /// Where `fingerprint` last connected from
    pub fn last_seen(&self, fingerprint: &str) -> Option<String> {
        self.last_seen.lock().get(fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::crypto::SecretKey;
    use crate::pki::{authority, CertificateType};
    use crate::rpc::transport::{memory, Transport};

    #[derive(Debug, Default)]
    struct CountingDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(
            &self,
            _target: &Certificate,
            _last_seen: Option<&str>,
        ) -> Result<Connection, RpcError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, _b) = memory::pair();
            Ok(Connection::new(Arc::new(a)))
        }
    }

    fn agent_certificate() -> Certificate {
        let root = authority::create_root("root", Duration::from_secs(3600)).unwrap();
        authority::issue(
            &root,
            &SecretKey::generate().public(),
            "agent",
            CertificateType::Agent,
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn dials_once_then_reuses() {
        let dialer = Arc::new(CountingDialer::default());
        let pool = ConnectionPool::new().with_dialer(dialer.clone());
        let target = agent_certificate();

        let first = pool.get_or_connect(&target).await.unwrap();
        let second = pool.get_or_connect(&target).await.unwrap();
        assert_eq!(first.remote_id(), second.remote_id());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);

        // A closed connection is replaced on the next request
        first.close();
        pool.get_or_connect(&target).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removing_a_stale_connection_keeps_its_replacement() {
        let pool = ConnectionPool::new();
        let (a, _b) = memory::pair();
        let transport: Arc<dyn Transport> = Arc::new(a);
        // Same remote id, different links
        let stale = Connection::new(transport.clone());
        let live = Connection::new(transport);
        assert_eq!(stale.remote_id(), live.remote_id());

        pool.insert("fp".into(), stale.clone());
        pool.insert("fp".into(), live.clone());
        pool.remove("fp", &stale);
        assert!(pool.get("fp").is_some_and(|c| c.same(&live)));

        pool.remove("fp", &live);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn without_dialer_unknown_peers_fail() {
        let pool = ConnectionPool::new();
        assert!(matches!(
            pool.get_or_connect(&agent_certificate()).await,
            Err(RpcError::Dial(_))
        ));
    }
}
