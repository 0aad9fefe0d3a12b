use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;

/// Replay registry: base64(nonce) -> the timestamp the message was signed at
///
/// Entries are kept until their message could no longer pass the
/// freshness window, so a future-dated message cannot outlive its nonce.
/// Never persisted. The lock is held only for the map operation itself.
#[derive(Debug, Clone, Default)]
pub struct NonceStore {
    inner: Arc<Mutex<HashMap<String, i64>>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `nonce` has not been seen
    pub fn check_nonce(&self, nonce: &[u8]) -> bool {
        !self.inner.lock().contains_key(&STANDARD.encode(nonce))
    }

    pub fn add_nonce(&self, nonce: &[u8], signed_at: i64) {
        self.inner
            .lock()
            .entry(STANDARD.encode(nonce))
            .or_insert(signed_at);
    }

    /// Record `nonce` if it is unseen; false means it is a replay
    pub fn check_and_add(&self, nonce: &[u8], signed_at: i64) -> bool {
        let mut inner = self.inner.lock();
        let key = STANDARD.encode(nonce);
        if inner.contains_key(&key) {
            return false;
        }
        inner.insert(key, signed_at);
        true
    }

    /// Drop entries whose message was signed more than `expiration`
    /// before `now`; those messages fail the freshness window on their own
    pub fn cleanup(&self, now: i64, expiration: Duration) -> usize {
        let window = i64::try_from(expiration.as_secs()).unwrap_or(i64::MAX);
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, signed_at| now.saturating_sub(*signed_at) <= window);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_single_use() {
        let store = NonceStore::new();
        assert!(store.check_nonce(b"n1"));
        assert!(store.check_and_add(b"n1", 100));
        assert!(!store.check_nonce(b"n1"));
        assert!(!store.check_and_add(b"n1", 101));
    }

    #[test]
    fn cleanup_prunes_expired() {
        let store = NonceStore::new();
        store.add_nonce(b"old", 100);
        store.add_nonce(b"new", 125);
        let removed = store.cleanup(140, Duration::from_secs(30));
        assert_eq!(removed, 1);
        assert!(store.check_nonce(b"old"));
        assert!(!store.check_nonce(b"new"));
    }

    #[test]
    fn future_dated_nonces_outlive_their_arrival() {
        let store = NonceStore::new();
        let window = Duration::from_secs(30);
        // Signed at 130, received at 100
        assert!(store.check_and_add(b"ahead", 130));
        assert_eq!(store.cleanup(131, window), 0);
        assert!(!store.check_and_add(b"ahead", 130));
        assert_eq!(store.cleanup(161, window), 1);
    }
}
