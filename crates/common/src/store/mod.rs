//! Scoped transactional key-value store
//!
//! The trust core only needs a handful of operations from its storage:
//! named (and nested) scopes, `view`/`update` callbacks with transactional
//! isolation, get/put/delete by key and prefix iteration. A [`Backend`]
//! supplies a single flat byte map with those transaction semantics and
//! [`Scope`] carves it into namespaces.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// The flat map every backend exposes to a transaction
pub type Bucket = BTreeMap<Vec<u8>, Vec<u8>>;

// Tags separating a scope's own keys from its child scopes, so a prefix
// scan never wanders into a nested namespace.
const KEY_TAG: u8 = 0x01;
const SCOPE_TAG: u8 = 0x02;
const SCOPE_END: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(String),
    #[error("invalid record under key {0}")]
    InvalidRecord(String),
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Transactional access to a flat byte map
///
/// `update` must either apply every write made by the callback or none of
/// them: if the callback returns an error the map is left untouched.
pub trait Backend: Send + Sync + Debug + 'static {
    fn view(
        &self,
        f: &mut dyn FnMut(&Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;

    fn update(
        &self,
        f: &mut dyn FnMut(&mut Bucket) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

/// Handle on a store backend; cheap to clone
#[derive(Debug, Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: impl Backend) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// A fresh, empty in-memory store
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// A store persisted to `path`, loading any existing snapshot
    pub fn file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(FileStore::open(path)?))
    }

    /// Top-level named scope
    pub fn scope(&self, name: &str) -> Scope {
        Scope {
            backend: self.backend.clone(),
            prefix: Vec::new(),
        }
        .scope(name)
    }
}

/// A named namespace within a store
#[derive(Debug, Clone)]
pub struct Scope {
    backend: Arc<dyn Backend>,
    prefix: Vec<u8>,
}

impl Scope {
    /// Nested scope below this one
    pub fn scope(&self, name: &str) -> Scope {
        let mut prefix = self.prefix.clone();
        prefix.push(SCOPE_TAG);
        prefix.extend_from_slice(name.as_bytes());
        prefix.push(SCOPE_END);
        Scope {
            backend: self.backend.clone(),
            prefix,
        }
    }

    fn key_prefix(&self) -> Vec<u8> {
        let mut prefix = self.prefix.clone();
        prefix.push(KEY_TAG);
        prefix
    }

    /// Run a read-only transaction over this scope
    pub fn view<T>(
        &self,
        f: impl FnOnce(&ReadTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let prefix = self.key_prefix();
        let mut f = Some(f);
        let mut out = None;
        self.backend.view(&mut |bucket| {
            let f = f
                .take()
                .ok_or_else(|| StoreError::Transaction("view callback re-entered".into()))?;
            out = Some(f(&ReadTx {
                bucket,
                prefix: &prefix,
            })?);
            Ok(())
        })?;
        out.ok_or_else(|| StoreError::Transaction("view callback never ran".into()))
    }

    /// Run a read-write transaction over this scope
    ///
    /// Writes become visible only if `f` returns `Ok`.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let prefix = self.key_prefix();
        let mut f = Some(f);
        let mut out = None;
        self.backend.update(&mut |bucket| {
            let f = f
                .take()
                .ok_or_else(|| StoreError::Transaction("update callback re-entered".into()))?;
            out = Some(f(&mut WriteTx {
                bucket,
                prefix: &prefix,
            })?);
            Ok(())
        })?;
        out.ok_or_else(|| StoreError::Transaction("update callback never ran".into()))
    }
}

fn full_key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(prefix.len() + key.len());
    full.extend_from_slice(prefix);
    full.extend_from_slice(key);
    full
}

fn scan(bucket: &Bucket, prefix: &[u8], key_prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let start = full_key(prefix, key_prefix);
    bucket
        .range(start.clone()..)
        .take_while(|(k, _)| k.starts_with(&start))
        .map(|(k, v)| (k[prefix.len()..].to_vec(), v.clone()))
        .collect()
}

/// Read access to one scope within a transaction
pub struct ReadTx<'a> {
    bucket: &'a Bucket,
    prefix: &'a [u8],
}

impl ReadTx<'_> {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.bucket.get(&full_key(self.prefix, key)).cloned()
    }

    /// All entries whose key starts with `key_prefix`, in key order
    pub fn scan_prefix(&self, key_prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        scan(self.bucket, self.prefix, key_prefix)
    }
}

/// Read-write access to one scope within a transaction
pub struct WriteTx<'a> {
    bucket: &'a mut Bucket,
    prefix: &'a [u8],
}

impl WriteTx<'_> {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.bucket.get(&full_key(self.prefix, key)).cloned()
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.bucket.insert(full_key(self.prefix, key), value);
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.bucket.remove(&full_key(self.prefix, key)).is_some()
    }

    pub fn scan_prefix(&self, key_prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        scan(self.bucket, self.prefix, key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_isolated() {
        let store = Store::memory();
        let users = store.scope("pki").scope("users");
        let devices = store.scope("pki").scope("devices");

        users
            .update(|tx| {
                tx.put(b"alice", b"cert-a".to_vec());
                Ok(())
            })
            .unwrap();
        devices
            .update(|tx| {
                tx.put(b"alice", b"cert-d".to_vec());
                Ok(())
            })
            .unwrap();

        assert_eq!(
            users.view(|tx| Ok(tx.get(b"alice"))).unwrap(),
            Some(b"cert-a".to_vec())
        );
        assert_eq!(
            devices.view(|tx| Ok(tx.get(b"alice"))).unwrap(),
            Some(b"cert-d".to_vec())
        );

        // The parent scope sees neither child's keys
        let parent = store.scope("pki");
        assert!(parent.view(|tx| Ok(tx.scan_prefix(b""))).unwrap().is_empty());
    }

    #[test]
    fn scan_prefix_strips_scope() {
        let store = Store::memory();
        let scope = store.scope("revoked");
        scope
            .update(|tx| {
                tx.put(b"sha256:aa", vec![1]);
                tx.put(b"sha256:bb", vec![2]);
                tx.put(b"sha384:cc", vec![3]);
                Ok(())
            })
            .unwrap();

        let found = scope.view(|tx| Ok(tx.scan_prefix(b"sha256:"))).unwrap();
        let keys: Vec<_> = found.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"sha256:aa".to_vec(), b"sha256:bb".to_vec()]);
    }

    #[test]
    fn failed_update_rolls_back() {
        let store = Store::memory();
        let scope = store.scope("s");
        let result: Result<(), StoreError> = scope.update(|tx| {
            tx.put(b"k", b"v".to_vec());
            Err(StoreError::Transaction("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(scope.view(|tx| Ok(tx.get(b"k"))).unwrap(), None);
    }
}
