use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pki::{Certificate, CertificateType, PkiError, RevocationStore, SignedArtifact, Verifier};
use crate::pubsub::{Observable, Subscription};
use crate::store::{Scope, StoreError};

/// Settings an operator pushes to one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Certificate name of the host this applies to
    pub target: String,
    pub settings: BTreeMap<String, String>,
}

impl HostConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

pub type HostConfigArtifact = SignedArtifact<HostConfig>;

/// Check that `artifact` may be applied, returning its author
///
/// The creator key must verify to a root or user certificate and the
/// signed bytes must not be on `revocations`. Servers run this before
/// accepting a publish; agents run it again on everything synced down.
pub async fn check_author(
    artifact: &HostConfigArtifact,
    verifier: &dyn Verifier,
    revocations: &RevocationStore,
) -> Result<Certificate, PkiError> {
    let chain = verifier.verify_public_key(artifact.creator()).await?;
    let author = chain
        .leaf()
        .ok_or_else(|| PkiError::ChainBuildFailed("empty chain".into()))?;
    if !matches!(author.kind(), CertificateType::Root | CertificateType::User) {
        return Err(PkiError::PermissionDenied(format!(
            "{} keys cannot author host configurations",
            author.kind()
        )));
    }
    artifact.check_revocation(revocations)?;
    Ok(author.clone())
}

/// Check an artifact synced down from a server before applying it
///
/// Synced artifacts are legitimately old, so only the future side of the
/// freshness window applies. The author is checked as on the server.
pub async fn check_synced(
    artifact: &HostConfigArtifact,
    verifier: &dyn Verifier,
    revocations: &RevocationStore,
    window: Duration,
    now: i64,
) -> Result<Certificate, PkiError> {
    let window = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    if artifact.timestamp() > now.saturating_add(window) {
        return Err(PkiError::Expired(format!(
            "signed {}s in the future",
            artifact.timestamp() - now
        )));
    }
    check_author(artifact, verifier, revocations).await
}

/// Last-writer-wins host configurations, by target
///
/// An artifact replaces the stored one only if its signer timestamp is
/// strictly newer. Whether its creator may publish at all is decided by
/// the caller before `apply`.
#[derive(Debug, Clone)]
pub struct HostConfigStore {
    configs: Observable<String, HostConfigArtifact>,
    scope: Option<Scope>,
}

impl Default for HostConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfigStore {
    /// In memory only
    pub fn new() -> Self {
        Self {
            configs: Observable::new(),
            scope: None,
        }
    }

    /// Backed by `scope`, loading what is already there
    pub fn persistent(scope: Scope) -> Result<Self, PkiError> {
        let configs = Observable::new();
        let records = scope.view(|tx| Ok(tx.scan_prefix(b"")))?;
        for (key, bytes) in records {
            match HostConfigArtifact::from_bytes(&bytes) {
                Ok(artifact) => configs.upsert(artifact.body().target.clone(), artifact),
                Err(e) => tracing::warn!(
                    target_host = %String::from_utf8_lossy(&key),
                    "skipping unreadable host config: {}",
                    e
                ),
            }
        }
        Ok(Self {
            configs,
            scope: Some(scope),
        })
    }

    /// Store `artifact` if it is newer than the current one
    ///
    /// Returns `false` for a stale or equally old artifact.
    pub fn apply(&self, artifact: HostConfigArtifact) -> Result<bool, PkiError> {
        let target = artifact.body().target.clone();
        let timestamp = artifact.timestamp();
        let bytes = artifact.to_bytes().to_vec();
        let applied = self.configs.upsert_if(target.clone(), artifact, |current| {
            current.map_or(true, |current| timestamp > current.timestamp())
        });
        if !applied {
            tracing::debug!(target_host = %target, timestamp, "ignoring stale host config");
            return Ok(false);
        }
        if let Some(scope) = &self.scope {
            scope.update(|tx| {
                tx.put(target.as_bytes(), bytes);
                Ok::<_, StoreError>(())
            })?;
        }
        tracing::info!(target_host = %target, timestamp, "host config updated");
        Ok(true)
    }

    pub fn get(&self, target: &str) -> Option<HostConfigArtifact> {
        self.configs.get(&target.to_string())
    }

    pub fn remove(&self, target: &str) -> Result<bool, PkiError> {
        let removed = self.configs.remove(&target.to_string()).is_some();
        if removed {
            if let Some(scope) = &self.scope {
                scope.update(|tx| Ok(tx.delete(target.as_bytes())))?;
            }
        }
        Ok(removed)
    }

    pub fn snapshot(&self) -> Vec<HostConfigArtifact> {
        self.configs.snapshot().into_iter().map(|(_, v)| v).collect()
    }

    /// Everything stored now, then every later change
    pub fn subscribe(&self) -> (Vec<HostConfigArtifact>, Subscription<String, HostConfigArtifact>) {
        let (snapshot, subscription) = self.configs.subscribe_with_snapshot();
        (snapshot.into_iter().map(|(_, v)| v).collect(), subscription)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use crate::pubsub::Event;
    use crate::store::Store;

    fn signed(key: &SecretKey, value: &str, at: i64) -> HostConfigArtifact {
        SignedArtifact::sign_at(HostConfig::new("host-1").with("mode", value), key, at).unwrap()
    }

    #[test]
    fn only_strictly_newer_artifacts_win() {
        let store = HostConfigStore::new();
        let key = SecretKey::generate();

        assert!(store.apply(signed(&key, "a", 100)).unwrap());
        assert!(!store.apply(signed(&key, "b", 100)).unwrap());
        assert!(!store.apply(signed(&key, "c", 99)).unwrap());
        assert!(store.apply(signed(&key, "d", 101)).unwrap());

        let current = store.get("host-1").unwrap();
        assert_eq!(current.body().settings["mode"], "d");
    }

    #[test]
    fn subscribers_get_applied_updates() {
        let store = HostConfigStore::new();
        let key = SecretKey::generate();
        store.apply(signed(&key, "a", 100)).unwrap();

        let (snapshot, events) = store.subscribe();
        assert_eq!(snapshot.len(), 1);

        store.apply(signed(&key, "old", 50)).unwrap();
        store.apply(signed(&key, "b", 200)).unwrap();
        match events.try_recv().unwrap() {
            Event::Upsert(target, artifact) => {
                assert_eq!(target, "host-1");
                assert_eq!(artifact.timestamp(), 200);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn persisted_configs_reload() {
        let backing = Store::memory();
        let key = SecretKey::generate();
        let store = HostConfigStore::persistent(backing.scope("host_configs")).unwrap();
        store.apply(signed(&key, "a", 100)).unwrap();

        let reloaded = HostConfigStore::persistent(backing.scope("host_configs")).unwrap();
        assert_eq!(reloaded.get("host-1").unwrap().timestamp(), 100);
        // Reloaded state still enforces ordering
        assert!(!reloaded.apply(signed(&key, "b", 90)).unwrap());
    }
}
