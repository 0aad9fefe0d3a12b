use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::clock;
use crate::crypto::PublicKey;
use crate::pki::{Certificate, Chain, NonceStore, PkiError};
use crate::rpc::{pki_status, Status, DEFAULT_EXPIRATION};

/// How long a device may wait for an operator before it is timed out
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("no pending enrollment for {0}")]
    NotFound(String),
    #[error("an enrollment for {0} is already pending")]
    AlreadyPending(String),
    #[error("enrollment timed out")]
    TimedOut,
    #[error(transparent)]
    Pki(#[from] PkiError),
}

impl EnrollmentError {
    pub fn status(&self) -> Status {
        match self {
            EnrollmentError::NotFound(_) => Status::NotFound,
            EnrollmentError::AlreadyPending(_) => Status::Conflict,
            EnrollmentError::TimedOut => Status::Timeout,
            EnrollmentError::Pki(e) => pki_status(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    /// Registered, the device has not been told yet
    Requested,
    /// The device is waiting for an operator
    Pending,
    Accepted,
    TimedOut,
}

impl EnrollmentState {
    fn is_final(self) -> bool {
        matches!(self, EnrollmentState::Accepted | EnrollmentState::TimedOut)
    }
}

/// A device registration as shown to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEnrollment {
    pub public_key: PublicKey,
    pub name: String,
    pub address: String,
    pub requested_at: i64,
    pub state: EnrollmentState,
}

impl PendingEnrollment {
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }
}

/// What the waiting device is finally told
///
/// A rejected or abandoned request is indistinguishable from one that
/// was never seen: both end as `TimedOut`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EnrollmentOutcome {
    Accepted { certificate: Certificate, chain: Chain },
    TimedOut,
}

struct Entry {
    request: PendingEnrollment,
    reply: Option<oneshot::Sender<EnrollmentOutcome>>,
}

impl Entry {
    fn finish(&mut self, state: EnrollmentState, outcome: EnrollmentOutcome) {
        self.request.state = state;
        if let Some(reply) = self.reply.take() {
            // The device may already be gone
            let _ = reply.send(outcome);
        }
    }
}

/// In-flight enrollments keyed by the device key fingerprint
///
/// The map lock is only held for map operations; work on one entry
/// happens under that entry's own lock, which is never held while taking
/// the map lock. Expiry is lazy: entries past their lifetime are timed
/// out by the next sweep, which runs before every list and accept.
///
/// The manager also owns the replay store shared by every connection on
/// the enrollment protocol, and each sweep prunes it.
#[derive(Clone)]
pub struct EnrollmentManager {
    entries: Arc<Mutex<HashMap<String, Arc<Mutex<Entry>>>>>,
    lifetime: Duration,
    nonces: NonceStore,
    nonce_window: Duration,
}

impl fmt::Debug for EnrollmentManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentManager")
            .field("entries", &self.entries.lock().len())
            .field("lifetime", &self.lifetime)
            .field("nonces", &self.nonces.len())
            .finish()
    }
}

impl Default for EnrollmentManager {
    fn default() -> Self {
        Self::new(DEFAULT_LIFETIME)
    }
}

impl EnrollmentManager {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            lifetime,
            nonces: NonceStore::new(),
            nonce_window: DEFAULT_EXPIRATION,
        }
    }

    /// Freshness window of enrollment requests, used to prune the nonces
    pub fn with_nonce_window(mut self, window: Duration) -> Self {
        self.nonce_window = window;
        self
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Replay store for the enrollment listener
    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    fn expired(&self, request: &PendingEnrollment, now: i64) -> bool {
        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(request.requested_at) > lifetime
    }

    pub fn request(
        &self,
        public_key: PublicKey,
        name: String,
        address: String,
    ) -> Result<oneshot::Receiver<EnrollmentOutcome>, EnrollmentError> {
        self.request_at(public_key, name, address, clock::now())
    }

    /// Register a device; the receiver resolves with the operator's verdict
    pub fn request_at(
        &self,
        public_key: PublicKey,
        name: String,
        address: String,
        now: i64,
    ) -> Result<oneshot::Receiver<EnrollmentOutcome>, EnrollmentError> {
        let fingerprint = public_key.fingerprint();
        let (reply, receiver) = oneshot::channel();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&fingerprint) {
            let mut existing = existing.lock();
            if !existing.request.state.is_final() && !self.expired(&existing.request, now) {
                return Err(EnrollmentError::AlreadyPending(fingerprint));
            }
            existing.finish(EnrollmentState::TimedOut, EnrollmentOutcome::TimedOut);
        }
        tracing::info!(device = %fingerprint, name = %name, address = %address, "enrollment requested");
        let entry = Entry {
            request: PendingEnrollment {
                public_key,
                name,
                address,
                requested_at: now,
                state: EnrollmentState::Requested,
            },
            reply: Some(reply),
        };
        entries.insert(fingerprint, Arc::new(Mutex::new(entry)));
        Ok(receiver)
    }

    fn entry(&self, fingerprint: &str) -> Option<Arc<Mutex<Entry>>> {
        self.entries.lock().get(fingerprint).cloned()
    }

    /// The device has been told its request is waiting
    pub fn mark_pending(&self, fingerprint: &str) {
        if let Some(entry) = self.entry(fingerprint) {
            let mut entry = entry.lock();
            if entry.request.state == EnrollmentState::Requested {
                entry.request.state = EnrollmentState::Pending;
            }
        }
    }

    /// Time out every entry past its lifetime and prune spent nonces;
    /// returns how many entries timed out
    pub fn sweep_at(&self, now: i64) -> usize {
        let pruned = self.nonces.cleanup(now, self.nonce_window);
        if pruned > 0 {
            tracing::debug!(pruned, "pruned enrollment nonces");
        }
        let mut expired = 0;
        self.entries.lock().retain(|fingerprint, entry| {
            let mut entry = entry.lock();
            if entry.request.state.is_final() {
                return false;
            }
            if self.expired(&entry.request, now) {
                tracing::info!(device = %fingerprint, "enrollment timed out");
                entry.finish(EnrollmentState::TimedOut, EnrollmentOutcome::TimedOut);
                expired += 1;
                return false;
            }
            true
        });
        expired
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(clock::now())
    }

    pub fn list(&self) -> Vec<PendingEnrollment> {
        self.list_at(clock::now())
    }

    /// Snapshot of live enrollments, after a sweep
    pub fn list_at(&self, now: i64) -> Vec<PendingEnrollment> {
        self.sweep_at(now);
        let entries: Vec<_> = self.entries.lock().values().cloned().collect();
        let mut list: Vec<_> = entries
            .iter()
            .map(|entry| entry.lock().request.clone())
            .filter(|request| !request.state.is_final())
            .collect();
        list.sort_by_key(|request| request.requested_at);
        list
    }

    pub fn accept<F>(&self, fingerprint: &str, sign: F) -> Result<Certificate, EnrollmentError>
    where
        F: FnOnce(&PendingEnrollment) -> Result<(Certificate, Chain), EnrollmentError>,
    {
        self.accept_at(fingerprint, sign, clock::now())
    }

    /// Approve an enrollment
    ///
    /// `sign` produces the device certificate and its chain. It runs
    /// under the entry lock, so a concurrent sweep cannot time the entry
    /// out halfway. If it fails the entry stays pending.
    pub fn accept_at<F>(
        &self,
        fingerprint: &str,
        sign: F,
        now: i64,
    ) -> Result<Certificate, EnrollmentError>
    where
        F: FnOnce(&PendingEnrollment) -> Result<(Certificate, Chain), EnrollmentError>,
    {
        self.sweep_at(now);
        let entry = self
            .entry(fingerprint)
            .ok_or_else(|| EnrollmentError::NotFound(fingerprint.to_string()))?;

        let result = {
            let mut entry = entry.lock();
            if entry.request.state.is_final() {
                Err(EnrollmentError::NotFound(fingerprint.to_string()))
            } else if self.expired(&entry.request, now) {
                entry.finish(EnrollmentState::TimedOut, EnrollmentOutcome::TimedOut);
                Err(EnrollmentError::TimedOut)
            } else {
                match sign(&entry.request) {
                    Ok((certificate, chain)) => {
                        entry.finish(
                            EnrollmentState::Accepted,
                            EnrollmentOutcome::Accepted {
                                certificate: certificate.clone(),
                                chain,
                            },
                        );
                        Ok(certificate)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        self.remove_entry(fingerprint, &entry);
        if result.is_ok() {
            tracing::info!(device = %fingerprint, "enrollment accepted");
        }
        result
    }

    /// Time out one entry now (its device stopped waiting)
    pub fn expire(&self, fingerprint: &str) {
        if let Some(entry) = self.entry(fingerprint) {
            {
                let mut guard = entry.lock();
                if !guard.request.state.is_final() {
                    guard.finish(EnrollmentState::TimedOut, EnrollmentOutcome::TimedOut);
                }
            }
            self.remove_entry(fingerprint, &entry);
        }
    }

    fn remove_entry(&self, fingerprint: &str, entry: &Arc<Mutex<Entry>>) {
        let mut entries = self.entries.lock();
        if entries
            .get(fingerprint)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(fingerprint);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
