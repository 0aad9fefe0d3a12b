use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// A change to an observable map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<K, V> {
    Upsert(K, V),
    Remove(K),
}

pub type Subscription<K, V> = flume::Receiver<Event<K, V>>;

struct Inner<K, V> {
    values: RwLock<BTreeMap<K, V>>,
    subscribers: Mutex<Vec<flume::Sender<Event<K, V>>>>,
}

/// Keyed map whose changes are pushed to subscribers
///
/// Every subscriber owns an unbounded queue. Events are queued after the
/// map lock is released, and subscribers whose receiver is gone are
/// dropped on the next publish.
pub struct Observable<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Observable<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> fmt::Debug for Observable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("len", &self.inner.values.read().len())
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

impl<K: Ord + Clone, V: Clone> Default for Observable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> Observable<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                values: RwLock::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn publish(&self, event: Event<K, V>) {
        self.inner
            .subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.values.read().get(key).cloned()
    }

    pub fn upsert(&self, key: K, value: V) {
        self.inner
            .values
            .write()
            .insert(key.clone(), value.clone());
        self.publish(Event::Upsert(key, value));
    }

    /// Insert only if `accept` approves the current value; returns
    /// whether the map changed
    ///
    /// The check and the write happen under one lock, so two racing
    /// writers cannot both win.
    pub fn upsert_if(&self, key: K, value: V, accept: impl FnOnce(Option<&V>) -> bool) -> bool {
        {
            let mut values = self.inner.values.write();
            if !accept(values.get(&key)) {
                return false;
            }
            values.insert(key.clone(), value.clone());
        }
        self.publish(Event::Upsert(key, value));
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.inner.values.write().remove(key);
        if removed.is_some() {
            self.publish(Event::Remove(key.clone()));
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.inner
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn subscribe(&self) -> Subscription<K, V> {
        let (sender, receiver) = flume::unbounded();
        self.inner.subscribers.lock().push(sender);
        receiver
    }

    /// Current contents plus every change after them, with no gap
    pub fn subscribe_with_snapshot(&self) -> (Vec<(K, V)>, Subscription<K, V>) {
        // Holding the read lock keeps writers out between the two steps
        let values = self.inner.values.read();
        let subscription = self.subscribe();
        let snapshot = values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        (snapshot, subscription)
    }

    pub fn len(&self) -> usize {
        self.inner.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}
