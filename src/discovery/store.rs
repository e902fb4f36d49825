//! Registry store abstraction
//!
//! The registry is an external watch-capable key-value store with TTL
//! leases; this trait is the seam the rest of the crate sees. The in-memory
//! implementation backs tests and single-process topologies; a production
//! binding (e.g. an etcd adapter) implements the same trait.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Identifier of a TTL lease
pub type LeaseId = u64;

/// A key change under a watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

/// Watch-capable key-value store with TTL leases
pub trait RegistryStore: Send + Sync + 'static {
    /// Current entries under a prefix
    fn snapshot(&self, prefix: &str) -> impl Future<Output = Result<Vec<(String, String)>>> + Send;

    /// Stream of changes under a prefix, starting after the call
    fn watch(&self, prefix: &str) -> impl Future<Output = mpsc::Receiver<KvEvent>> + Send;

    /// Write a key bound to a fresh lease of `ttl`
    fn put_with_lease(&self, key: &str, value: &str, ttl: Duration) -> impl Future<Output = Result<LeaseId>> + Send;

    /// Push a lease's expiry out by its full TTL
    fn keep_alive(&self, lease: LeaseId) -> impl Future<Output = Result<()>> + Send;

    /// Remove a key
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

const WATCH_CHANNEL_SIZE: usize = 128;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct LeaseState {
    deadline: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<KvEvent>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: Vec<Watcher>,
}

/// In-process [`RegistryStore`]
#[derive(Clone)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
    next_lease: Arc<AtomicU64>,
}

impl MemoryRegistry {
    /// Create the store and spawn its lease sweeper
    pub fn new() -> Self {
        let registry = Self {
            state: Arc::new(Mutex::new(State::default())),
            next_lease: Arc::new(AtomicU64::new(1)),
        };
        tokio::spawn(Self::sweep_loop(Arc::downgrade(&registry.state)));
        registry
    }

    async fn sweep_loop(state: Weak<Mutex<State>>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                return;
            };
            let now = Instant::now();
            let mut guard = state.lock();
            let expired: Vec<LeaseId> = guard
                .leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in expired {
                if let Some(lease) = guard.leases.remove(&id) {
                    for key in lease.keys {
                        guard.entries.remove(&key);
                        tracing::debug!(%key, lease = id, "registry lease expired");
                        notify(&mut guard, KvEvent::Delete { key });
                    }
                }
            }
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(state: &mut State, event: KvEvent) {
    let key = match &event {
        KvEvent::Put { key, .. } | KvEvent::Delete { key } => key.clone(),
    };
    state.watchers.retain(|watcher| {
        if !key.starts_with(&watcher.prefix) {
            return true;
        }
        match watcher.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(prefix = %watcher.prefix, "registry watcher lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

impl RegistryStore for MemoryRegistry {
    fn snapshot(&self, prefix: &str) -> impl Future<Output = Result<Vec<(String, String)>>> + Send {
        let state = Arc::clone(&self.state);
        let prefix = prefix.to_string();
        async move {
            let guard = state.lock();
            Ok(guard
                .entries
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, entry)| (key.clone(), entry.value.clone()))
                .collect())
        }
    }

    fn watch(&self, prefix: &str) -> impl Future<Output = mpsc::Receiver<KvEvent>> + Send {
        let state = Arc::clone(&self.state);
        let prefix = prefix.to_string();
        async move {
            let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
            state.lock().watchers.push(Watcher { prefix, tx });
            rx
        }
    }

    fn put_with_lease(&self, key: &str, value: &str, ttl: Duration) -> impl Future<Output = Result<LeaseId>> + Send {
        let state = Arc::clone(&self.state);
        let next_lease = Arc::clone(&self.next_lease);
        let key = key.to_string();
        let value = value.to_string();
        async move {
            let lease = next_lease.fetch_add(1, Ordering::Relaxed);
            let mut guard = state.lock();
            guard.leases.insert(
                lease,
                LeaseState {
                    deadline: Instant::now() + ttl,
                    ttl,
                    keys: HashSet::from([key.clone()]),
                },
            );
            guard.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    lease: Some(lease),
                },
            );
            notify(&mut guard, KvEvent::Put { key, value });
            Ok(lease)
        }
    }

    fn keep_alive(&self, lease: LeaseId) -> impl Future<Output = Result<()>> + Send {
        let state = Arc::clone(&self.state);
        async move {
            let mut guard = state.lock();
            match guard.leases.get_mut(&lease) {
                Some(entry) => {
                    entry.deadline = Instant::now() + entry.ttl;
                    Ok(())
                }
                None => Err(Error::LeaseNotFound),
            }
        }
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        let state = Arc::clone(&self.state);
        let key = key.to_string();
        async move {
            let mut guard = state.lock();
            if let Some(entry) = guard.entries.remove(&key) {
                if let Some(lease) = entry.lease {
                    if let Some(lease_state) = guard.leases.get_mut(&lease) {
                        lease_state.keys.remove(&key);
                    }
                }
                notify(&mut guard, KvEvent::Delete { key });
            }
            Ok(())
        }
    }
}
