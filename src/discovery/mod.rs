//! Service discovery
//!
//! Services publish themselves under `/services/<name>/<addr>` as JSON
//! endpoint records held alive by a TTL lease; peers watch the prefix and
//! receive add/remove events as nodes come and go. The registry itself is
//! behind [`RegistryStore`]; this module is the watcher and registration
//! logic on top of it.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use store::{KvEvent, LeaseId, MemoryRegistry, RegistryStore};

/// Root of all service registrations
pub const SERVICE_PREFIX: &str = "/services";

/// Registry path of the Connect-Node service
pub const CONNECT_NODE_SERVICE: &str = "connect-node";
/// Registry path of the Controller service
pub const CONTROLLER_SERVICE: &str = "controller-manager";
/// Registry path of the Push-Manager service
pub const PUSH_MANAGER_SERVICE: &str = "push-manager";

/// Lease TTL for registered endpoints; renewal runs at half this
pub const LEASE_TTL: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_SIZE: usize = 100;

/// Watch prefix for a service name
pub fn service_prefix(service: &str) -> String {
    format!("{SERVICE_PREFIX}/{service}/")
}

/// Registry key for one endpoint of a service
pub fn endpoint_key(service: &str, addr: &str) -> String {
    format!("{SERVICE_PREFIX}/{service}/{addr}")
}

/// JSON value stored under an endpoint key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "Op")]
    pub op: i32,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Kind of endpoint change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Add,
    Delete,
}

/// An endpoint appearing or disappearing under the watched prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointEvent {
    pub kind: EventType,
    pub key: String,
    pub addr: String,
}

/// Watches one service's endpoints and exposes a snapshot plus an event
/// stream
pub struct ServiceDiscovery {
    service: String,
    endpoints: Arc<RwLock<HashMap<String, String>>>,
    events: Mutex<Option<mpsc::Receiver<EndpointEvent>>>,
    cancel: CancellationToken,
}

impl ServiceDiscovery {
    /// Take the initial snapshot and start the watch loop
    pub async fn new<S: RegistryStore>(store: Arc<S>, service: &str) -> Result<Self> {
        let prefix = service_prefix(service);
        let endpoints = Arc::new(RwLock::new(HashMap::new()));

        // Watch before snapshotting so changes in between are not lost;
        // duplicate puts are absorbed by the map.
        let watch_rx = store.watch(&prefix).await;
        for (key, value) in store.snapshot(&prefix).await? {
            match parse_endpoint(&value) {
                Some(endpoint) => {
                    tracing::info!(service, %key, addr = %endpoint.addr, "discovered endpoint");
                    endpoints.write().insert(key, endpoint.addr);
                }
                None => tracing::warn!(service, %key, "unparseable endpoint value in snapshot"),
            }
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        tokio::spawn(watch_loop(
            service.to_string(),
            watch_rx,
            Arc::clone(&endpoints),
            event_tx,
            cancel.clone(),
        ));

        Ok(Self {
            service: service.to_string(),
            endpoints,
            events: Mutex::new(Some(event_rx)),
            cancel,
        })
    }

    /// Addresses currently known for the service
    pub fn get_endpoints(&self) -> Vec<String> {
        let endpoints = self.endpoints.read();
        if endpoints.is_empty() {
            tracing::warn!(service = %self.service, "no live endpoints");
        }
        endpoints.values().cloned().collect()
    }

    /// Take the event stream; the first caller owns it
    pub fn take_events(&self) -> Option<mpsc::Receiver<EndpointEvent>> {
        self.events.lock().take()
    }

    /// Stop the watch loop
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn parse_endpoint(value: &str) -> Option<Endpoint> {
    serde_json::from_str(value).ok()
}

async fn watch_loop(
    service: String,
    mut watch_rx: mpsc::Receiver<KvEvent>,
    endpoints: Arc<RwLock<HashMap<String, String>>>,
    event_tx: mpsc::Sender<EndpointEvent>,
    cancel: CancellationToken,
) {
    loop {
        let kv = tokio::select! {
            _ = cancel.cancelled() => break,
            kv = watch_rx.recv() => match kv {
                Some(kv) => kv,
                None => break,
            },
        };

        let event = match kv {
            KvEvent::Put { key, value } => match parse_endpoint(&value) {
                Some(endpoint) => {
                    let changed = {
                        let mut map = endpoints.write();
                        map.insert(key.clone(), endpoint.addr.clone()) != Some(endpoint.addr.clone())
                    };
                    if !changed {
                        continue;
                    }
                    tracing::info!(service = %service, %key, addr = %endpoint.addr, "endpoint up");
                    EndpointEvent {
                        kind: EventType::Add,
                        key,
                        addr: endpoint.addr,
                    }
                }
                None => {
                    // Bad value; skip and keep watching, the next event
                    // will resync this key.
                    tracing::warn!(service = %service, %key, "unparseable endpoint value");
                    continue;
                }
            },
            KvEvent::Delete { key } => {
                let removed = endpoints.write().remove(&key);
                match removed {
                    Some(addr) => {
                        tracing::info!(service = %service, %key, %addr, "endpoint down");
                        EndpointEvent {
                            kind: EventType::Delete,
                            key,
                            addr,
                        }
                    }
                    None => continue,
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = event_tx.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(service = %service, "discovery watch loop stopped");
}

/// Register `addr` under a service and keep its lease alive until `cancel`
///
/// Renewal runs at half the lease TTL; a lost lease (e.g. after a registry
/// restart) is re-created. Cancellation deletes the key so peers see the
/// endpoint go away immediately instead of waiting for expiry.
pub fn spawn_register<S: RegistryStore>(
    store: Arc<S>,
    service: &str,
    addr: &str,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let key = endpoint_key(service, addr);
    let value = serde_json::to_string(&Endpoint {
        op: 0,
        addr: addr.to_string(),
        metadata: None,
    })
    .expect("endpoint serializes");
    let service = service.to_string();

    tokio::spawn(async move {
        let mut lease = match store.put_with_lease(&key, &value, LEASE_TTL).await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::error!(service = %service, %key, %err, "endpoint registration failed");
                return;
            }
        };
        tracing::info!(service = %service, %key, "endpoint registered");

        let mut ticker = tokio::time::interval(LEASE_TTL / 2);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = store.delete(&key).await;
                    tracing::info!(service = %service, %key, "endpoint deregistered");
                    return;
                }
                _ = ticker.tick() => {
                    match store.keep_alive(lease).await {
                        Ok(()) => tracing::debug!(service = %service, %key, "lease renewed"),
                        Err(err) => {
                            tracing::warn!(service = %service, %key, %err, "lease renewal failed, re-registering");
                            if let Ok(new_lease) = store.put_with_lease(&key, &value, LEASE_TTL).await {
                                lease = new_lease;
                            }
                        }
                    }
                }
            }
        }
    })
}
