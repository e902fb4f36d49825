//! Push-Manager dispatch core
//!
//! The Push-Manager is a fan-out bus, not a queue: a producer broadcast is
//! enqueued onto every live Connect-Node's dispatch client and the RPC
//! returns immediately. Each dispatch client owns one RPC connection and a
//! small worker pool draining a bounded queue; when a queue is full the
//! message is dropped for that node rather than stalling the producer.
//!
//! The set of dispatch clients tracks service discovery: every endpoint
//! event triggers a reconciliation against the latest snapshot — new nodes
//! get a client, vanished nodes have theirs closed, existing ones are kept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::discovery::{RegistryStore, ServiceDiscovery, CONNECT_NODE_SERVICE};
use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::rpc::api::{BroadcastParams, BroadcastReply, METHOD_BROADCAST};
use crate::rpc::{Reply, RpcClient, RpcHandler, MAX_MESSAGE_SIZE};
use crate::stats::{incr, Metrics};

/// Queue depth per dispatch client
pub const DISPATCH_QUEUE_SIZE: usize = 1000;

/// Workers per dispatch client
pub const WORKER_COUNT: usize = 10;

/// One broadcast bound for one Connect-Node
#[derive(Debug, Clone)]
pub struct BroadcastReq {
    pub frame: Frame,
    pub proto_op: i32,
}

/// Outbound queue and worker pool for one Connect-Node peer
pub struct DispatchClient {
    node_id: String,
    client: RpcClient,
    queue: mpsc::Sender<BroadcastReq>,
    cancel: CancellationToken,
}

impl DispatchClient {
    async fn connect(node_id: String, addr: &str, rpc_timeout: Duration, metrics: Arc<Metrics>) -> Result<Arc<Self>> {
        let client = RpcClient::connect(addr, MAX_MESSAGE_SIZE).await?;
        let (queue_tx, queue_rx) = mpsc::channel(DISPATCH_QUEUE_SIZE);
        let cancel = CancellationToken::new();

        let dc = Arc::new(Self {
            node_id,
            client,
            queue: queue_tx,
            cancel,
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker_id in 0..WORKER_COUNT {
            tokio::spawn(run_worker(
                Arc::clone(&dc),
                Arc::clone(&queue_rx),
                worker_id,
                rpc_timeout,
                Arc::clone(&metrics),
            ));
        }
        Ok(dc)
    }

    /// Queue a broadcast; a full queue drops it for this node
    fn enqueue(&self, req: BroadcastReq) -> Result<()> {
        match self.queue.try_send(req) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::SignalFullMsgDropped),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Stop the workers and drop the RPC connection
    pub fn close(&self) {
        tracing::info!(node = %self.node_id, "closing dispatch client");
        self.cancel.cancel();
        self.client.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_worker(
    dc: Arc<DispatchClient>,
    queue_rx: Arc<Mutex<mpsc::Receiver<BroadcastReq>>>,
    worker_id: usize,
    rpc_timeout: Duration,
    metrics: Arc<Metrics>,
) {
    loop {
        let req = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                _ = dc.cancel.cancelled() => return,
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            }
        };

        let params = BroadcastParams {
            proto_op: req.proto_op,
            speed: 0,
        };
        let result = dc
            .client
            .call_api::<_, serde_json::Value>(METHOD_BROADCAST, &params, Some(&req.frame), rpc_timeout)
            .await;
        if let Err(err) = result {
            // The message is lost for this node; nothing retries it.
            incr(&metrics.rpc_failures);
            tracing::warn!(node = %dc.node_id, worker = worker_id, %err, "broadcast push to node failed");
        }
    }
}

/// The Push-Manager service
pub struct PushManager {
    manager_id: String,
    rpc_timeout: Duration,
    discovery: ServiceDiscovery,
    clients: RwLock<HashMap<String, Arc<DispatchClient>>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl PushManager {
    /// Start watching Connect-Nodes and reconciling dispatch clients
    pub async fn new<S: RegistryStore>(
        manager_id: impl Into<String>,
        store: Arc<S>,
        rpc_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let discovery = ServiceDiscovery::new(store, CONNECT_NODE_SERVICE).await?;
        let pm = Arc::new(Self {
            manager_id: manager_id.into(),
            rpc_timeout,
            discovery,
            clients: RwLock::new(HashMap::new()),
            metrics,
            cancel: CancellationToken::new(),
        });

        pm.reconcile().await;

        let mut events = pm.discovery.take_events().expect("fresh discovery stream");
        let watcher = Arc::clone(&pm);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher.cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            tracing::info!(manager = %watcher.manager_id, ?event, "connect-node topology changed");
                            watcher.reconcile().await;
                        }
                        None => break,
                    },
                }
            }
            watcher.close_all_clients();
        });

        Ok(pm)
    }

    /// Node id a dispatch client is registered under for an address
    pub fn node_id_for(addr: &str) -> String {
        format!("connect-node-{addr}")
    }

    // Bring the client map in line with the latest discovery snapshot.
    async fn reconcile(&self) {
        let addrs = self.discovery.get_endpoints();

        for addr in &addrs {
            let node_id = Self::node_id_for(addr);
            if self.clients.read().contains_key(&node_id) {
                continue;
            }
            match DispatchClient::connect(node_id.clone(), addr, self.rpc_timeout, Arc::clone(&self.metrics)).await {
                Ok(client) => {
                    tracing::info!(node = %node_id, %addr, "dispatch client connected");
                    // A concurrent reconcile may have won the race; the
                    // newcomer then replaces it and the loser is closed.
                    if let Some(previous) = self.clients.write().insert(node_id, client) {
                        previous.close();
                    }
                }
                Err(err) => {
                    tracing::warn!(node = %node_id, %addr, %err, "dispatch client connect failed");
                }
            }
        }

        let live: HashSet<String> = addrs.iter().map(|addr| Self::node_id_for(addr)).collect();
        let removed: Vec<Arc<DispatchClient>> = {
            let mut clients = self.clients.write();
            let stale: Vec<String> = clients.keys().filter(|id| !live.contains(*id)).cloned().collect();
            stale.into_iter().filter_map(|id| clients.remove(&id)).collect()
        };
        for client in removed {
            client.close();
        }
    }

    /// Queue a producer broadcast on every live Connect-Node
    pub fn enqueue_broadcast(&self, frame: &Frame) {
        let clients = self.clients.read();
        for (node_id, client) in clients.iter() {
            let req = BroadcastReq {
                frame: frame.clone(),
                proto_op: frame.op,
            };
            match client.enqueue(req) {
                Ok(()) => {
                    tracing::debug!(node = %node_id, op = frame.op, "broadcast queued");
                }
                Err(err) => {
                    incr(&self.metrics.dispatch_dropped);
                    tracing::warn!(node = %node_id, %err, "broadcast queue full, dropped for node");
                }
            }
        }
    }

    /// Number of live dispatch clients
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Look up a dispatch client by node id
    pub fn client(&self, node_id: &str) -> Option<Arc<DispatchClient>> {
        self.clients.read().get(node_id).cloned()
    }

    /// Stop watching and close every dispatch client
    pub fn close(&self) {
        self.cancel.cancel();
        self.discovery.close();
        self.close_all_clients();
    }

    fn close_all_clients(&self) {
        let clients: Vec<Arc<DispatchClient>> = {
            let mut map = self.clients.write();
            map.drain().map(|(_, client)| client).collect()
        };
        // close() only flips tokens, so the whole set goes down together.
        for client in clients {
            client.close();
        }
    }
}

impl RpcHandler for PushManager {
    async fn handle(&self, method: &str, _params: serde_json::Value, frame: Option<Frame>) -> Result<Reply> {
        match method {
            METHOD_BROADCAST => {
                let frame = frame.ok_or(Error::BroadcastArg)?;
                self.enqueue_broadcast(&frame);
                Reply::json(&BroadcastReply::queued())
            }
            other => Err(Error::RpcRemote(format!("unknown method {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{endpoint_key, Endpoint, MemoryRegistry};
    use crate::protocol::frame::op;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    struct RecordingNode {
        frames: mpsc::UnboundedSender<Frame>,
    }

    impl RpcHandler for RecordingNode {
        async fn handle(&self, method: &str, _params: serde_json::Value, frame: Option<Frame>) -> Result<Reply> {
            assert_eq!(method, METHOD_BROADCAST);
            self.frames.send(frame.expect("broadcast carries a frame")).unwrap();
            Ok(Reply::empty())
        }
    }

    async fn spawn_node() -> (String, mpsc::UnboundedReceiver<Frame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(crate::rpc::serve(
            listener,
            Arc::new(RecordingNode { frames: tx }),
            MAX_MESSAGE_SIZE,
        ));
        (addr, rx)
    }

    async fn register_node(store: &MemoryRegistry, addr: &str) {
        store
            .put_with_lease(
                &endpoint_key(CONNECT_NODE_SERVICE, addr),
                &serde_json::to_string(&Endpoint {
                    op: 0,
                    addr: addr.to_string(),
                    metadata: None,
                })
                .unwrap(),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
    }

    async fn wait_for_clients(pm: &PushManager, count: usize) {
        for _ in 0..100 {
            if pm.client_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {count} dispatch clients, have {}", pm.client_count());
    }

    #[tokio::test]
    async fn test_add_event_creates_exactly_one_client() {
        let store = Arc::new(MemoryRegistry::new());
        let pm = PushManager::new("pm-1", Arc::clone(&store), Duration::from_secs(5), Arc::new(Metrics::new()))
            .await
            .unwrap();
        assert_eq!(pm.client_count(), 0);

        let (addr, _rx) = spawn_node().await;
        register_node(&store, &addr).await;
        wait_for_clients(&pm, 1).await;

        let first = pm.client(&PushManager::node_id_for(&addr)).unwrap();

        // A repeated ADD for the same address is a no-op.
        register_node(&store, &addr).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pm.client_count(), 1);
        let second = pm.client(&PushManager::node_id_for(&addr)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        pm.close();
    }

    #[tokio::test]
    async fn test_delete_event_closes_client() {
        let store = Arc::new(MemoryRegistry::new());
        let pm = PushManager::new("pm-1", Arc::clone(&store), Duration::from_secs(5), Arc::new(Metrics::new()))
            .await
            .unwrap();

        let (addr_a, mut rx_a) = spawn_node().await;
        let (addr_b, mut rx_b) = spawn_node().await;
        register_node(&store, &addr_a).await;
        register_node(&store, &addr_b).await;
        wait_for_clients(&pm, 2).await;

        let doomed = pm.client(&PushManager::node_id_for(&addr_a)).unwrap();
        store.delete(&endpoint_key(CONNECT_NODE_SERVICE, &addr_a)).await.unwrap();
        wait_for_clients(&pm, 1).await;
        assert!(doomed.is_closed());

        // Subsequent broadcasts reach only the survivor.
        let frame = Frame::new(op::PUSH_MSG, 1, "r1", "", Bytes::from_static(b"hi"));
        pm.enqueue_broadcast(&frame);

        let got = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .expect("survivor received broadcast")
            .unwrap();
        assert_eq!(&got.body[..], b"hi");
        assert!(rx_a.try_recv().is_err());

        pm.close();
    }

    #[tokio::test]
    async fn test_producer_broadcast_fans_out_to_all_nodes() {
        let store = Arc::new(MemoryRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let pm = PushManager::new("pm-1", Arc::clone(&store), Duration::from_secs(5), Arc::clone(&metrics))
            .await
            .unwrap();

        let (addr_a, mut rx_a) = spawn_node().await;
        let (addr_b, mut rx_b) = spawn_node().await;
        register_node(&store, &addr_a).await;
        register_node(&store, &addr_b).await;
        wait_for_clients(&pm, 2).await;

        // Through the producer-facing RPC surface.
        let reply = pm
            .handle(
                METHOD_BROADCAST,
                serde_json::Value::Null,
                Some(Frame::new(op::PUSH_MSG, 9, "r1", "", Bytes::from_static(b"fan"))),
            )
            .await
            .unwrap();
        let reply: BroadcastReply = serde_json::from_value(reply.body).unwrap();
        assert_eq!(reply.code, "0");

        for rx in [&mut rx_a, &mut rx_b] {
            let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("node received broadcast")
                .unwrap();
            assert_eq!(got.op, op::PUSH_MSG);
            assert_eq!(&got.body[..], b"fan");
        }

        pm.close();
    }

    #[tokio::test]
    async fn test_broadcast_without_frame_is_an_argument_error() {
        let store = Arc::new(MemoryRegistry::new());
        let pm = PushManager::new("pm-1", store, Duration::from_secs(5), Arc::new(Metrics::new()))
            .await
            .unwrap();
        let err = pm.handle(METHOD_BROADCAST, serde_json::Value::Null, None).await.unwrap_err();
        assert!(matches!(err, Error::BroadcastArg));
        pm.close();
    }
}
