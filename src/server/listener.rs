//! WebSocket accept loop
//!
//! Binds the node's client-facing address, enforces the session cap and
//! spawns one [`session`](crate::server::session) per connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::server::{session, NodeServer};

/// Client listener for one Connect-Node
pub struct NodeListener {
    listener: TcpListener,
    server: Arc<NodeServer>,
    next_session_id: AtomicU64,
    session_semaphore: Option<Arc<Semaphore>>,
}

impl NodeListener {
    /// Bind the configured WebSocket address
    pub async fn bind(server: Arc<NodeServer>) -> Result<Self> {
        let cfg = &server.config().websocket;
        let listener = TcpListener::bind(cfg.bind_addr()).await?;
        tracing::info!(addr = %listener.local_addr()?, path = %cfg.path, "websocket listener bound");

        let session_semaphore = if cfg.session_number > 0 {
            Some(Arc::new(Semaphore::new(cfg.session_number)))
        } else {
            None
        };

        Ok(Self {
            listener,
            server,
            next_session_id: AtomicU64::new(1),
            session_semaphore,
        })
    }

    /// Address the listener actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept sessions until the listener fails
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    continue;
                }
            };

            let permit = match &self.session_semaphore {
                Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        tracing::warn!(peer = %peer, "connection rejected: session limit reached");
                        continue;
                    }
                },
                None => None,
            };

            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, %err, "set_nodelay failed");
            }

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                let _permit = permit;
                session::serve(server, stream, peer, session_id).await;
            });
        }
    }
}
