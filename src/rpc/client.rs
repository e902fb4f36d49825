//! Multiplexing RPC client
//!
//! One TCP connection, any number of concurrent calls. A background writer
//! task serializes outbound packets; a background reader task routes
//! responses to per-call oneshot channels by call id. Calls carry a
//! deadline; a timed-out call abandons its slot and the eventual response
//! (if any) is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::rpc::{encode_message, payload_codec, read_message, Envelope, Message};

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Message>>>;

struct Shared {
    addr: String,
    pending: PendingMap,
    next_id: AtomicU64,
    write_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Handle to one RPC connection; cheap to clone
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

impl RpcClient {
    /// Connect and spawn the connection's reader and writer tasks
    pub async fn connect(addr: &str, max_message: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel::<Bytes>(256);
        let shared = Arc::new(Shared {
            addr: addr.to_string(),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(write_loop(write_half, write_rx, shared.cancel.clone()));
        tokio::spawn(read_loop(read_half, Arc::clone(&shared), max_message));

        Ok(Self { shared })
    }

    /// Peer address this client talks to
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Issue a call and wait for its response within `timeout`
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        frame: Option<&Frame>,
        timeout: Duration,
    ) -> Result<Message> {
        if self.is_closed() {
            return Err(Error::RpcClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let request = Message {
            envelope: Envelope {
                id,
                method: Some(method.to_string()),
                body: params,
                error: None,
            },
            frame: frame.cloned(),
        };
        let packet = match encode_message(&request) {
            Ok(packet) => packet,
            Err(err) => {
                self.shared.pending.lock().remove(&id);
                return Err(err);
            }
        };
        if self.shared.write_tx.send(packet).await.is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(Error::RpcClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(Error::RpcTimeout)
            }
            Ok(Err(_)) => Err(Error::RpcClosed),
            Ok(Ok(msg)) => match msg.envelope.error {
                Some(err) => Err(Error::RpcRemote(err)),
                None => Ok(msg),
            },
        }
    }

    /// Typed call: serialize params, deserialize the reply body
    pub async fn call_api<P, R>(
        &self,
        method: &str,
        params: &P,
        frame: Option<&Frame>,
        timeout: Duration,
    ) -> Result<(R, Option<Frame>)>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let msg = self
            .call(method, serde_json::to_value(params)?, frame, timeout)
            .await?;
        let reply = serde_json::from_value(msg.envelope.body)?;
        Ok((reply, msg.frame))
    }

    /// Tear the connection down; in-flight calls fail with
    /// [`Error::RpcClosed`]
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => {
                    if let Err(err) = write_half.write_all(&packet).await {
                        tracing::debug!(%err, "rpc write failed");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(mut read_half: OwnedReadHalf, shared: Arc<Shared>, max_message: usize) {
    let mut codec = payload_codec();
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = read_message(&mut read_half, &mut codec, max_message) => match msg {
                Ok(Some(msg)) => {
                    let waiter = shared.pending.lock().remove(&msg.envelope.id);
                    match waiter {
                        // A timed-out caller has already given up its slot.
                        Some(tx) => {
                            let _ = tx.send(msg);
                        }
                        None => {
                            tracing::debug!(addr = %shared.addr, id = msg.envelope.id, "response for abandoned call");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(addr = %shared.addr, %err, "rpc read failed");
                    break;
                }
            },
        }
    }
    shared.cancel.cancel();
    // Waiters see the dropped sender as a closed connection.
    shared.pending.lock().clear();
}
