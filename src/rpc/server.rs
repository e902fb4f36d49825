//! RPC server side
//!
//! Accepts connections and dispatches each request packet to the service's
//! [`RpcHandler`]. Requests on one connection are handled concurrently; the
//! per-connection writer task serializes responses back onto the stream.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::Frame;
use crate::rpc::{encode_message, payload_codec, read_message, Envelope, Message};

/// A successful RPC result: a JSON body plus an optional frame payload
#[derive(Debug, Default)]
pub struct Reply {
    pub body: serde_json::Value,
    pub frame: Option<Frame>,
}

impl Reply {
    /// Empty-bodied success
    pub fn empty() -> Self {
        Self::default()
    }

    /// Serialize a typed reply body
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            body: serde_json::to_value(value)?,
            frame: None,
        })
    }
}

/// Service entry point for incoming RPCs
pub trait RpcHandler: Send + Sync + 'static {
    /// Handle one request; an `Err` is reported to the caller as an
    /// application error without closing the connection
    fn handle(
        &self,
        method: &str,
        params: serde_json::Value,
        frame: Option<Frame>,
    ) -> impl Future<Output = Result<Reply>> + Send;
}

/// Accept loop: serve `handler` on `listener` until the listener fails
pub async fn serve<H: RpcHandler>(listener: TcpListener, handler: Arc<H>, max_message: usize) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "rpc connection accepted");
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, handler, max_message).await {
                        tracing::debug!(peer = %peer, %err, "rpc connection ended");
                    }
                });
            }
            Err(err) => {
                tracing::error!(%err, "rpc accept failed");
            }
        }
    }
}

async fn serve_connection<H: RpcHandler>(stream: TcpStream, handler: Arc<H>, max_message: usize) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(256);
    let writer = tokio::spawn(async move {
        while let Some(packet) = write_rx.recv().await {
            if write_half.write_all(&packet).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut codec = payload_codec();
    while let Some(request) = read_message(&mut read_half, &mut codec, max_message).await? {
        let handler = Arc::clone(&handler);
        let write_tx = write_tx.clone();
        tokio::spawn(async move {
            let response = dispatch(&*handler, request).await;
            match encode_message(&response) {
                Ok(packet) => {
                    let _ = write_tx.send(packet).await;
                }
                Err(err) => {
                    tracing::error!(%err, "rpc response encode failed");
                }
            }
        });
    }

    drop(write_tx);
    let _ = writer.await;
    Ok(())
}

async fn dispatch<H: RpcHandler>(handler: &H, request: Message) -> Message {
    let id = request.envelope.id;
    let method = request.envelope.method.unwrap_or_default();
    let result = handler.handle(&method, request.envelope.body, request.frame).await;

    match result {
        Ok(reply) => Message {
            envelope: Envelope {
                id,
                method: None,
                body: reply.body,
                error: None,
            },
            frame: reply.frame,
        },
        Err(err) => Message {
            envelope: Envelope {
                id,
                method: None,
                body: serde_json::Value::Null,
                error: Some(err.to_string()),
            },
            frame: None,
        },
    }
}
