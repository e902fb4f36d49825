//! Inter-service RPC
//!
//! The services talk to each other over a small framed protocol in the same
//! idiom as the client wire format: a length-prefixed packet carrying a JSON
//! envelope (call id, method, parameters) and an optional binary payload.
//! The payload, when present, is a [`Frame`] encoded with the client codec,
//! so broadcast bodies cross service boundaries without re-serialization
//! into JSON.
//!
//! ```text
//! [total_len:u32][hdr_len:u32][json envelope][frame payload]
//! ```
//!
//! One TCP connection multiplexes concurrent calls; responses are routed
//! back by call id. Every call carries a deadline.

pub mod api;
pub mod client;
pub mod controller;
pub mod server;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameCodec};

pub use client::RpcClient;
pub use controller::ControllerClient;
pub use server::{serve, Reply, RpcHandler};

/// Default cap on one RPC message (100 MB, sized for bulk broadcasts)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// JSON header of one RPC packet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Call id; responses echo the request's
    pub id: u64,
    /// Method name; present on requests only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request parameters or response result
    #[serde(default)]
    pub body: serde_json::Value,
    /// Application error; present on failed responses only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One request or response on the wire
#[derive(Debug, Clone)]
pub struct Message {
    pub envelope: Envelope,
    pub frame: Option<Frame>,
}

/// Encode a message into a single length-prefixed packet
pub fn encode_message(msg: &Message) -> Result<Bytes> {
    let header = serde_json::to_vec(&msg.envelope)?;
    let payload = match &msg.frame {
        Some(frame) => FrameCodec::write(frame)?,
        None => Bytes::new(),
    };

    let total = 4 + header.len() + payload.len();
    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32(total as u32);
    buf.put_u32(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Read one message from a stream
///
/// Returns `Ok(None)` on a clean end-of-stream between packets. `codec` is
/// the connection's payload decoder; its buffer is reused across messages.
pub async fn read_message<R>(reader: &mut R, codec: &mut FrameCodec, max_message: usize) -> Result<Option<Message>>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let total = u32::from_be_bytes(len_buf) as usize;
    if total < 4 || total > max_message {
        return Err(Error::ProtoPackLen);
    }

    let mut buf = vec![0u8; total];
    reader.read_exact(&mut buf).await?;

    let hdr_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if 4 + hdr_len > total {
        return Err(Error::ProtoHeaderLen);
    }
    let envelope: Envelope = serde_json::from_slice(&buf[4..4 + hdr_len])?;

    let payload = &buf[4 + hdr_len..];
    let frame = if payload.is_empty() {
        None
    } else {
        let (frame, _) = codec.read(payload)?;
        Some(frame)
    };

    Ok(Some(Message { envelope, frame }))
}

/// A payload decoder for one RPC connection
pub fn payload_codec() -> FrameCodec {
    FrameCodec::new(Buffer::new(crate::protocol::codec::MAX_PACK_SIZE))
}
