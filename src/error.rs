//! Crate-wide error type
//!
//! One enum covers every failure kind the pipeline produces so that call
//! sites can propagate with `?` and match on the specific variant where the
//! policy differs (non-fatal stream underrun vs. malformed-peer rejects,
//! drop-and-continue queue errors vs. RPC argument errors).

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all pushrelay operations
#[derive(Debug, Error)]
pub enum Error {
    /// Not enough bytes buffered to decode a full frame. Non-fatal: the
    /// caller waits for more input and retries.
    #[error("not enough stream")]
    NotEnoughStream,

    /// Frame declared a pack length outside the allowed range, or a field
    /// overran the declared pack length. Malformed peer; fatal for the
    /// session.
    #[error("codec pack length error")]
    ProtoPackLen,

    /// Frame declared a header length other than the fixed header size.
    /// Malformed peer; fatal for the session.
    #[error("codec header length error")]
    ProtoHeaderLen,

    /// Inbound ring has no free slot; the frame is dropped.
    #[error("ring buffer full")]
    RingFull,

    /// Inbound ring has no pending frame.
    #[error("ring buffer empty")]
    RingEmpty,

    /// The channel's signal mailbox is full; the push is dropped.
    #[error("signal queue full, message dropped")]
    SignalFullMsgDropped,

    /// The channel has been closed; no further pushes are accepted.
    #[error("channel closed")]
    ChannelClosed,

    /// The room was removed while an operation was in flight.
    #[error("room closed")]
    RoomClosed,

    /// `PushMsg` called with no keys.
    #[error("push msg arguments error")]
    PushMsgArg,

    /// `Broadcast` called without a frame.
    #[error("broadcast arguments error")]
    BroadcastArg,

    /// `BroadcastRoom` called without a room id.
    #[error("broadcast room arguments error")]
    BroadcastRoomArg,

    /// The remote RPC peer returned an application error.
    #[error("rpc remote error: {0}")]
    RpcRemote(String),

    /// The RPC call did not complete within its deadline.
    #[error("rpc deadline exceeded")]
    RpcTimeout,

    /// The RPC connection is gone (closed or failed mid-call).
    #[error("rpc connection closed")]
    RpcClosed,

    /// A registry lease is unknown or already expired.
    #[error("registry lease not found")]
    LeaseNotFound,

    /// Configuration could not be loaded or parsed.
    #[error("config error: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
