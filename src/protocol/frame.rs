//! Frame type and operation codes
//!
//! A [`Frame`] is the wire unit of the client protocol. Bodies are `Bytes`,
//! so frames are cheap to clone and a broadcast can hand the same body to
//! thousands of sessions without copying.

use bytes::Bytes;

/// Protocol version emitted by this node
pub const PROTO_VERSION: u16 = 1;

/// Maximum body size accepted by the codec (4 KiB)
pub const MAX_BODY_SIZE: usize = 1 << 12;

/// Operation codes
pub mod op {
    /// Join a room (client → server)
    pub const JOIN_ROOM: i32 = 1;
    /// Join reply / server-pushed message (server → client)
    pub const PUSH_MSG: i32 = 2;
    /// Point-to-point user push (server → client)
    pub const USER_MSG: i32 = 3;
    /// Room broadcast (server → client)
    pub const ROOM_MSG: i32 = 4;
    /// Heartbeat (client → server)
    pub const HEARTBEAT: i32 = 5;
    /// Heartbeat reply (server → client)
    pub const HEARTBEAT_REPLY: i32 = 6;
    /// Authenticate the connection (client → server)
    pub const AUTH: i32 = 7;
    /// Reserved: internal ring-ready signal. Never on the wire.
    pub const PROTO_READY: i32 = 10;
    /// Reserved: internal session-finish signal. Never on the wire.
    pub const PROTO_FINISH: i32 = 11;
}

/// The wire unit of the protocol
///
/// Immutable once decoded. `body` may alias the session read buffer (see
/// [`FrameCodec`](crate::protocol::FrameCodec)); the alias is refcounted, so
/// holding a frame past its ring slot is safe and merely defers buffer
/// reuse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Protocol version
    pub ver: u16,
    /// Operation code
    pub op: i32,
    /// Client-assigned sequence number, echoed in replies
    pub seq: i32,
    /// Target room id; empty means "not room-scoped"
    pub room_id: String,
    /// Originating or target user id
    pub user_id: String,
    /// Payload
    pub body: Bytes,
}

impl Frame {
    /// Create a frame with the current protocol version
    pub fn new(op: i32, seq: i32, room_id: impl Into<String>, user_id: impl Into<String>, body: Bytes) -> Self {
        Self {
            ver: PROTO_VERSION,
            op,
            seq,
            room_id: room_id.into(),
            user_id: user_id.into(),
            body,
        }
    }

    /// Build the reply to a request frame: same ver/seq/ids, new op and body
    pub fn reply_to(&self, op: i32, body: Bytes) -> Self {
        Self {
            ver: self.ver,
            op,
            seq: self.seq,
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
            body,
        }
    }

    /// Heartbeat reply: echoes the sequence number with an empty body
    pub fn heartbeat_reply(&self) -> Self {
        self.reply_to(op::HEARTBEAT_REPLY, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_echoes_identity() {
        let req = Frame::new(op::JOIN_ROOM, 7, "r1", "u1", Bytes::from_static(b"alice"));
        let resp = req.reply_to(op::PUSH_MSG, Bytes::from_static(b"join room success"));

        assert_eq!(resp.ver, req.ver);
        assert_eq!(resp.op, op::PUSH_MSG);
        assert_eq!(resp.seq, 7);
        assert_eq!(resp.room_id, "r1");
        assert_eq!(resp.user_id, "u1");
        assert_eq!(&resp.body[..], b"join room success");
    }

    #[test]
    fn test_heartbeat_reply_empty_body() {
        let req = Frame::new(op::HEARTBEAT, 42, "", "", Bytes::new());
        let resp = req.heartbeat_reply();

        assert_eq!(resp.op, op::HEARTBEAT_REPLY);
        assert_eq!(resp.seq, 42);
        assert!(resp.body.is_empty());
    }
}
