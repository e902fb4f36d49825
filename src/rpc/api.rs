//! RPC method names and parameter/reply shapes
//!
//! Frames never appear in these structs; they travel as the packet's binary
//! payload next to the JSON parameters.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Connect-Node: push a frame to specific session keys
pub const METHOD_PUSH_MSG: &str = "PushMsg";
/// Connect-Node: push a frame to every subscribed session
pub const METHOD_BROADCAST: &str = "Broadcast";
/// Connect-Node: push a frame to one room
pub const METHOD_BROADCAST_ROOM: &str = "BroadcastRoom";
/// Connect-Node: list non-empty rooms
pub const METHOD_ROOMS: &str = "Rooms";
/// Controller: record a user joining a room
pub const METHOD_JOIN_ROOM: &str = "JoinRoom";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMsgParams {
    pub keys: Vec<String>,
    pub proto_op: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastParams {
    pub proto_op: i32,
    /// Optional throttle: buckets-per-second pacing for the fan-out walk
    #[serde(default)]
    pub speed: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRoomParams {
    pub room_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsReply {
    pub rooms: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomParams {
    pub user_id: String,
    pub user_name: String,
    pub room_id: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomReply {
    pub success: bool,
    pub message: String,
}

/// Reply to a producer's broadcast request; `code` is `"0"` once the
/// message has been queued for every live node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastReply {
    pub code: String,
    pub msg: String,
    pub desc: String,
}

impl BroadcastReply {
    pub fn queued() -> Self {
        Self {
            code: "0".into(),
            msg: "OK".into(),
            desc: "message queued for push".into(),
        }
    }
}
