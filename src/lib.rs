//! # pushrelay
//!
//! Horizontally-scaled pub/sub push infrastructure. A **Connect-Node**
//! terminates large numbers of persistent WebSocket sessions, shards them
//! into lock-striped buckets and fans server-originated pushes out to rooms
//! of subscribers. A **Push-Manager** discovers every live Connect-Node
//! through a watch-capable registry and broadcasts producer messages to all
//! of them through per-node worker pools. Room membership is authoritative
//! in an external Controller, consulted once per join.
//!
//! The hot path is allocation-shy and never blocks on a slow consumer:
//! inbound frames are staged on a per-session SPSC ring whose bodies alias
//! the session's pooled read buffer, and every bounded queue in the
//! delivery path drops (with a log line and a counter) instead of applying
//! backpressure.
//!
//! ## Quick tour
//!
//! - [`protocol`] — the length-prefixed wire format and its codec
//! - [`buffer`] — the slab pool sessions pin their read buffers from
//! - [`ring`] — the per-session inbound SPSC ring
//! - [`bucket`] — channels, rooms and the sharded registry
//! - [`server`] — the Connect-Node facade, listener and session loop
//! - [`rpc`] — the framed inter-service RPC layer
//! - [`discovery`] — registry watcher and endpoint registration
//! - [`dispatch`] — the Push-Manager fan-out core

pub mod bucket;
pub mod buffer;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod ring;
pub mod rpc;
pub mod server;
pub mod stats;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::{Frame, FrameCodec};
pub use server::{listener::NodeListener, NodeServer};
