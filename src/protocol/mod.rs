//! Client wire protocol
//!
//! Frames are length-prefixed binary packets exchanged over WebSocket binary
//! messages. The codec reads into a session-pinned buffer so that frame
//! bodies can alias it without a per-message copy.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{Frame, MAX_BODY_SIZE, PROTO_VERSION};
