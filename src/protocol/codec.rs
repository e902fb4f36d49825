//! Length-prefixed binary frame codec
//!
//! Wire format (all integers big-endian):
//!
//! ```text
//! [pack_len:u32][header_len:u16][ver:u16][op:i32][seq:i32]
//! [room_id_len:u16][room_id:bytes]
//! [user_id_len:u16][user_id:bytes]
//! [body:bytes]
//! ```
//!
//! The fixed header is 16 bytes and `header_len` must say so. `pack_len`
//! covers the whole packet and is capped at the fixed header plus
//! [`MAX_BODY_SIZE`].
//!
//! Reads stage the packet in a session-pinned [`Buffer`] and freeze it, so
//! the returned frame's body is a refcounted slice of that buffer rather
//! than a fresh allocation. The buffer is reclaimed for the next read as
//! soon as the previous frame's body has been dropped; a consumer that
//! retains the body merely keeps that one region alive. Writes allocate
//! exactly the encoded length and never touch the read pool: the outbound
//! path is bursty and producer-owned buffers would pin the pool.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::protocol::frame::{Frame, MAX_BODY_SIZE};

const PACK_SIZE: usize = 4;
const HEADER_SIZE: usize = 2;
const VER_SIZE: usize = 2;
const OP_SIZE: usize = 4;
const SEQ_SIZE: usize = 4;
const STR_LEN_SIZE: usize = 2;

/// Size of the fixed header (pack len + header len + ver + op + seq)
pub const RAW_HEADER_SIZE: usize = PACK_SIZE + HEADER_SIZE + VER_SIZE + OP_SIZE + SEQ_SIZE;

/// Largest packet the codec accepts
pub const MAX_PACK_SIZE: usize = RAW_HEADER_SIZE + MAX_BODY_SIZE;

const PACK_OFFSET: usize = 0;
const HEADER_OFFSET: usize = PACK_OFFSET + PACK_SIZE;
const VER_OFFSET: usize = HEADER_OFFSET + HEADER_SIZE;
const OP_OFFSET: usize = VER_OFFSET + VER_SIZE;
const SEQ_OFFSET: usize = OP_OFFSET + OP_SIZE;
const ROOM_OFFSET: usize = SEQ_OFFSET + SEQ_SIZE;

fn be_u16(window: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([window[at], window[at + 1]])
}

fn be_u32(window: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([window[at], window[at + 1], window[at + 2], window[at + 3]])
}

/// Per-session frame decoder holding the pinned read buffer
#[derive(Debug)]
pub struct FrameCodec {
    read_buf: Buffer,
}

impl FrameCodec {
    /// Wrap a buffer acquired from the session's read pool
    pub fn new(read_buf: Buffer) -> Self {
        Self { read_buf }
    }

    /// Recover the read buffer so the session can return it to its pool
    pub fn into_buffer(self) -> Buffer {
        self.read_buf
    }

    /// Decode one frame from the front of `data`
    ///
    /// Returns the frame and the number of bytes consumed. On
    /// [`Error::NotEnoughStream`] nothing has been consumed and the caller
    /// should retry once more bytes arrive; any other error means the peer
    /// sent a malformed packet and the session should close.
    pub fn read(&mut self, data: &[u8]) -> Result<(Frame, usize)> {
        if data.len() < RAW_HEADER_SIZE {
            return Err(Error::NotEnoughStream);
        }

        let pack_len = be_u32(data, PACK_OFFSET) as usize;
        if !(RAW_HEADER_SIZE..=MAX_PACK_SIZE).contains(&pack_len) {
            return Err(Error::ProtoPackLen);
        }
        if data.len() < pack_len {
            return Err(Error::NotEnoughStream);
        }

        // Stage the packet in the session buffer and freeze it; every field
        // below reads from the frozen window and the body aliases it.
        let buf = self.read_buf.bytes_mut();
        buf.clear();
        buf.extend_from_slice(&data[..pack_len]);
        let window = buf.split().freeze();

        if be_u16(&window, HEADER_OFFSET) as usize != RAW_HEADER_SIZE {
            return Err(Error::ProtoHeaderLen);
        }

        let ver = be_u16(&window, VER_OFFSET);
        let op = be_u32(&window, OP_OFFSET) as i32;
        let seq = be_u32(&window, SEQ_OFFSET) as i32;

        let (room_id, user_off) = Self::read_str(&window, ROOM_OFFSET, pack_len)?;
        let (user_id, body_off) = Self::read_str(&window, user_off, pack_len)?;

        let body = if body_off < pack_len {
            window.slice(body_off..pack_len)
        } else {
            Bytes::new()
        };

        let frame = Frame {
            ver,
            op,
            seq,
            room_id,
            user_id,
            body,
        };
        Ok((frame, pack_len))
    }

    // A length-prefixed string field. Overrunning the declared pack length
    // is a framing error, not an underrun: the full packet is present.
    fn read_str(window: &Bytes, at: usize, pack_len: usize) -> Result<(String, usize)> {
        if at + STR_LEN_SIZE > pack_len {
            return Err(Error::ProtoPackLen);
        }
        let len = be_u16(window, at) as usize;
        let end = at + STR_LEN_SIZE + len;
        if end > pack_len {
            return Err(Error::ProtoPackLen);
        }
        let s = String::from_utf8_lossy(&window[at + STR_LEN_SIZE..end]).into_owned();
        Ok((s, end))
    }

    /// Encoded size of a frame
    pub fn encoded_len(frame: &Frame) -> usize {
        RAW_HEADER_SIZE + STR_LEN_SIZE + frame.room_id.len() + STR_LEN_SIZE + frame.user_id.len() + frame.body.len()
    }

    /// Encode a frame into a freshly allocated buffer of exactly the
    /// encoded length
    pub fn write(frame: &Frame) -> Result<Bytes> {
        if frame.body.len() > MAX_BODY_SIZE
            || frame.room_id.len() > u16::MAX as usize
            || frame.user_id.len() > u16::MAX as usize
        {
            return Err(Error::ProtoPackLen);
        }

        let pack_len = Self::encoded_len(frame);
        let mut buf = BytesMut::with_capacity(pack_len);
        buf.put_u32(pack_len as u32);
        buf.put_u16(RAW_HEADER_SIZE as u16);
        buf.put_u16(frame.ver);
        buf.put_i32(frame.op);
        buf.put_i32(frame.seq);
        buf.put_u16(frame.room_id.len() as u16);
        buf.put_slice(frame.room_id.as_bytes());
        buf.put_u16(frame.user_id.len() as u16);
        buf.put_slice(frame.user_id.as_bytes());
        buf.put_slice(&frame.body);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::op;

    fn codec() -> FrameCodec {
        FrameCodec::new(Buffer::new(8192))
    }

    fn sample() -> Frame {
        Frame::new(op::JOIN_ROOM, 1, "r1", "u1", Bytes::from_static(b"alice"))
    }

    #[test]
    fn test_round_trip() {
        let frame = sample();
        let wire = FrameCodec::write(&frame).unwrap();
        assert_eq!(wire.len(), FrameCodec::encoded_len(&frame));

        let (decoded, consumed) = codec().read(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_round_trip_empty_fields() {
        let frame = Frame::new(op::HEARTBEAT, 42, "", "", Bytes::new());
        let wire = FrameCodec::write(&frame).unwrap();

        let (decoded, consumed) = codec().read(&wire).unwrap();
        assert_eq!(consumed, RAW_HEADER_SIZE + 2 * STR_LEN_SIZE);
        assert_eq!(decoded, frame);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_round_trip_max_body() {
        let frame = Frame::new(op::PUSH_MSG, 3, "", "", Bytes::from(vec![0xAB; MAX_BODY_SIZE]));
        let wire = FrameCodec::write(&frame).unwrap();
        let (decoded, _) = codec().read(&wire).unwrap();
        assert_eq!(decoded.body.len(), MAX_BODY_SIZE);
    }

    #[test]
    fn test_write_rejects_oversized_body() {
        let frame = Frame::new(op::PUSH_MSG, 0, "", "", Bytes::from(vec![0; MAX_BODY_SIZE + 1]));
        assert!(matches!(FrameCodec::write(&frame), Err(Error::ProtoPackLen)));
    }

    #[test]
    fn test_short_input_consumes_nothing() {
        let frame = sample();
        let wire = FrameCodec::write(&frame).unwrap();
        let mut c = codec();

        // Less than a fixed header.
        assert!(matches!(c.read(&wire[..8]), Err(Error::NotEnoughStream)));
        // Full header but truncated body.
        assert!(matches!(c.read(&wire[..wire.len() - 1]), Err(Error::NotEnoughStream)));
        // The same codec still decodes the full packet afterwards.
        let (decoded, _) = c.read(&wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_rejects_bad_header_len() {
        let frame = sample();
        let mut wire = BytesMut::from(&FrameCodec::write(&frame).unwrap()[..]);
        wire[HEADER_OFFSET..HEADER_OFFSET + 2].copy_from_slice(&20u16.to_be_bytes());
        assert!(matches!(codec().read(&wire), Err(Error::ProtoHeaderLen)));
    }

    #[test]
    fn test_rejects_bad_pack_len() {
        let frame = sample();
        let wire = FrameCodec::write(&frame).unwrap();

        // Too large.
        let mut big = BytesMut::from(&wire[..]);
        big[PACK_OFFSET..PACK_OFFSET + 4].copy_from_slice(&((MAX_PACK_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(codec().read(&big), Err(Error::ProtoPackLen)));

        // Smaller than the fixed header.
        let mut small = BytesMut::from(&wire[..]);
        small[PACK_OFFSET..PACK_OFFSET + 4].copy_from_slice(&8u32.to_be_bytes());
        assert!(matches!(codec().read(&small), Err(Error::ProtoPackLen)));
    }

    #[test]
    fn test_rejects_field_overrun() {
        let frame = Frame::new(op::JOIN_ROOM, 1, "room", "", Bytes::new());
        let mut wire = BytesMut::from(&FrameCodec::write(&frame).unwrap()[..]);
        // Claim the room id extends past the declared pack length.
        wire[ROOM_OFFSET..ROOM_OFFSET + 2].copy_from_slice(&1024u16.to_be_bytes());
        assert!(matches!(codec().read(&wire), Err(Error::ProtoPackLen)));
    }

    #[test]
    fn test_consumes_one_packet_from_stream() {
        let first = sample();
        let second = Frame::new(op::HEARTBEAT, 2, "", "", Bytes::new());
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&FrameCodec::write(&first).unwrap());
        stream.extend_from_slice(&FrameCodec::write(&second).unwrap());

        let mut c = codec();
        let (a, used) = c.read(&stream).unwrap();
        assert_eq!(a, first);
        let (b, used2) = c.read(&stream[used..]).unwrap();
        assert_eq!(b, second);
        assert_eq!(used + used2, stream.len());
    }
}
