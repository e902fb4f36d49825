//! Per-session channel state
//!
//! A [`Channel`] is the shared face of one client session: the subscription
//! set broadcasts filter on, the bounded signal mailbox everything outbound
//! funnels through, and the back-reference to the room the session joined.
//! The consumable halves (inbound ring consumer, signal receiver) are split
//! off at construction and moved into the session's dispatcher task, which
//! is the mailbox's only reader.
//!
//! The mailbox carries a tagged [`Signal`]: `Ready` wakes the dispatcher to
//! drain the inbound ring, `Push` carries a server-originated frame to write
//! out. Session termination is a cancellation token rather than a third
//! variant so that closing can never be lost to a full mailbox and never
//! blocks the closer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bucket::room::Room;
use crate::error::{Error, Result};
use crate::protocol::Frame;
use crate::ring::{ring, RingConsumer, RingProducer};

/// Message on a channel's signal mailbox
#[derive(Debug)]
pub enum Signal {
    /// The inbound ring has published frames
    Ready,
    /// A server-originated frame to deliver to the client
    Push(Frame),
}

static NEXT_CID: AtomicU64 = AtomicU64::new(1);

/// Shared per-session state
#[derive(Debug)]
pub struct Channel {
    cid: u64,
    /// Routing key (the authenticated user id)
    pub key: String,
    /// Remote peer address, for per-IP accounting
    pub ip: String,
    /// Numeric member id, when the business layer assigns one
    pub mid: i64,
    watch_ops: RwLock<HashSet<i32>>,
    signal: mpsc::Sender<Signal>,
    room: RwLock<Option<Arc<Room>>>,
    closed: CancellationToken,
}

/// Endpoints handed to the session tasks at construction
pub struct ChannelParts {
    /// Inbound ring, writer half (reader task)
    pub ring_tx: RingProducer,
    /// Inbound ring, reader half (dispatcher task)
    pub ring_rx: RingConsumer,
    /// Signal mailbox receiver (dispatcher task)
    pub signal_rx: mpsc::Receiver<Signal>,
}

impl Channel {
    /// Create a channel with an inbound ring of `cli_proto` slots and a
    /// signal mailbox of `svr_proto` entries
    pub fn new(
        key: impl Into<String>,
        ip: impl Into<String>,
        mid: i64,
        cli_proto: usize,
        svr_proto: usize,
    ) -> (Arc<Self>, ChannelParts) {
        let (ring_tx, ring_rx) = ring(cli_proto);
        let (signal_tx, signal_rx) = mpsc::channel(svr_proto.max(1));

        let ch = Arc::new(Self {
            cid: NEXT_CID.fetch_add(1, Ordering::Relaxed),
            key: key.into(),
            ip: ip.into(),
            mid,
            watch_ops: RwLock::new(HashSet::new()),
            signal: signal_tx,
            room: RwLock::new(None),
            closed: CancellationToken::new(),
        });
        (
            ch,
            ChannelParts {
                ring_tx,
                ring_rx,
                signal_rx,
            },
        )
    }

    /// Process-unique channel id; rooms key their member maps on it
    pub fn cid(&self) -> u64 {
        self.cid
    }

    /// Subscribe to the given operation codes
    pub fn watch(&self, ops: &[i32]) {
        let mut set = self.watch_ops.write();
        for op in ops {
            set.insert(*op);
        }
    }

    /// Unsubscribe from the given operation codes
    pub fn unwatch(&self, ops: &[i32]) {
        let mut set = self.watch_ops.write();
        for op in ops {
            set.remove(op);
        }
    }

    /// Whether a broadcast with this op should reach the session
    pub fn need_push(&self, op: i32) -> bool {
        self.watch_ops.read().contains(&op)
    }

    /// Queue a server-originated frame for delivery
    ///
    /// Non-blocking: a full mailbox drops the frame with
    /// [`Error::SignalFullMsgDropped`] so broadcast paths never stall on a
    /// slow consumer.
    pub fn push(&self, frame: Frame) -> Result<()> {
        match self.signal.try_send(Signal::Push(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::SignalFullMsgDropped),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ChannelClosed),
        }
    }

    /// Wake the dispatcher: the inbound ring has published frames
    ///
    /// Called by the session reader after `set_adv`; the awaited send is the
    /// happens-before edge pairing with the dispatcher's ring reads.
    pub async fn signal_ready(&self) {
        // Err means the dispatcher is gone; the session is tearing down.
        let _ = self.signal.send(Signal::Ready).await;
    }

    /// Terminate the session. Idempotent and never blocks; the dispatcher
    /// observes the cancellation even when the mailbox is full.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token the session tasks select on for termination
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Room this channel currently belongs to
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.read().clone()
    }

    pub(crate) fn set_room(&self, room: Option<Arc<Room>>) {
        *self.room.write() = room;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::op;
    use bytes::Bytes;

    fn push_frame(seq: i32) -> Frame {
        Frame::new(op::PUSH_MSG, seq, "r1", "", Bytes::from_static(b"hi"))
    }

    #[test]
    fn test_watch_unwatch() {
        let (ch, _parts) = Channel::new("u1", "127.0.0.1", 0, 4, 4);
        assert!(!ch.need_push(op::PUSH_MSG));

        ch.watch(&[op::PUSH_MSG, op::ROOM_MSG]);
        assert!(ch.need_push(op::PUSH_MSG));
        assert!(ch.need_push(op::ROOM_MSG));

        ch.unwatch(&[op::ROOM_MSG]);
        assert!(!ch.need_push(op::ROOM_MSG));
        assert!(ch.need_push(op::PUSH_MSG));
    }

    #[tokio::test]
    async fn test_push_drops_when_mailbox_full() {
        let (ch, mut parts) = Channel::new("u1", "127.0.0.1", 0, 4, 2);

        ch.push(push_frame(1)).unwrap();
        ch.push(push_frame(2)).unwrap();
        // Third push finds the mailbox full and is dropped, not blocked.
        assert!(matches!(ch.push(push_frame(3)), Err(Error::SignalFullMsgDropped)));

        // The queued pushes are still delivered in order.
        match parts.signal_rx.recv().await.unwrap() {
            Signal::Push(f) => assert_eq!(f.seq, 1),
            other => panic!("unexpected signal: {other:?}"),
        }
        match parts.signal_rx.recv().await.unwrap() {
            Signal::Push(f) => assert_eq!(f.seq, 2),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_observable_and_idempotent() {
        let (ch, _parts) = Channel::new("u1", "127.0.0.1", 0, 4, 2);
        assert!(!ch.is_closed());

        ch.close();
        ch.close();
        assert!(ch.is_closed());
        ch.close_token().cancelled().await;
    }

    #[tokio::test]
    async fn test_ready_wakes_consumer() {
        let (ch, mut parts) = Channel::new("u1", "127.0.0.1", 0, 4, 2);
        ch.signal_ready().await;
        assert!(matches!(parts.signal_rx.recv().await, Some(Signal::Ready)));
    }
}
