//! Node and dispatcher counters
//!
//! Every bounded queue in the pipeline follows the same policy when it
//! cannot accept: drop, log, and tick a counter here. The counters are plain
//! atomics shared behind an `Arc`; exporting them is wiring left to the
//! embedding service.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one node or dispatcher process
#[derive(Debug, Default)]
pub struct Metrics {
    /// Sessions accepted
    pub sessions_opened: AtomicU64,
    /// Sessions torn down
    pub sessions_closed: AtomicU64,
    /// Frames decoded from clients
    pub frames_in: AtomicU64,
    /// Frames written to clients
    pub frames_out: AtomicU64,
    /// Inbound frames dropped because a session ring was full
    pub ring_dropped: AtomicU64,
    /// Pushes dropped because a channel signal mailbox was full
    pub signal_dropped: AtomicU64,
    /// Pushes delivered into channel mailboxes by broadcasts
    pub broadcast_pushed: AtomicU64,
    /// Room broadcasts dropped because a bucket worker mailbox was full
    pub room_broadcast_dropped: AtomicU64,
    /// Broadcast requests dropped because a dispatch-client queue was full
    pub dispatch_dropped: AtomicU64,
    /// Peer RPC calls that failed or timed out
    pub rpc_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            ring_dropped: self.ring_dropped.load(Ordering::Relaxed),
            signal_dropped: self.signal_dropped.load(Ordering::Relaxed),
            broadcast_pushed: self.broadcast_pushed.load(Ordering::Relaxed),
            room_broadcast_dropped: self.room_broadcast_dropped.load(Ordering::Relaxed),
            dispatch_dropped: self.dispatch_dropped.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data view of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub ring_dropped: u64,
    pub signal_dropped: u64,
    pub broadcast_pushed: u64,
    pub room_broadcast_dropped: u64,
    pub dispatch_dropped: u64,
    pub rpc_failures: u64,
}

/// Bump a counter by one
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let m = Metrics::new();
        incr(&m.frames_in);
        incr(&m.frames_in);
        incr(&m.signal_dropped);

        let snap = m.snapshot();
        assert_eq!(snap.frames_in, 2);
        assert_eq!(snap.signal_dropped, 1);
        assert_eq!(snap.frames_out, 0);
    }
}
