//! Sharded channel/room registry
//!
//! A node splits its sessions across a fixed array of [`Bucket`]s so that
//! registry writes contend on one shard instead of one global lock. Each
//! bucket owns three maps guarded by a single reader-writer lock (channels
//! by key, rooms by id, connection counts by peer IP) and a small pool of
//! long-lived room-broadcast workers fed through bounded mailboxes.

pub mod channel;
pub mod room;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::BucketConfig;
use crate::protocol::Frame;
use crate::stats::{incr, Metrics};

pub use channel::{Channel, ChannelParts, Signal};
pub use room::Room;

/// A room broadcast queued onto a bucket worker
#[derive(Debug)]
pub struct BroadcastRoomReq {
    pub room_id: String,
    pub frame: Frame,
}

#[derive(Debug, Default)]
struct Inner {
    chs: HashMap<String, Arc<Channel>>,
    rooms: HashMap<String, Arc<Room>>,
    ip_cnts: HashMap<String, i32>,
}

/// One shard of the session registry
#[derive(Debug)]
pub struct Bucket {
    inner: RwLock<Inner>,
    routines: Vec<mpsc::Sender<BroadcastRoomReq>>,
    routine_num: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Bucket {
    /// Create the bucket and spawn its room-broadcast workers
    pub fn new(cfg: &BucketConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        let mut routines = Vec::with_capacity(cfg.routine_amount);
        let mut receivers = Vec::with_capacity(cfg.routine_amount);
        for _ in 0..cfg.routine_amount.max(1) {
            let (tx, rx) = mpsc::channel(cfg.routine_size.max(1));
            routines.push(tx);
            receivers.push(rx);
        }

        let bucket = Arc::new(Self {
            inner: RwLock::new(Inner {
                chs: HashMap::with_capacity(cfg.channel),
                rooms: HashMap::with_capacity(cfg.room),
                ip_cnts: HashMap::new(),
            }),
            routines,
            routine_num: AtomicU64::new(0),
            metrics,
        });

        for rx in receivers {
            tokio::spawn(Self::room_proc(Arc::downgrade(&bucket), rx));
        }
        bucket
    }

    /// Register a channel, evicting any previous session with the same key
    ///
    /// The evicted channel is closed, which is what makes the newest login
    /// win: its dispatcher observes the cancellation and tears down. With a
    /// non-empty `room_id` the channel also joins (creating if needed) that
    /// room.
    pub fn put(&self, room_id: &str, ch: &Arc<Channel>) {
        {
            let mut inner = self.inner.write();
            if let Some(old) = inner.chs.insert(ch.key.clone(), Arc::clone(ch)) {
                if !Arc::ptr_eq(&old, ch) {
                    tracing::debug!(key = %ch.key, "evicting replaced session");
                    old.close();
                }
            }
            *inner.ip_cnts.entry(ch.ip.clone()).or_insert(0) += 1;
        }
        if !room_id.is_empty() {
            self.attach_room(room_id, ch);
        }
    }

    /// Remove a channel if it is still the registered session for its key,
    /// and leave its room
    pub fn del(&self, ch: &Arc<Channel>) {
        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.chs.get(&ch.key) {
                if Arc::ptr_eq(existing, ch) {
                    inner.chs.remove(&ch.key);
                }
                // The replaced predecessor still owned one connection from
                // this IP.
                match inner.ip_cnts.get_mut(&ch.ip) {
                    Some(n) if *n > 1 => *n -= 1,
                    Some(_) => {
                        inner.ip_cnts.remove(&ch.ip);
                    }
                    None => {}
                }
            }
        }
        if let Some(room) = ch.room() {
            if room.del(ch) {
                self.del_room(&room);
            }
            ch.set_room(None);
        }
    }

    /// Move a channel to another room; an empty id just leaves the current
    /// room
    pub fn change_room(&self, new_room_id: &str, ch: &Arc<Channel>) {
        let original = ch.room();
        if let Some(room) = original {
            if room.del(ch) {
                self.del_room(&room);
            }
            ch.set_room(None);
        }
        if !new_room_id.is_empty() {
            self.attach_room(new_room_id, ch);
        }
    }

    // Join a room, creating it if absent. Retries when it loses the race
    // with an empty-room removal: the tombstoned room rejects the put and a
    // fresh one replaces it.
    fn attach_room(&self, room_id: &str, ch: &Arc<Channel>) {
        loop {
            let room = {
                let mut inner = self.inner.write();
                match inner.rooms.get(room_id) {
                    Some(room) if !room.is_closed() => Arc::clone(room),
                    _ => {
                        let room = Arc::new(Room::new(room_id));
                        inner.rooms.insert(room_id.to_string(), Arc::clone(&room));
                        room
                    }
                }
            };
            if room.put(ch).is_ok() {
                ch.set_room(Some(room));
                return;
            }
        }
    }

    /// Drop a room that emptied; tolerates a newer room already occupying
    /// the id
    pub fn del_room(&self, room: &Arc<Room>) {
        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.rooms.get(&room.id) {
                if Arc::ptr_eq(existing, room) {
                    inner.rooms.remove(&room.id);
                }
            }
        }
        room.close();
    }

    /// Look up the channel registered for a key
    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.inner.read().chs.get(key).cloned()
    }

    /// Look up a room by id
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.read().rooms.get(room_id).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.read().chs.len()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }

    /// Connections registered from one peer IP
    pub fn ip_count(&self, ip: &str) -> i32 {
        self.inner.read().ip_cnts.get(ip).copied().unwrap_or(0)
    }

    /// Push a frame to every subscribed channel in this shard
    ///
    /// A channel receives the frame iff it watches `op` and, for a
    /// room-scoped frame, belongs to that room. Returns (delivered,
    /// dropped).
    pub fn broadcast(&self, frame: &Frame, op: i32) -> (usize, usize) {
        let inner = self.inner.read();
        let mut pushed = 0;
        let mut dropped = 0;
        for ch in inner.chs.values() {
            if !ch.need_push(op) {
                continue;
            }
            if !frame.room_id.is_empty() {
                match ch.room() {
                    Some(room) if room.id == frame.room_id => {}
                    _ => continue,
                }
            }
            match ch.push(frame.clone()) {
                Ok(()) => {
                    pushed += 1;
                    incr(&self.metrics.broadcast_pushed);
                }
                Err(err) => {
                    dropped += 1;
                    incr(&self.metrics.signal_dropped);
                    tracing::warn!(key = %ch.key, %err, "broadcast push dropped");
                }
            }
        }
        tracing::debug!(op, room = %frame.room_id, pushed, dropped, "bucket broadcast");
        (pushed, dropped)
    }

    /// Queue a room broadcast onto one of the bucket's workers
    ///
    /// Workers are chosen round-robin, so ordering across concurrent
    /// broadcasts to the same room is best-effort; a single broadcast is
    /// delivered to the room's members in one pass.
    pub fn broadcast_room(&self, req: BroadcastRoomReq) {
        let num = (self.routine_num.fetch_add(1, Ordering::Relaxed) % self.routines.len() as u64) as usize;
        if let Err(err) = self.routines[num].try_send(req) {
            incr(&self.metrics.room_broadcast_dropped);
            tracing::warn!(worker = num, %err, "room broadcast queue full, dropped");
        }
    }

    /// Ids of rooms with at least one member
    pub fn rooms(&self) -> HashSet<String> {
        let inner = self.inner.read();
        inner
            .rooms
            .iter()
            .filter(|(_, room)| room.online() > 0)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Per-room member counts for rooms with at least one member
    pub fn rooms_count(&self) -> HashMap<String, i32> {
        let inner = self.inner.read();
        inner
            .rooms
            .iter()
            .filter(|(_, room)| room.online() > 0)
            .map(|(id, room)| (id.clone(), room.online()))
            .collect()
    }

    /// Refresh every room's cluster-wide member count from an aggregated
    /// map; rooms absent from the map reset to zero
    pub fn up_rooms_count(&self, room_count_map: &HashMap<String, i32>) {
        let inner = self.inner.read();
        for (id, room) in inner.rooms.iter() {
            room.set_all_online(room_count_map.get(id).copied().unwrap_or(0));
        }
    }

    async fn room_proc(bucket: Weak<Bucket>, mut rx: mpsc::Receiver<BroadcastRoomReq>) {
        while let Some(req) = rx.recv().await {
            let Some(bucket) = bucket.upgrade() else {
                return;
            };
            match bucket.room(&req.room_id) {
                Some(room) => {
                    let (pushed, dropped) = room.push_msg(&req.frame);
                    for _ in 0..dropped {
                        incr(&bucket.metrics.signal_dropped);
                    }
                    tracing::debug!(room = %req.room_id, pushed, dropped, "room broadcast delivered");
                }
                None => {
                    tracing::debug!(room = %req.room_id, "room broadcast for absent room");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::op;
    use bytes::Bytes;
    use std::time::Duration;

    fn cfg() -> BucketConfig {
        BucketConfig {
            size: 1,
            channel: 16,
            room: 16,
            routine_amount: 2,
            routine_size: 8,
        }
    }

    fn new_bucket() -> Arc<Bucket> {
        Bucket::new(&cfg(), Arc::new(Metrics::new()))
    }

    fn channel(key: &str) -> (Arc<Channel>, ChannelParts) {
        Channel::new(key, "10.0.0.1", 0, 4, 8)
    }

    fn room_frame(room: &str, body: &'static [u8]) -> Frame {
        Frame::new(op::PUSH_MSG, 1, room, "", Bytes::from_static(body))
    }

    #[tokio::test]
    async fn test_single_login_wins() {
        let bucket = new_bucket();
        let (a, _pa) = channel("u1");
        let (b, _pb) = channel("u1");

        bucket.put("r1", &a);
        bucket.put("r1", &b);

        // The first session was told to finish and the key now resolves to
        // the second.
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert!(Arc::ptr_eq(&bucket.channel("u1").unwrap(), &b));
    }

    #[tokio::test]
    async fn test_del_ignores_replaced_channel() {
        let bucket = new_bucket();
        let (a, _pa) = channel("u1");
        let (b, _pb) = channel("u1");

        bucket.put("", &a);
        bucket.put("", &b);
        assert_eq!(bucket.ip_count("10.0.0.1"), 2);

        // The evicted session's cleanup must not unregister its successor.
        bucket.del(&a);
        assert!(Arc::ptr_eq(&bucket.channel("u1").unwrap(), &b));
        assert_eq!(bucket.ip_count("10.0.0.1"), 1);

        bucket.del(&b);
        assert!(bucket.channel("u1").is_none());
        assert_eq!(bucket.ip_count("10.0.0.1"), 0);
    }

    #[tokio::test]
    async fn test_room_removed_when_last_member_leaves() {
        let bucket = new_bucket();
        let mut sessions = Vec::new();
        for i in 0..4 {
            let (ch, parts) = channel(&format!("u{i}"));
            bucket.put("r1", &ch);
            sessions.push((ch, parts));
        }
        assert_eq!(bucket.room("r1").unwrap().online(), 4);

        for (ch, _) in &sessions {
            bucket.del(ch);
        }
        assert!(bucket.room("r1").is_none());
        assert_eq!(bucket.room_count(), 0);
    }

    #[tokio::test]
    async fn test_change_room_moves_and_cleans_up() {
        let bucket = new_bucket();
        let (ch, _parts) = channel("u1");
        bucket.put("r1", &ch);

        bucket.change_room("r2", &ch);
        assert!(bucket.room("r1").is_none());
        assert_eq!(ch.room().unwrap().id, "r2");
        assert_eq!(bucket.room("r2").unwrap().online(), 1);

        bucket.change_room("", &ch);
        assert!(ch.room().is_none());
        assert!(bucket.room("r2").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_op_and_room() {
        let bucket = new_bucket();
        let (subscribed, mut p_sub) = channel("sub");
        let (wrong_room, mut p_wrong) = channel("wrong");
        let (unsubscribed, mut p_unsub) = channel("unsub");

        bucket.put("r1", &subscribed);
        bucket.put("r2", &wrong_room);
        bucket.put("r1", &unsubscribed);
        subscribed.watch(&[op::PUSH_MSG]);
        wrong_room.watch(&[op::PUSH_MSG]);

        let frame = room_frame("r1", b"hello");
        let (pushed, dropped) = bucket.broadcast(&frame, op::PUSH_MSG);
        assert_eq!((pushed, dropped), (1, 0));

        match p_sub.signal_rx.try_recv().unwrap() {
            Signal::Push(f) => assert_eq!(&f.body[..], b"hello"),
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(p_wrong.signal_rx.try_recv().is_err());
        assert!(p_unsub.signal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_empty_room_reaches_all_subscribers() {
        let bucket = new_bucket();
        let (a, mut pa) = channel("a");
        let (b, mut pb) = channel("b");
        bucket.put("r1", &a);
        bucket.put("r2", &b);
        a.watch(&[op::PUSH_MSG]);
        b.watch(&[op::PUSH_MSG]);

        let frame = room_frame("", b"everyone");
        let (pushed, _) = bucket.broadcast(&frame, op::PUSH_MSG);
        assert_eq!(pushed, 2);
        assert!(matches!(pa.signal_rx.try_recv().unwrap(), Signal::Push(_)));
        assert!(matches!(pb.signal_rx.try_recv().unwrap(), Signal::Push(_)));
    }

    #[tokio::test]
    async fn test_broadcast_room_via_worker() {
        let bucket = new_bucket();
        let (ch, mut parts) = channel("u1");
        bucket.put("r1", &ch);
        ch.watch(&[op::PUSH_MSG]);

        bucket.broadcast_room(BroadcastRoomReq {
            room_id: "r1".into(),
            frame: room_frame("r1", b"via worker"),
        });

        let sig = tokio::time::timeout(Duration::from_secs(1), parts.signal_rx.recv())
            .await
            .expect("worker delivered within deadline")
            .unwrap();
        match sig {
            Signal::Push(f) => assert_eq!(&f.body[..], b"via worker"),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rooms_count_and_aggregation() {
        let bucket = new_bucket();
        let (a, _pa) = channel("a");
        let (b, _pb) = channel("b");
        bucket.put("r1", &a);
        bucket.put("r1", &b);

        let counts = bucket.rooms_count();
        assert_eq!(counts.get("r1"), Some(&2));
        assert_eq!(bucket.rooms(), HashSet::from(["r1".to_string()]));

        let mut totals = HashMap::new();
        totals.insert("r1".to_string(), 7);
        bucket.up_rooms_count(&totals);
        assert_eq!(bucket.room("r1").unwrap().all_online(), 7);

        bucket.up_rooms_count(&HashMap::new());
        assert_eq!(bucket.room("r1").unwrap().all_online(), 0);
    }
}
