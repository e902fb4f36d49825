//! Room membership and fan-out
//!
//! A room is the set of channels that joined the same logical room id, and
//! the unit a room broadcast fans out over. Rooms do not own their members:
//! cleanup is cooperative — [`Room::del`] reports when the room emptied and
//! the owning bucket removes it. A removed room is tombstoned so that a
//! racing `put` fails instead of resurrecting it.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::bucket::channel::Channel;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// A set of member channels sharing one room id
#[derive(Debug)]
pub struct Room {
    /// Logical room id
    pub id: String,
    online: AtomicI32,
    all_online: AtomicI32,
    members: RwLock<Members>,
}

#[derive(Debug, Default)]
struct Members {
    chs: FxHashMap<u64, Arc<Channel>>,
    closed: bool,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            online: AtomicI32::new(0),
            all_online: AtomicI32::new(0),
            members: RwLock::new(Members::default()),
        }
    }

    /// Members on this node
    pub fn online(&self) -> i32 {
        self.online.load(Ordering::Relaxed)
    }

    /// Members across the cluster, per the latest aggregation pass
    pub fn all_online(&self) -> i32 {
        self.all_online.load(Ordering::Relaxed)
    }

    pub(crate) fn set_all_online(&self, count: i32) {
        self.all_online.store(count, Ordering::Relaxed);
    }

    /// Add a member. Fails with [`Error::RoomClosed`] if the room has
    /// already been removed by its bucket; the caller re-creates the room.
    pub fn put(&self, ch: &Arc<Channel>) -> Result<()> {
        let mut members = self.members.write();
        if members.closed {
            return Err(Error::RoomClosed);
        }
        if members.chs.insert(ch.cid(), Arc::clone(ch)).is_none() {
            self.online.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Remove a member; returns `true` when the room is now empty and the
    /// bucket should drop it
    pub fn del(&self, ch: &Arc<Channel>) -> bool {
        let mut members = self.members.write();
        if members.chs.remove(&ch.cid()).is_some() {
            self.online.fetch_sub(1, Ordering::Relaxed);
        }
        members.chs.is_empty()
    }

    /// Fan a frame out to every member's mailbox
    ///
    /// Pushes are non-blocking; members with a full mailbox miss this frame.
    /// Returns (accepted, dropped) member counts.
    pub fn push_msg(&self, frame: &Frame) -> (usize, usize) {
        let members = self.members.read();
        let mut pushed = 0;
        let mut dropped = 0;
        for ch in members.chs.values() {
            match ch.push(frame.clone()) {
                Ok(()) => pushed += 1,
                Err(err) => {
                    dropped += 1;
                    tracing::warn!(room = %self.id, key = %ch.key, %err, "room push dropped");
                }
            }
        }
        (pushed, dropped)
    }

    /// Tombstone the room after its bucket removed it
    pub fn close(&self) {
        let mut members = self.members.write();
        members.closed = true;
        members.chs.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.members.read().closed
    }
}
