//! Single-producer/single-consumer frame ring
//!
//! A power-of-two ring of [`Frame`] slots staging inbound packets between a
//! session's reader and its dispatcher. The two endpoints are separate owned
//! halves, so the single-producer/single-consumer contract is enforced by
//! the type system rather than by convention.
//!
//! The producer fills a slot in place (`set`), then publishes it
//! (`set_adv`); the consumer reads the head slot (`get`) and releases it
//! (`get_adv`). Publication uses release stores on the write pointer and
//! acquire loads on the read side, which is the whole synchronization
//! story: slots themselves are accessed without locks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::Frame;

struct Shared {
    num: u64,
    mask: u64,
    slots: Box<[UnsafeCell<Frame>]>,
    rp: AtomicU64,
    wp: AtomicU64,
}

// Slots are only touched by the producer between set/set_adv and by the
// consumer between get/get_adv; the rp/wp handshake orders those accesses.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Create a ring with room for `num` frames (rounded up to a power of two)
pub fn ring(num: usize) -> (RingProducer, RingConsumer) {
    let num = num.max(1).next_power_of_two() as u64;
    let slots = (0..num).map(|_| UnsafeCell::new(Frame::default())).collect();
    let shared = Arc::new(Shared {
        num,
        mask: num - 1,
        slots,
        rp: AtomicU64::new(0),
        wp: AtomicU64::new(0),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

/// Writing half of the ring; owned by the session reader
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Borrow the next write slot, or [`Error::RingFull`] when the consumer
    /// has fallen `num` frames behind
    pub fn set(&mut self) -> Result<&mut Frame> {
        let wp = self.shared.wp.load(Ordering::Relaxed);
        let rp = self.shared.rp.load(Ordering::Acquire);
        if wp.wrapping_sub(rp) >= self.shared.num {
            return Err(Error::RingFull);
        }
        let slot = self.shared.slots[(wp & self.shared.mask) as usize].get();
        Ok(unsafe { &mut *slot })
    }

    /// Publish the slot last borrowed with [`set`](Self::set)
    pub fn set_adv(&mut self) {
        let wp = self.shared.wp.load(Ordering::Relaxed);
        self.shared.wp.store(wp.wrapping_add(1), Ordering::Release);
    }
}

/// Reading half of the ring; owned by the session dispatcher
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Borrow the oldest published frame, or [`Error::RingEmpty`]
    pub fn get(&mut self) -> Result<&Frame> {
        let rp = self.shared.rp.load(Ordering::Relaxed);
        let wp = self.shared.wp.load(Ordering::Acquire);
        if rp == wp {
            return Err(Error::RingEmpty);
        }
        let slot = self.shared.slots[(rp & self.shared.mask) as usize].get();
        Ok(unsafe { &*slot })
    }

    /// Release the slot last borrowed with [`get`](Self::get), making it
    /// writable again
    pub fn get_adv(&mut self) {
        let rp = self.shared.rp.load(Ordering::Relaxed);
        self.shared.rp.store(rp.wrapping_add(1), Ordering::Release);
    }

    /// Frames currently published and unconsumed
    pub fn len(&self) -> usize {
        let rp = self.shared.rp.load(Ordering::Relaxed);
        let wp = self.shared.wp.load(Ordering::Acquire);
        wp.wrapping_sub(rp) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
