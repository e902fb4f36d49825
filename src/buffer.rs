//! Session read-buffer pool
//!
//! A fixed-geometry slab allocator. Each [`Pool`] hands out same-sized
//! [`Buffer`]s from a LIFO free list, so a recently released slab is the
//! next one reused while its cache lines are still warm. When the free list
//! runs dry the pool grows by one contiguous `num x size` region carved into
//! `num` buffers, keeping neighboring slabs adjacent in memory.
//!
//! A session acquires one buffer when it opens and returns it when it
//! closes; the buffer outlives every individual frame read through it.

use bytes::BytesMut;
use parking_lot::Mutex;

/// A reusable byte slab owned by a session between [`Pool::get`] and
/// [`Pool::put`]
#[derive(Debug)]
pub struct Buffer {
    buf: BytesMut,
}

impl Buffer {
    /// Standalone buffer, not tied to a pool
    pub fn new(size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(size),
        }
    }

    /// Mutable access to the underlying bytes
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

/// Thread-safe LIFO free list of fixed-size buffers
#[derive(Debug)]
pub struct Pool {
    free: Mutex<Vec<Buffer>>,
    num: usize,
    size: usize,
}

impl Pool {
    /// Create a pool that grows in steps of `num` buffers of `size` bytes
    pub fn new(num: usize, size: usize) -> Self {
        assert!(num > 0 && size > 0, "pool geometry must be non-zero");
        Self {
            free: Mutex::new(Vec::new()),
            num,
            size,
        }
    }

    /// Buffer size this pool hands out
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Pop the most recently released buffer, growing the pool on a miss
    pub fn get(&self) -> Buffer {
        let mut free = self.free.lock();
        if free.is_empty() {
            Self::grow(&mut free, self.num, self.size);
        }
        free.pop().expect("pool grew by at least one buffer")
    }

    /// Return a buffer to the head of the free list
    pub fn put(&self, mut buffer: Buffer) {
        buffer.buf.clear();
        self.free.lock().push(buffer);
    }

    /// Number of buffers currently free
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    fn grow(free: &mut Vec<Buffer>, num: usize, size: usize) {
        // One allocation for the whole step; split_to keeps every slab
        // backed by the same region.
        let mut slab = BytesMut::zeroed(num * size);
        for _ in 0..num - 1 {
            let mut buf = slab.split_to(size);
            buf.clear();
            free.push(Buffer { buf });
        }
        slab.clear();
        free.push(Buffer { buf: slab });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_grows_on_empty() {
        let pool = Pool::new(4, 64);
        assert_eq!(pool.free_len(), 0);

        let buf = pool.get();
        assert_eq!(pool.free_len(), 3);
        pool.put(buf);
        assert_eq!(pool.free_len(), 4);
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = Pool::new(2, 32);
        let a = pool.get();
        let b = pool.get();

        let a_ptr = a.buf.as_ptr();
        pool.put(b);
        pool.put(a);

        // The last buffer returned is the first handed out again.
        let again = pool.get();
        assert_eq!(again.buf.as_ptr(), a_ptr);
    }

    #[test]
    fn test_buffers_usable_for_writes() {
        let pool = Pool::new(2, 16);
        let mut buf = pool.get();
        buf.bytes_mut().extend_from_slice(b"hello");
        assert_eq!(&buf.bytes_mut()[..], b"hello");

        pool.put(buf);
        let mut buf = pool.get();
        // Returned buffers come back cleared.
        assert!(buf.bytes_mut().is_empty());
        buf.bytes_mut().extend_from_slice(b"again");
        assert_eq!(&buf.bytes_mut()[..], b"again");
    }
}
