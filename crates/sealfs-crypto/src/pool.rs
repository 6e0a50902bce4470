//! Reusable frame buffers for the write path
//!
//! Chunks can be up to 16 MiB, so every sealed frame (chunk header, ciphertext
//! and tag) lives in a buffer borrowed from a pool. A checked-out buffer is
//! owned by exactly one [`PooledBuffer`] and returns to the pool when that
//! guard is dropped, which for a frame handed to the backend happens once the
//! backend has consumed it. Contents are not cleared between uses.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::CHUNK_HEADER_LEN;
use crate::TAG_SIZE;

/// Default number of idle buffers kept around
pub const DEFAULT_MAX_IDLE: usize = 8;

#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

impl BufferPool {
    /// Pool of buffers able to hold one full frame of `chunk_size` plaintext
    /// bytes, so a chunk can be sealed in place.
    pub fn new(chunk_size: u32, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: CHUNK_HEADER_LEN + chunk_size as usize + TAG_SIZE,
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.idle.lock().pop();
        let buf = reused.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(self.capacity)
        });
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Capacity guaranteed for every checked-out buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Buffers allocated over the pool's lifetime.
    pub fn allocations(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn checkin(&self, buf: Vec<u8>) {
        if buf.capacity() < self.capacity {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.checkin(std::mem::take(&mut self.buf));
    }
}
