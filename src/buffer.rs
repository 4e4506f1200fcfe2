//! Checkout/return pool of fixed-size scratch buffers.
//!
//! Serialization and send framing run synchronously on the caller's task and
//! need a contiguous region for at most one packet. The pool keeps a bounded
//! stack of reclaimed backing vectors so steady-state traffic stops touching
//! the allocator; under exhaustion [`BufferPool::acquire`] allocates a fresh
//! vector and never blocks.
//!
//! Buffers come back through [`PooledBuffer`]'s drop glue, so every exit path
//! of an encode routine returns its scratch space, including early `?`
//! returns.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Thread-safe pool of fixed-capacity byte buffers.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    chunk_size: usize,
    max_retained: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool handing out buffers of `chunk_size` capacity, retaining
    /// at most `max_retained` reclaimed buffers.
    pub fn new(chunk_size: usize, max_retained: usize) -> Self {
        BufferPool {
            inner: Arc::new(PoolInner {
                chunk_size,
                max_retained,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Checks out an empty buffer with the pool's chunk capacity.
    ///
    /// Reuses a reclaimed backing vector when one is available and allocates
    /// otherwise. Never blocks.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self
            .inner
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop();
        let buf = match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                trace!(chunk_size = self.inner.chunk_size, "buffer pool empty, allocating");
                Vec::with_capacity(self.inner.chunk_size)
            }
        };
        PooledBuffer { buf, pool: Arc::clone(&self.inner) }
    }

    /// Number of reclaimed buffers currently held by the pool.
    pub fn retained(&self) -> usize {
        self.inner.free.lock().expect("buffer pool mutex poisoned").len()
    }

    /// Capacity of the buffers this pool hands out.
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }
}

/// A checked-out buffer; dereferences to its backing `Vec<u8>`.
///
/// Returned to the pool on drop. A buffer that grew past the pool's chunk
/// size (a caller wrote more than one packet's worth) is discarded instead of
/// retained, keeping the pool's footprint uniform.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
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
        if self.buf.capacity() < self.pool.chunk_size {
            return;
        }
        let mut free = self.pool.free.lock().expect("buffer pool mutex poisoned");
        if free.len() < self.pool.max_retained {
            free.push(std::mem::take(&mut self.buf));
        }
    }
}
