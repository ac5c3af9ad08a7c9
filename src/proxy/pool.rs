//! Reusable copy buffers
//!
//! Every copy loop borrows its buffer through a [`BufferLease`], which hands
//! the buffer back to the pool when dropped. Dropping is the only way to end
//! a lease, so early returns and errors release it as well.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size of each pooled buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Upper bound on idle buffers kept around
pub const DEFAULT_MAX_IDLE: usize = 256;

/// Pool of fixed-size byte buffers shared by every session
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
    leased_total: AtomicU64,
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub idle: usize,
    pub outstanding: usize,
    pub leased_total: u64,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size: buffer_size.max(1),
                max_idle,
                idle: Mutex::new(Vec::with_capacity(max_idle.min(DEFAULT_MAX_IDLE))),
                outstanding: AtomicUsize::new(0),
                leased_total: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow a buffer, reusing an idle one when available
    pub fn lease(&self) -> BufferLease {
        let reused = self.inner.idle.lock().pop();
        let buffer = reused.unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        self.inner.leased_total.fetch_add(1, Ordering::Relaxed);

        BufferLease {
            buffer: Some(buffer),
            pool: self.inner.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of leases that have not been dropped yet
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            idle: self.inner.idle.lock().len(),
            outstanding: self.outstanding(),
            leased_total: self.inner.leased_total.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }
}

impl PoolInner {
    fn give_back(&self, buffer: Box<[u8]>) {
        if buffer.len() == self.buffer_size {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push(buffer);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A buffer borrowed from a [`BufferPool`]
pub struct BufferLease {
    buffer: Option<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl Deref for BufferLease {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}
