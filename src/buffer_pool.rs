//! Fixed-size pool of reusable encode buffers.
//!
//! Buffers are handed out as [`BufferLease`] guards that return the buffer
//! to the pool when dropped, so every exit path (success, error, panic
//! unwinding, task cancellation) gives it back.
//!
//! # Exhaustion
//!
//! When every pooled buffer is leased, `acquire` does not wait: it hands
//! out a temporary buffer that is freed instead of pooled on release, and
//! logs a warning. The pool never grows beyond its configured size.
//!
//! # Example
//!
//! ```
//! use camwire::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(2, 1024);
//! {
//!     let mut lease = pool.acquire();
//!     lease.extend_from_slice(b"jpeg bytes");
//!     assert_eq!(pool.stats().available, 1);
//! }
//! assert_eq!(pool.stats().available, 2);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Default number of pooled buffers.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Default initial capacity of each pooled buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

/// A pooled buffer tagged with its slot number.
struct Slot {
    index: usize,
    buf: Vec<u8>,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    misses: AtomicU64,
}

struct PoolInner {
    free: Mutex<Vec<Slot>>,
    capacity: usize,
    buffer_capacity: usize,
    counters: Counters,
}

impl PoolInner {
    fn give_back(&self, slot: Slot) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(slot);
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of pooled buffers.
    pub capacity: usize,
    /// Pooled buffers currently free.
    pub available: usize,
    /// Pooled buffers currently leased.
    pub in_use: usize,
    /// Total successful or fallback acquisitions.
    pub acquire_count: u64,
    /// Total leases returned.
    pub release_count: u64,
    /// Acquisitions served by a temporary buffer.
    pub miss_count: u64,
}

/// Pool of byte buffers with at most one holder per buffer.
///
/// Cheap to clone; clones share the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each preallocated to `buffer_capacity` bytes.
    pub fn new(capacity: usize, buffer_capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|index| Slot {
                index,
                buf: Vec::with_capacity(buffer_capacity),
            })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
                buffer_capacity,
                counters: Counters::default(),
            }),
        }
    }

    /// Lease a buffer. Never blocks.
    ///
    /// The buffer comes back empty (`len() == 0`) but its previous contents
    /// are not zeroed; callers overwrite what they use.
    pub fn acquire(&self) -> BufferLease {
        self.inner.counters.acquired.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };

        match slot {
            Some(mut slot) => {
                slot.buf.clear();
                BufferLease {
                    pool: self.inner.clone(),
                    slot: Some(slot),
                    temporary: Vec::new(),
                }
            }
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Buffer pool exhausted ({} leased), using temporary buffer",
                    self.inner.capacity
                );
                BufferLease {
                    pool: self.inner.clone(),
                    slot: None,
                    temporary: Vec::with_capacity(self.inner.buffer_capacity),
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let available = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        PoolStats {
            capacity: self.inner.capacity,
            available,
            in_use: self.inner.capacity - available,
            acquire_count: self.inner.counters.acquired.load(Ordering::Relaxed),
            release_count: self.inner.counters.released.load(Ordering::Relaxed),
            miss_count: self.inner.counters.misses.load(Ordering::Relaxed),
        }
    }

    /// Configured number of pooled buffers.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").field("stats", &self.stats()).finish()
    }
}

/// Exclusive use of one buffer; returns it to the pool on drop.
pub struct BufferLease {
    pool: Arc<PoolInner>,
    slot: Option<Slot>,
    temporary: Vec<u8>,
}

impl BufferLease {
    /// Pool slot number, or `None` for a temporary buffer.
    pub fn slot(&self) -> Option<usize> {
        self.slot.as_ref().map(|s| s.index)
    }

    /// Whether this lease is an exhaustion fallback.
    pub fn is_temporary(&self) -> bool {
        self.slot.is_none()
    }
}

impl Deref for BufferLease {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        match &self.slot {
            Some(slot) => &slot.buf,
            None => &self.temporary,
        }
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.slot {
            Some(slot) => &mut slot.buf,
            None => &mut self.temporary,
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.slot.take() {
            self.pool.give_back(slot);
        }
    }
}
