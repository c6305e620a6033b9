//! Refcounted storage for stateless strings
//!
//! A stateless string is a string value built without any runtime context,
//! typically from a literal. Its bytes live in a shared buffer owned by
//! every handle that holds it: cloning a [`PooledString`] retains the
//! buffer, dropping it releases, and the buffer is freed when the last
//! holder goes away. Buffers never move once allocated.
//!
//! The process-wide [`StringPool`] tracks every live buffer so that leaks
//! and premature frees are observable.

use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

static GLOBAL_POOL: LazyLock<StringPool> = LazyLock::new(StringPool::new);

/// Registry of live stateless-string buffers.
pub struct StringPool {
    /// Buffer id to buffer length, for every buffer not yet freed.
    live: DashMap<u64, usize>,
    counter: AtomicU64,
    freed: AtomicU64,
}

/// Counters for a [`StringPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated: u64,
    pub freed: u64,
    pub live: usize,
}

impl StringPool {
    fn new() -> Self {
        Self {
            live: DashMap::new(),
            counter: AtomicU64::new(1),
            freed: AtomicU64::new(0),
        }
    }

    /// The pool shared by the whole process.
    pub fn global() -> &'static StringPool {
        &GLOBAL_POOL
    }

    /// Allocates a fresh buffer holding `bytes` with a single holder.
    ///
    /// Equal contents are not deduplicated; every call allocates.
    pub fn intern(&'static self, bytes: &[u8]) -> PooledString {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, bytes.len());
        trace!(id, len = bytes.len(), "stateless string allocated");
        PooledString(Arc::new(Buffer {
            pool: self,
            id,
            bytes: bytes.into(),
        }))
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.live.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.counter.load(Ordering::Relaxed) - 1,
            freed: self.freed.load(Ordering::Relaxed),
            live: self.live.len(),
        }
    }

    fn free(&self, id: u64) {
        if self.live.remove(&id).is_some() {
            self.freed.fetch_add(1, Ordering::Relaxed);
            trace!(id, "stateless string freed");
        }
    }
}

struct Buffer {
    pool: &'static StringPool,
    id: u64,
    bytes: Box<[u8]>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.free(self.id);
    }
}

/// A shared handle to a pooled buffer.
#[derive(Clone)]
pub struct PooledString(Arc<Buffer>);

impl PooledString {
    pub fn new(bytes: &[u8]) -> Self {
        StringPool::global().intern(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    /// Number of handles currently sharing this buffer.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles share one buffer.
    pub fn ptr_eq(&self, other: &PooledString) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for PooledString {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl fmt::Debug for PooledString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}
