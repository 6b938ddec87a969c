//! Recycling pool for chunk buffers
//!
//! Series cut a fresh set of chunks every few hundred samples and drop them
//! when the series goes away. The pool keeps a bounded free list per encoding
//! so those buffers (and their capacity) are reused instead of reallocated.
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::compression::{ChunkPool, Encoding};
//!
//! let pool = ChunkPool::new(16);
//! let mut chunk = pool.get(Encoding::Rle);
//! chunk.appender().unwrap().append(10).unwrap();
//!
//! pool.put(chunk);
//! assert_eq!(pool.idle(Encoding::Rle), 1);
//!
//! // Recycled chunks come back empty
//! assert_eq!(pool.get(Encoding::Rle).num_samples(), 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{new_chunk, Chunk, Encoding};

/// Bounded per-encoding free lists of reset chunks
#[derive(Debug)]
pub struct ChunkPool {
    xor: Mutex<Vec<Box<dyn Chunk>>>,
    delta: Mutex<Vec<Box<dyn Chunk>>>,
    rle: Mutex<Vec<Box<dyn Chunk>>>,
    capacity: usize,
    stats: PoolStats,
}

/// Pool counters
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Chunks served from a free list
    pub hits: AtomicU64,

    /// Chunks allocated because the free list was empty
    pub misses: AtomicU64,

    /// Chunks dropped on return because the free list was full
    pub discarded: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Chunks served from a free list
    pub hits: u64,
    /// Chunks freshly allocated
    pub misses: u64,
    /// Chunks dropped on return
    pub discarded: u64,
}

impl ChunkPool {
    /// Create a pool keeping at most `capacity` idle chunks per encoding
    pub fn new(capacity: usize) -> Self {
        Self {
            xor: Mutex::new(Vec::new()),
            delta: Mutex::new(Vec::new()),
            rle: Mutex::new(Vec::new()),
            capacity,
            stats: PoolStats::default(),
        }
    }

    fn list(&self, encoding: Encoding) -> &Mutex<Vec<Box<dyn Chunk>>> {
        match encoding {
            Encoding::Xor => &self.xor,
            Encoding::Delta => &self.delta,
            Encoding::Rle => &self.rle,
        }
    }

    /// Take an empty chunk of `encoding`, allocating one if none is idle
    pub fn get(&self, encoding: Encoding) -> Box<dyn Chunk> {
        if let Some(chunk) = self.list(encoding).lock().pop() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return chunk;
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        new_chunk(encoding)
    }

    /// Return a chunk; it is reset and kept unless the free list is full
    pub fn put(&self, mut chunk: Box<dyn Chunk>) {
        let mut list = self.list(chunk.encoding()).lock();
        if list.len() >= self.capacity {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        chunk.reset();
        list.push(chunk);
    }

    /// Number of idle chunks of `encoding`
    pub fn idle(&self, encoding: Encoding) -> usize {
        self.list(encoding).lock().len()
    }

    /// Maximum idle chunks per encoding
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a snapshot of the pool counters
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new(1024)
    }
}
