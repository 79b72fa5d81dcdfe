//! Cache counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic event counters, bumped without taking the state lock
#[derive(Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub read_requests: AtomicU64,
    pub write_requests: AtomicU64,
    pub ahead_dropped: AtomicU64,
    pub io_errors: AtomicU64,
    pub busy_invalidated: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads satisfied without I/O
    pub hits: u64,
    /// Reads that had to go to the driver
    pub misses: u64,
    pub read_requests: u64,
    pub write_requests: u64,
    /// Read-ahead / write-ahead hints dropped (buffer busy or table full)
    pub ahead_dropped: u64,
    /// Requests the driver finished unsuccessfully
    pub io_errors: u64,
    /// Buffers invalidated while still referenced
    pub busy_invalidated: u64,
    /// Descriptors with a non-zero reference count
    pub buffers_in_use: usize,
    pub buffers_dirty: usize,
    pub requests_in_use: usize,
}

impl CacheStats {
    pub(crate) fn load(counters: &Counters) -> Self {
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            read_requests: counters.read_requests.load(Ordering::Relaxed),
            write_requests: counters.write_requests.load(Ordering::Relaxed),
            ahead_dropped: counters.ahead_dropped.load(Ordering::Relaxed),
            io_errors: counters.io_errors.load(Ordering::Relaxed),
            busy_invalidated: counters.busy_invalidated.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }

    /// Fraction of reads served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn print(&self) {
        eprintln!("Buffer cache statistics:");
        eprintln!("  hits / misses:     {} / {} ({:.1}%)", self.hits, self.misses, self.hit_ratio() * 100.0);
        eprintln!("  requests (r / w):  {} / {}", self.read_requests, self.write_requests);
        eprintln!("  ahead dropped:     {}", self.ahead_dropped);
        eprintln!("  I/O errors:        {}", self.io_errors);
        eprintln!("  busy invalidated:  {}", self.busy_invalidated);
        eprintln!("  buffers in use:    {} ({} dirty)", self.buffers_in_use, self.buffers_dirty);
        eprintln!("  requests in use:   {}", self.requests_in_use);
    }
}
