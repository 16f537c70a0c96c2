//! Pool of evicted buffers the decoder can overwrite instead of allocating.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::domain::entities::{PixelBuffer, ReuseRequest};
use crate::domain::ports::ReuseSource;
use crate::infrastructure::config::ReuseRegime;

/// Default number of buffers kept for reuse.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Default time a buffer may sit in the pool unused.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);

struct PooledBuffer {
    buffer: PixelBuffer,
    offered_at: Instant,
}

/// Bounded set of reuse candidates.
///
/// Entries leave the pool when they are claimed, when they sit unused longer
/// than the idle limit, when the pool overflows (oldest first), or on
/// [`ReusePool::invalidate`].
pub struct ReusePool {
    entries: Mutex<Vec<PooledBuffer>>,
    regime: ReuseRegime,
    capacity: usize,
    max_idle: Duration,
    reused: AtomicU64,
    expired: AtomicU64,
}

impl ReusePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(regime: ReuseRegime, capacity: usize, max_idle: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            regime,
            capacity,
            max_idle,
            reused: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Creates a pool with default limits.
    #[must_use]
    pub fn with_regime(regime: ReuseRegime) -> Self {
        Self::new(regime, DEFAULT_POOL_CAPACITY, DEFAULT_MAX_IDLE)
    }

    /// Compatibility rule in effect.
    #[must_use]
    pub const fn regime(&self) -> ReuseRegime {
        self.regime
    }

    /// Adds an evicted buffer. Immutable buffers are ignored.
    pub fn offer(&self, buffer: PixelBuffer) {
        if !buffer.is_mutable() || self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.remove(0);
        }
        trace!(
            width = buffer.width(),
            height = buffer.height(),
            allocation = buffer.allocation_byte_count(),
            "Buffer offered for reuse"
        );
        entries.push(PooledBuffer {
            buffer,
            offered_at: Instant::now(),
        });
    }

    /// Removes and returns the first live buffer able to host `request`.
    ///
    /// Expired entries met during the scan are dropped.
    pub fn acquire_compatible(&self, request: &ReuseRequest) -> Option<PixelBuffer> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut i = 0;
        while i < entries.len() {
            let entry = &entries[i];
            if now.duration_since(entry.offered_at) > self.max_idle {
                entries.remove(i);
                self.expired.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if can_reuse(&entry.buffer, request, self.regime) {
                let entry = entries.remove(i);
                self.reused.fetch_add(1, Ordering::Relaxed);
                trace!(
                    width = request.width,
                    height = request.height,
                    sample_size = request.sample_size,
                    "Reusing pooled buffer"
                );
                return Some(entry.buffer);
            }
            i += 1;
        }
        None
    }

    /// Drops every pooled buffer.
    pub fn invalidate(&self) {
        self.entries.lock().clear();
    }

    /// Number of pooled buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers handed out so far.
    #[must_use]
    pub fn reused_count(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    /// Buffers dropped for sitting idle too long.
    #[must_use]
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled: self.len(),
            capacity: self.capacity,
            reused: self.reused_count(),
            expired: self.expired_count(),
        }
    }
}

/// Reuse pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently pooled.
    pub pooled: usize,
    /// Maximum buffers held.
    pub capacity: usize,
    /// Buffers handed back to the decoder.
    pub reused: u64,
    /// Buffers dropped after sitting idle.
    pub expired: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool: {}/{} buffers ({} reused, {} expired)",
            self.pooled, self.capacity, self.reused, self.expired
        )
    }
}

impl Default for ReusePool {
    fn default() -> Self {
        Self::with_regime(ReuseRegime::default())
    }
}

impl std::fmt::Debug for ReusePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusePool")
            .field("regime", &self.regime)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl ReuseSource for ReusePool {
    fn acquire_compatible(&self, request: &ReuseRequest) -> Option<PixelBuffer> {
        Self::acquire_compatible(self, request)
    }
}

/// Whether `candidate` can be overwritten by a decode described by `request`.
#[must_use]
pub fn can_reuse(candidate: &PixelBuffer, request: &ReuseRequest, regime: ReuseRegime) -> bool {
    if !candidate.is_mutable() {
        return false;
    }
    match regime {
        ReuseRegime::Strict => {
            candidate.width() == request.width
                && candidate.height() == request.height
                && request.sample_size == 1
        }
        ReuseRegime::Relaxed => request.target_byte_count() <= candidate.allocation_byte_count(),
    }
}
