//! Sliding-window byte counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A two-bucket sliding-window byte counter.
///
/// Bytes are accumulated into the bucket for the current fixed-length period;
/// the previous period's bucket decays linearly as the window slides over it,
/// so the window total is `curr + prev * (period - elapsed) / period`.
///
/// # Thread safety
///
/// Only [`update`](FreqCounter::update) adds to the counter, and it does so
/// with atomic arithmetic. Bucket rotation is a compare-and-swap on the
/// bucket epoch: the winning thread rolls the buckets, losers proceed with
/// the rotated state. All operations are safe to call concurrently on the
/// same counter.
#[derive(Debug)]
pub struct FreqCounter {
    start: Instant,
    // start tick (ms since `start`) of the current bucket, aligned to the period
    epoch_ms: AtomicU64,
    curr: AtomicU64,
    prev: AtomicU64,
}

impl Default for FreqCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FreqCounter {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            epoch_ms: AtomicU64::new(0),
            curr: AtomicU64::new(0),
            prev: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    // Rotate the buckets if the period boundary has passed. Returns the
    // milliseconds elapsed within the current bucket after rotation.
    fn maybe_rotate(&self, period_ms: u64, now: u64) -> u64 {
        if period_ms == 0 {
            return 0;
        }
        let epoch = self.epoch_ms.load(Ordering::SeqCst);
        let past = now.saturating_sub(epoch);
        if past < period_ms {
            return past;
        }

        let new_epoch = now - now % period_ms;
        match self.epoch_ms.compare_exchange(epoch, new_epoch, Ordering::SeqCst, Ordering::Acquire)
        {
            Ok(_) => {
                let current = self.curr.swap(0, Ordering::SeqCst);
                // Beyond two periods the old bucket no longer overlaps the window.
                let carried = if past >= period_ms.saturating_mul(2) { 0 } else { current };
                self.prev.store(carried, Ordering::SeqCst);
            }
            Err(_) => {
                // another thread rotated first
            }
        }
        now.saturating_sub(self.epoch_ms.load(Ordering::SeqCst))
    }

    // Bytes visible in the sliding window right now.
    fn window_total(&self, period_ms: u64) -> u64 {
        let elapsed = self.maybe_rotate(period_ms, self.now_ms());
        let prev = self.prev.load(Ordering::SeqCst);
        let curr = self.curr.load(Ordering::SeqCst);
        let prev_share = if period_ms == 0 {
            0
        } else {
            prev.saturating_mul(period_ms.saturating_sub(elapsed)) / period_ms
        };
        curr.saturating_add(prev_share)
    }

    /// Admit `bytes` into the current bucket and return the bucket's new total.
    pub fn update(&self, period_ms: u64, bytes: u64) -> u64 {
        self.maybe_rotate(period_ms, self.now_ms());
        self.curr.fetch_add(bytes, Ordering::SeqCst).saturating_add(bytes)
    }

    /// Signed bytes over `limit` across the sliding window. Positive means
    /// the limit is currently exceeded.
    pub fn overshoot(&self, period_ms: u64, limit: u64) -> i64 {
        let total = self.window_total(period_ms);
        i64::try_from(total).unwrap_or(i64::MAX) - i64::try_from(limit).unwrap_or(i64::MAX)
    }

    /// Bytes that may still be admitted in the current window without
    /// crossing `limit`, with `pending` bytes already accounted for.
    pub fn remaining(&self, period_ms: u64, limit: u64, pending: u64) -> u64 {
        limit.saturating_sub(self.window_total(period_ms).saturating_add(pending))
    }

    /// Milliseconds until the window would next admit more bytes. Zero when
    /// the window has room right now.
    pub fn next_event_delay(&self, period_ms: u64, limit: u64, pending: u64) -> u64 {
        let total = self.window_total(period_ms).saturating_add(pending);
        if total < limit {
            return 0;
        }
        if limit == 0 {
            return period_ms.saturating_mul(2);
        }
        (total - limit + 1).saturating_mul(period_ms) / limit
    }
}
