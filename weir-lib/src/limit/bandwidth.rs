//! The per-chunk bandwidth decision.

use super::freq::FreqCounter;

/// All limits are defined per-second, so the counting period is 1000ms.
pub const PERIOD_MS: u64 = 1000;

// The window slides over two periods, so never wait for longer than that.
const MAX_WAIT_MS: u64 = 2 * PERIOD_MS;

/// Outcome of one bandwidth decision for a payload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyLimitResult {
    /// Milliseconds the stream should wait before attempting to forward more.
    pub wait_ms: u64,
    /// Bytes the stream is authorized to forward immediately.
    pub bytes_to_forward: u64,
}

/// Ensure that no more than `limit` bytes are transmitted per second, split
/// across `requests` concurrent requests sharing `counter`.
///
/// `bytes_available` is the most the caller could forward right now. The
/// function applies the limitation and returns what may be forwarded
/// immediately, along with how long to wait before the next attempt.
///
/// Safe to call concurrently from multiple threads for the same counter:
/// the single mutating call is [`FreqCounter::update`], which is atomic.
pub fn apply_bandwidth(
    counter: &FreqCounter,
    limit: u32,
    requests: i32,
    bytes_available: u64,
) -> ApplyLimitResult {
    let limit = u64::from(limit);
    let requests = u64::try_from(requests).unwrap_or(1).max(1);

    // Refuse to forward while the current rate exceeds the limit over the
    // window, and compute the waiting time so we don't retry too early.
    // Checking overshoot first avoids the initial burst: otherwise requests
    // would consume the whole limit immediately and then pause for a long
    // time.
    let overshoot = counter.overshoot(PERIOD_MS, limit);
    if overshoot > 0 {
        let overshoot = u64::try_from(overshoot).unwrap_or(0);
        // A proportional wait only makes sense with a positive limit; a zero
        // limit would divide by zero, so it always waits the maximum.
        let wait_ms = if limit > 0 {
            MAX_WAIT_MS.min(overshoot.saturating_mul(PERIOD_MS).saturating_mul(requests) / limit)
        } else {
            MAX_WAIT_MS
        };
        return ApplyLimitResult { wait_ms, bytes_to_forward: 0 };
    }

    // Divide the remaining window quota evenly between the local concurrent
    // requests on the same limit.
    let quota = counter.remaining(PERIOD_MS, limit, 0);
    let per_request = quota.div_ceil(requests);
    let bytes_to_forward = bytes_available.min(per_request);

    counter.update(PERIOD_MS, bytes_to_forward);
    let wait_ms = if bytes_to_forward < bytes_available {
        MAX_WAIT_MS.min(counter.next_event_delay(PERIOD_MS, limit, 0))
    } else {
        0
    };

    ApplyLimitResult { wait_ms, bytes_to_forward }
}
