//! Per-user limit shares and active-request accounting.

use ahash::AHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::warn;

use super::freq::FreqCounter;
use super::Direction;

const SWEEP_INTERVAL_MS: u64 = 30_000;

// Keep a user's counters around for a few seconds after their last request
// ends, so that bandwidth used by back-to-back serial requests is still
// counted against the next one.
const SWEEP_MIN_MS_SINCE_REQUEST_END: u64 = 5_000;

/// Limit state for one transfer direction of one user.
///
/// Fields are atomics so the hot payload path can read shares and
/// active-request counts under the table's shared lock (or no lock at all
/// via an [`Arc<UserLimit>`] held by the stream).
#[derive(Debug, Default)]
pub struct DirectionLimit {
    limit_received: AtomicBool,
    limit_timestamp: AtomicU64,
    bytes_per_second: AtomicU32,
    pub counter: FreqCounter,
    active_requests: AtomicI32,
    // The next tick at which we're allowed to emit a throttle event for this
    // user and direction. Zero means unset.
    next_throttle_log_tick: AtomicU64,
}

impl DirectionLimit {
    pub fn limit_received(&self) -> bool {
        self.limit_received.load(Ordering::Relaxed)
    }

    pub fn limit_timestamp(&self) -> u64 {
        self.limit_timestamp.load(Ordering::Relaxed)
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> i32 {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Claim the right to emit a throttle event at `now_ms`.
    ///
    /// Many threads can be forwarding for the same user; the single winner of
    /// the compare-and-swap on the log tick emits, everyone else skips. At
    /// most one claim per second succeeds.
    pub fn try_claim_throttle_log(&self, now_ms: u64) -> bool {
        let tick = self.next_throttle_log_tick.load(Ordering::SeqCst);
        if tick != 0 && now_ms < tick {
            return false;
        }
        self.next_throttle_log_tick
            .compare_exchange(tick, now_ms + 1000, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    fn ingest(&self, timestamp: u64, bytes_per_second: u32) {
        self.limit_received.store(true, Ordering::Relaxed);
        if timestamp >= self.limit_timestamp.load(Ordering::Relaxed) {
            self.limit_timestamp.store(timestamp, Ordering::Relaxed);
            self.bytes_per_second.store(bytes_per_second, Ordering::Relaxed);
        }
    }
}

/// One record per user key: upload and download limit state plus the tick of
/// the most recent request end.
#[derive(Debug, Default)]
pub struct UserLimit {
    pub upload: DirectionLimit,
    pub download: DirectionLimit,
    last_request_end_tick: AtomicU64,
}

impl UserLimit {
    pub fn direction(&self, direction: Direction) -> &DirectionLimit {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    pub fn last_request_end_tick(&self) -> u64 {
        self.last_request_end_tick.load(Ordering::Relaxed)
    }
}

/// Mapping from user key to limit record.
///
/// Records are handed out as `Arc<UserLimit>`; a stream's handle stays valid
/// for the stream's whole lifetime regardless of sweeping, since the sweep
/// only drops the table's reference.
#[derive(Debug, Default)]
pub struct UserLimitTable {
    state: RwLock<AHashMap<String, Arc<UserLimit>>>,
    next_sweep_tick: AtomicU64,
}

impl UserLimitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a limit-share update from the controller.
    ///
    /// Creates the record if absent. A share with an older timestamp never
    /// overwrites a newer one, so replayed or reordered updates are safe.
    pub fn ingest_share(
        &self,
        timestamp: u64,
        user_key: &str,
        direction: Direction,
        bytes_per_second: u64,
    ) {
        // The freq counter operates on 32-bit byte counts. The cap applies
        // per instance, so users with larger allocations still reach their
        // full throughput when the controller spreads them across instances.
        let share = match u32::try_from(bytes_per_second) {
            Ok(v) => v,
            Err(_) => {
                warn!(
                    "limit share for user {user_key}/{} exceeds the 4GB/s cap, \
                     clamping from {bytes_per_second}bps to {}bps",
                    direction.as_str(),
                    u32::MAX
                );
                u32::MAX
            }
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let record = state.entry(user_key.to_string()).or_default();
        record.direction(direction).ingest(timestamp, share);
    }

    /// Register one more in-flight request for `user_key` and hand back the
    /// record. Opportunistically sweeps stale records at most once per 30s.
    pub fn on_attach(&self, user_key: &str, direction: Direction, now_ms: u64) -> Arc<UserLimit> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let record = Arc::clone(state.entry(user_key.to_string()).or_default());
        record.direction(direction).active_requests.fetch_add(1, Ordering::Relaxed);

        let next_sweep = self.next_sweep_tick.load(Ordering::Relaxed);
        if now_ms >= next_sweep {
            self.next_sweep_tick.store(now_ms + SWEEP_INTERVAL_MS, Ordering::Relaxed);
            Self::sweep_locked(&mut state, now_ms);
        }

        record
    }

    /// Unregister an in-flight request. Returns the new active count, which
    /// can transiently go negative on accounting bugs; callers warn, the
    /// table clamps nothing.
    pub fn on_detach(&self, record: &UserLimit, direction: Direction, now_ms: u64) -> i32 {
        record.last_request_end_tick.store(now_ms, Ordering::Relaxed);
        let active = record.direction(direction).active_requests.fetch_sub(1, Ordering::Relaxed) - 1;
        if active < 0 {
            warn!("active request count went negative ({active}) on detach");
        }
        active
    }

    pub fn get(&self, user_key: &str) -> Option<Arc<UserLimit>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).get(user_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove records with no active requests in either direction whose
    /// grace period since the last request end has elapsed.
    pub fn sweep(&self, now_ms: u64) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::sweep_locked(&mut state, now_ms);
    }

    fn sweep_locked(state: &mut AHashMap<String, Arc<UserLimit>>, now_ms: u64) {
        state.retain(|user_key, record| {
            let download = record.download.active_requests();
            let upload = record.upload.active_requests();
            if download < 0 || upload < 0 {
                warn!("negative active request count for {user_key}: dwn={download} up={upload}");
            }
            if download > 0 || upload > 0 {
                return true;
            }
            now_ms.saturating_sub(record.last_request_end_tick()) < SWEEP_MIN_MS_SINCE_REQUEST_END
        });
    }

    /// Visit every record under the shared lock.
    pub fn for_each(&self, mut f: impl FnMut(&str, &UserLimit)) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        for (user_key, record) in state.iter() {
            f(user_key, record);
        }
    }

    /// Append up to `max_rows` CSV rows to `out`, resuming after `*skip`
    /// already-emitted rows. Returns true once the dump is complete.
    ///
    /// The header is emitted on the first invocation (`*skip == 0`). Rows
    /// are stable across invocations as long as the table is not mutated in
    /// between; concurrent mutation degrades to a best-effort dump.
    pub fn dump_csv(&self, skip: &mut usize, max_rows: usize, out: &mut String) -> bool {
        if *skip == 0 {
            out.push_str(
                "user_key,last_request_end_tick,\
                 up_limit_received,up_limit,up_limit_timestamp,up_active_requests,\
                 dwn_limit_received,dwn_limit,dwn_limit_timestamp,dwn_active_requests\n",
            );
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let total = state.len();
        for (user_key, record) in state.iter().skip(*skip).take(max_rows) {
            let _ = write!(out, "{user_key},{},", record.last_request_end_tick());
            Self::append_direction_csv(out, &record.upload);
            out.push(',');
            Self::append_direction_csv(out, &record.download);
            out.push('\n');
            *skip += 1;
        }
        *skip >= total
    }

    fn append_direction_csv(out: &mut String, limit: &DirectionLimit) {
        let _ = write!(
            out,
            "{},{},{},{}",
            u8::from(limit.limit_received()),
            limit.bytes_per_second(),
            limit.limit_timestamp(),
            limit.active_requests()
        );
    }
}
