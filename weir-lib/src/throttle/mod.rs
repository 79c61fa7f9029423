//! Client-connection throttling driven by controller violation policies.
//!
//! The controller observes per-user usage in the shared store and, when a
//! user exceeds their allocation, installs a violation policy here (one per
//! direction). While a policy is fresh, [`ThrottleTable::speed_throttle`]
//! confines the user's connections to an "allowed run time" inside every
//! wall-clock second; the allowance doubles each second the policy ages so
//! the squeeze relaxes unless the controller keeps renewing it.

use ahash::AHashMap;
use rand::Rng;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{epoch_parts, Clock, SystemClock};
use crate::limit::Direction;
use crate::shutdown::StopSignal;

pub const UNIT_USECS_IN_SEC: u64 = 1_000_000;
const USECS_IN_MILLISEC: u64 = 1_000;

// Throttling backoff settings:
pub const BACKOFF_WINDOW_EPOCHS: u64 = 6;
pub const MIN_RUN_TIME_USEC: u64 = 50 * USECS_IN_MILLISEC;
const DIFF_RATIO_LOW_MARK_TO_JITTER: f32 = 1.5;
const DEFAULT_BASE_JITTER_RANGE_MS: u32 = 2;

const STALE_POLICY_AGE_SEC: u64 = 120;
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(60);

/// Verdict for one payload chunk of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Throttle,
    NoThrottle,
}

/// One violation policy for a user and direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlePolicy {
    received_epoch_sec: u64,
    diff_ratio: f32,
    previous_diff_ratio: f32,
    elapsed_usec_in_the_epoch: u64,
    allowed_run_time_usec: u64,
}

impl ThrottlePolicy {
    fn age_epochs(&self, curr_sec: u64) -> u64 {
        // A wall clock stepping backwards makes the policy look like it came
        // from the future; treat it as freshly received rather than invalid.
        curr_sec.saturating_sub(self.received_epoch_sec)
    }

    fn is_valid(&self, curr_sec: u64) -> bool {
        self.age_epochs(curr_sec) <= BACKOFF_WINDOW_EPOCHS
    }

    fn compute_allowed_run_time(&mut self, curr_sec: u64) {
        let age = self.age_epochs(curr_sec);
        if age == 0 {
            self.allowed_run_time_usec = 0;
            return;
        }
        if age > BACKOFF_WINDOW_EPOCHS {
            self.allowed_run_time_usec = UNIT_USECS_IN_SEC;
            return;
        }
        let base = if self.diff_ratio > 0.0 {
            (self.elapsed_usec_in_the_epoch as f64 / f64::from(self.diff_ratio)) as u64
        } else {
            MIN_RUN_TIME_USEC
        };
        let allowed = base.max(MIN_RUN_TIME_USEC).saturating_mul(1 << (age - 1));
        self.allowed_run_time_usec = allowed.min(UNIT_USECS_IN_SEC);
    }

    pub fn allowed_run_time_usec(&self) -> u64 {
        self.allowed_run_time_usec
    }

    pub fn received_epoch_sec(&self) -> u64 {
        self.received_epoch_sec
    }

    pub fn diff_ratio(&self) -> f32 {
        self.diff_ratio
    }

    pub fn previous_diff_ratio(&self) -> f32 {
        self.previous_diff_ratio
    }
}

fn ip_port_key(addr: SocketAddrV4) -> u64 {
    u64::from(u32::from(*addr.ip())) << 32 | u64::from(addr.port())
}

// Both connection maps mutate together, so they live under one lock.
#[derive(Debug, Default)]
struct ConnMaps {
    key_by_ip_port: AHashMap<u64, String>,
    conns_by_key: AHashMap<String, u32>,
}

/// Maps from connection to user key and from user key to violation policy,
/// one policy map per direction.
///
/// Read paths (`speed_throttle`, `key_for`) take the shared side of the
/// locks; writes and the sweeper take the exclusive side in short bursts.
pub struct ThrottleTable {
    conns: RwLock<ConnMaps>,
    upload_policies: RwLock<AHashMap<String, ThrottlePolicy>>,
    download_policies: RwLock<AHashMap<String, ThrottlePolicy>>,
    base_jitter_range_ms: AtomicU32,
    clock: Arc<dyn Clock>,
}

impl Default for ThrottleTable {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl ThrottleTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            conns: RwLock::default(),
            upload_policies: RwLock::default(),
            download_policies: RwLock::default(),
            base_jitter_range_ms: AtomicU32::new(DEFAULT_BASE_JITTER_RANGE_MS),
            clock,
        }
    }

    fn policies(&self, direction: Direction) -> &RwLock<AHashMap<String, ThrottlePolicy>> {
        match direction {
            Direction::Upload => &self.upload_policies,
            Direction::Download => &self.download_policies,
        }
    }

    /// Map a client connection to its user key and count the connection.
    ///
    /// With HTTP keep-alive the same `ip:port` can be reused across keys;
    /// replacing the mapping is all that is needed.
    pub fn set_ip_port_key(&self, addr: SocketAddrV4, user_key: &str) {
        if user_key.is_empty() {
            warn!("empty user key used to map a connection");
            return;
        }
        debug!("set_ip_port_key: addr={addr} key={user_key}");

        let mut conns = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        conns.key_by_ip_port.insert(ip_port_key(addr), user_key.to_string());
        *conns.conns_by_key.entry(user_key.to_string()).or_insert(0) += 1;
    }

    /// Drop a connection's mapping and its count against the user.
    pub fn request_end(&self, addr: SocketAddrV4) {
        let mut conns = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        let Some(user_key) = conns.key_by_ip_port.remove(&ip_port_key(addr)) else {
            return;
        };
        match conns.conns_by_key.get_mut(&user_key) {
            Some(0) | None => warn!("for {user_key} there seems to be no pending conn"),
            Some(1) => {
                conns.conns_by_key.remove(&user_key);
            }
            Some(count) => *count -= 1,
        }
    }

    pub fn key_for(&self, addr: SocketAddrV4) -> Option<String> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .key_by_ip_port
            .get(&ip_port_key(addr))
            .cloned()
    }

    pub fn connection_count(&self, user_key: &str) -> u32 {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .conns_by_key
            .get(user_key)
            .copied()
            .unwrap_or(0)
    }

    /// Install or refresh a violation policy.
    ///
    /// `epoch_us` is the controller's observation timestamp in microseconds;
    /// only the within-second fraction matters for the allowed run time. An
    /// existing policy's ratio is carried over as `previous_diff_ratio` so
    /// the jitter heuristic can see whether the violation is growing.
    pub fn set_throttle_epoch(
        &self,
        user_key: &str,
        epoch_us: u64,
        direction: Direction,
        diff_ratio: f32,
    ) {
        if user_key.is_empty() {
            warn!("empty user key used to set a throttle epoch");
            return;
        }
        let (curr_sec, _) = epoch_parts(self.clock.now());
        let mut value = ThrottlePolicy {
            received_epoch_sec: curr_sec,
            diff_ratio,
            previous_diff_ratio: 0.0,
            elapsed_usec_in_the_epoch: epoch_us % UNIT_USECS_IN_SEC,
            allowed_run_time_usec: 0,
        };
        debug!(
            "set throttle epoch: key={user_key} recv_epoch_us={epoch_us} curr_epoch={curr_sec} \
             elapsed_usec_in_the_epoch={} diff_ratio={diff_ratio}",
            value.elapsed_usec_in_the_epoch
        );

        let mut policies = self.policies(direction).write().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = policies.get(user_key) {
            value.previous_diff_ratio = found.diff_ratio;
        }
        policies.insert(user_key.to_string(), value);
    }

    /// Decide whether the given connection must pause right now.
    ///
    /// Returns [`ThrottleDecision::NoThrottle`] when no valid policy exists
    /// or when the current second's allowed run time has not yet been used
    /// up; in the latter case a small bounded jitter sleep may be taken to
    /// spread reawakening connections.
    pub fn speed_throttle(&self, addr: SocketAddrV4, direction: Direction) -> ThrottleDecision {
        let (curr_sec, elapsed_usec) = epoch_parts(self.clock.now());

        let Some(user_key) = self.key_for(addr) else {
            debug!("no user key mapped for {addr}");
            return ThrottleDecision::NoThrottle;
        };

        let found = {
            let policies = self.policies(direction).read().unwrap_or_else(PoisonError::into_inner);
            policies.get(&user_key).copied()
        };
        let Some(mut policy) = found else {
            return ThrottleDecision::NoThrottle;
        };
        if !policy.is_valid(curr_sec) {
            return ThrottleDecision::NoThrottle;
        }
        policy.compute_allowed_run_time(curr_sec);

        if elapsed_usec < policy.allowed_run_time_usec {
            let jitter_us = self.jitter_usec(&policy);
            if jitter_us > 0 {
                debug!("sleeping: jitter={jitter_us}us");
                std::thread::sleep(Duration::from_micros(jitter_us));
            }
            return ThrottleDecision::NoThrottle;
        }

        debug!(
            "slowing down: key={user_key} curr_epoch={curr_sec} addr={addr} direction={} \
             policy_epoch={} elapsed_in_epoch_us={elapsed_usec} allowed_run_time_us={} \
             diff_ratio={} num_conns={}",
            direction.as_str(),
            policy.received_epoch_sec,
            policy.allowed_run_time_usec,
            policy.diff_ratio,
            self.connection_count(&user_key)
        );
        ThrottleDecision::Throttle
    }

    // Jitter only when the violation is substantial or still growing;
    // connections inside their allowance otherwise resume in lockstep at
    // the second boundary.
    fn jitter_usec(&self, policy: &ThrottlePolicy) -> u64 {
        let jitter = policy.diff_ratio.max(policy.previous_diff_ratio)
            >= DIFF_RATIO_LOW_MARK_TO_JITTER
            || policy.diff_ratio - policy.previous_diff_ratio > 0.0;
        if !jitter {
            return 0;
        }
        let range_ms = u64::from(self.base_jitter_range_ms.load(Ordering::Relaxed));
        if range_ms == 0 {
            return 0;
        }
        rand::rng().random_range(0..range_ms) * USECS_IN_MILLISEC
    }

    pub fn set_jitter_range(&self, range_ms: u32) {
        self.base_jitter_range_ms.store(range_ms, Ordering::Relaxed);
        info!("jitter range has been set to {range_ms}ms");
    }

    /// Remove policies older than the stale age for one direction.
    pub fn sweep_direction(&self, direction: Direction) {
        let (curr_sec, _) = epoch_parts(self.clock.now());
        let mut policies = self.policies(direction).write().unwrap_or_else(PoisonError::into_inner);
        policies.retain(|_, policy| {
            curr_sec.saturating_sub(policy.received_epoch_sec) <= STALE_POLICY_AGE_SEC
        });
    }

    pub fn policy_count(&self, direction: Direction) -> usize {
        self.policies(direction).read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Snapshot of the stored policy for a user, if any.
    pub fn policy(&self, user_key: &str, direction: Direction) -> Option<ThrottlePolicy> {
        self.policies(direction)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_key)
            .copied()
    }

    /// The run time the user's connections would currently be allowed within
    /// each second, given the stored policy. `None` when no valid policy
    /// exists (the user is unthrottled).
    pub fn allowed_run_time(&self, user_key: &str, direction: Direction) -> Option<u64> {
        let (curr_sec, _) = epoch_parts(self.clock.now());
        let mut policy = self.policy(user_key, direction)?;
        if !policy.is_valid(curr_sec) {
            return None;
        }
        policy.compute_allowed_run_time(curr_sec);
        Some(policy.allowed_run_time_usec)
    }
}

/// Joins the sweeper thread on drop.
pub struct SweeperHandle {
    stop: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the background sweeper that removes stale policies, alternating
/// direction each period.
pub fn spawn_sweeper(table: Arc<ThrottleTable>, stop: Arc<StopSignal>) -> SweeperHandle {
    let thread_stop = Arc::clone(&stop);
    let handle = std::thread::spawn(move || {
        let mut direction = Direction::Download;
        loop {
            table.sweep_direction(direction);
            direction = match direction {
                Direction::Download => Direction::Upload,
                Direction::Upload => Direction::Download,
            };
            if thread_stop.wait_timeout(CLEANUP_PERIOD) {
                break;
            }
        }
    });
    SweeperHandle { stop, handle: Some(handle) }
}
