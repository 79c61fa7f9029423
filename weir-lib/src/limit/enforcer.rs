//! The per-stream bandwidth filter.
//!
//! One [`Enforcer`] exists per proxy instance; the host proxy drives one
//! [`StreamState`] per request through attach → enable → headers →
//! payload* → detach. The enforcer never blocks: longer pauses are handed
//! back as ticks for the host to schedule.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::clock::epoch_micros;
use crate::events::{self, EventSink};
use crate::throttle::{ThrottleDecision, ThrottleTable};

use super::bandwidth::apply_bandwidth;
use super::table::{UserLimit, UserLimitTable};
use super::{Direction, HttpVerb};

pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
// Limit applied to users we have not yet received a share for.
pub const DEFAULT_UNKNOWN_USER_LIMIT: u32 = 10 * 1024 * 1024;
pub const DEFAULT_MINIMUM_LIMIT: u32 = 16 * 1024;

/// Options of the `weir` filter keyword.
#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    /// `<hostname>-<port>` with underscores remapped; identifies this proxy
    /// listener in event lines and share updates.
    pub instance_id: String,
    pub refresh_interval_ms: u64,
    pub unknown_user_limit: u32,
    pub minimum_limit: u32,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            instance_id: events::instance_id(&events::local_peer_name(), 0),
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            unknown_user_limit: DEFAULT_UNKNOWN_USER_LIMIT,
            minimum_limit: DEFAULT_MINIMUM_LIMIT,
        }
    }
}

/// Per-request filter state. Created on attach, touched only by the thread
/// owning the stream, dropped on detach.
#[derive(Debug)]
pub struct StreamState {
    remote: Option<SocketAddrV4>,
    limit: Option<Arc<UserLimit>>,
    user_key: Option<String>,
    request_class: Option<String>,
    direction: Option<Direction>,
    verb: HttpVerb,
    next_allowed_send_tick: Option<u64>,
    enabled: bool,
    headers_processed: bool,
}

impl StreamState {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn headers_processed(&self) -> bool {
        self.headers_processed
    }

    pub fn user_key(&self) -> Option<&str> {
        self.user_key.as_deref()
    }
}

/// What the host proxy should do with a payload chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadOutcome {
    pub bytes_to_forward: u64,
    /// Next tick at which the channel should be re-analysed; `None` means no
    /// deadline (forward-progress is driven by new data).
    pub next_analysis_tick: Option<u64>,
}

/// Process-wide enforcement state for one proxy instance.
///
/// There are no hidden singletons: the registry is built at startup and a
/// handle is passed into every operation.
pub struct Enforcer {
    config: EnforcerConfig,
    limits: UserLimitTable,
    throttle: Arc<ThrottleTable>,
    sink: Arc<dyn EventSink>,
    start: Instant,
}

impl Enforcer {
    pub fn new(
        config: EnforcerConfig,
        throttle: Arc<ThrottleTable>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { config, limits: UserLimitTable::new(), throttle, sink, start: Instant::now() }
    }

    pub fn config(&self) -> &EnforcerConfig {
        &self.config
    }

    pub fn limits(&self) -> &UserLimitTable {
        &self.limits
    }

    pub fn throttle(&self) -> &ThrottleTable {
        &self.throttle
    }

    /// Monotonic milliseconds since this enforcer was created.
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Apply a limit-share update from the controller. Updates addressed to
    /// other instances are ignored. Returns whether the update was applied.
    pub fn ingest_share(
        &self,
        timestamp: u64,
        user_key: &str,
        instance_id: &str,
        direction: &str,
        bytes_per_second: u64,
    ) -> bool {
        if instance_id != self.config.instance_id {
            return false;
        }
        let Some(direction) = Direction::parse(direction) else {
            warn!("limit-share update with unrecognised direction '{direction}'");
            return false;
        };
        debug!(
            "received a limit-share update for user {user_key}/{}: {bytes_per_second}bps",
            direction.as_str()
        );
        self.limits.ingest_share(timestamp, user_key, direction, bytes_per_second);
        true
    }

    /// Create filter state for a new stream.
    ///
    /// A stream without an IPv4 source cannot be identified, so its state
    /// forwards everything unchanged.
    pub fn attach(&self, remote: Option<SocketAddr>) -> StreamState {
        let remote = match remote {
            Some(SocketAddr::V4(addr)) => Some(addr),
            _ => None,
        };
        StreamState {
            remote,
            limit: None,
            user_key: None,
            request_class: None,
            direction: None,
            verb: HttpVerb::Other,
            next_allowed_send_tick: None,
            enabled: false,
            headers_processed: false,
        }
    }

    /// Enable limiting on a stream with the sampled
    /// `{user-key, operation-class, operation-direction}` arguments.
    ///
    /// Active requests are counted per enable and uncounted per detach, so a
    /// second enable on the same stream is ignored with a warning; honoring
    /// it would leave a permanent +1 in the active-request count.
    pub fn enable(
        &self,
        state: &mut StreamState,
        verb: HttpVerb,
        user_key: Option<&str>,
        request_class: Option<&str>,
        direction: Option<&str>,
    ) {
        if state.enabled {
            warn!(
                "attempt to activate weir twice on the same request, check for duplicate \
                 'activate-weir' lines in the config; activations beyond the first are ignored"
            );
            return;
        }

        if let Some(literal) = direction {
            match Direction::parse(literal) {
                Some(parsed) => state.direction = Some(parsed),
                None => {
                    warn!("unexpected bandwidth limit direction: {literal}");
                    return;
                }
            }
        }
        if state.direction.is_none() {
            warn!("activate-weir without an operation-direction, stream left unlimited");
            return;
        }

        let Some(user_key) = user_key.filter(|k| !k.is_empty()) else {
            warn!("activate-weir without a user key, stream left unlimited");
            return;
        };

        state.enabled = true;
        state.verb = verb;
        state.user_key = Some(user_key.to_string());
        state.request_class = request_class.map(str::to_string);

        let record = self.limits.on_attach(user_key, verb.direction(), self.now_ms());
        state.limit = Some(record);

        if let Some(remote) = state.remote {
            self.throttle.set_ip_port_key(remote, user_key);
        }
    }

    /// Record that request headers have been fully processed and emit the
    /// `req` event. Runs once per stream, on the request channel only.
    ///
    /// Header processing always runs after the frontend rules complete but
    /// not when the request was rejected; detach only reports streams that
    /// made it through here.
    pub fn http_headers(&self, state: &mut StreamState, is_request: bool) {
        if !(state.enabled && is_request && state.remote.is_some()) {
            return;
        }
        state.headers_processed = true;

        let (Some(remote), Some(limit), Some(user_key), Some(direction)) =
            (state.remote, state.limit.as_ref(), state.user_key.as_deref(), state.direction)
        else {
            debug_assert!(false, "enabled stream without limit state");
            return;
        };

        let active = limit.direction(state.verb.direction()).active_requests();
        let request_class = state.request_class.as_deref().unwrap_or("");
        self.sink.emit(&events::format_req(
            remote,
            user_key,
            state.verb.as_str(),
            direction.as_str(),
            &self.config.instance_id,
            active,
            request_class,
        ));
    }

    /// Decide how much of a payload chunk may be forwarded now.
    ///
    /// `analysis_deadline` is the channel's current re-analysis tick (if
    /// any); the returned outcome carries the maintained deadline.
    pub fn http_payload(
        &self,
        state: &mut StreamState,
        is_request: bool,
        len: u64,
        analysis_deadline: Option<u64>,
    ) -> PayloadOutcome {
        let direction = if is_request { Direction::Upload } else { Direction::Download };
        let now = self.now_ms();
        let mut bytes_to_forward = 0;

        debug_assert!(state.enabled, "payload filtering on a stream that was never enabled");
        if state.remote.is_none() || !state.enabled {
            bytes_to_forward = len;
        } else if len > 0 && state.next_allowed_send_tick.is_none_or(|tick| tick <= now) {
            state.next_allowed_send_tick = None;
            bytes_to_forward = self.limited_payload(state, direction, len, now);
        }

        let existing = analysis_deadline.filter(|tick| *tick > now);
        let next_analysis_tick = match (existing, state.next_allowed_send_tick) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        PayloadOutcome { bytes_to_forward, next_analysis_tick }
    }

    fn limited_payload(
        &self,
        state: &mut StreamState,
        direction: Direction,
        len: u64,
        now: u64,
    ) -> u64 {
        let (Some(remote), Some(limit), Some(declared)) =
            (state.remote, state.limit.clone(), state.direction)
        else {
            debug_assert!(false, "payload on an enabled stream without limit state");
            return len;
        };

        // Do not transfer any data while this connection is being throttled.
        if self.throttle.speed_throttle(remote, direction) == ThrottleDecision::Throttle {
            let direction_limit = limit.direction(direction);
            debug!("throttling {} connection to {remote}", declared.as_str());
            state.next_allowed_send_tick = Some(now + 1);

            if direction_limit.try_claim_throttle_log(now) {
                let timestamp_usec = epoch_micros(std::time::SystemTime::now());
                let user_key = state.user_key.as_deref().unwrap_or("");
                self.sink.emit(&events::format_throttle(
                    timestamp_usec,
                    declared.as_str(),
                    user_key,
                ));
            }
            return 0;
        }

        let direction_limit = limit.direction(direction);
        let share = if direction_limit.limit_received() {
            direction_limit.bytes_per_second()
        } else {
            self.config.unknown_user_limit
        };
        let share = share.max(self.config.minimum_limit);

        let result = apply_bandwidth(
            &direction_limit.counter,
            share,
            direction_limit.active_requests(),
            len,
        );
        if result.wait_ms > 0 {
            state.next_allowed_send_tick = Some(now + result.wait_ms);
        }
        if result.bytes_to_forward > 0 {
            self.data_transferred(remote, direction, result.bytes_to_forward);
        }
        result.bytes_to_forward
    }

    /// Emit a `data_xfer` event for bytes actually forwarded.
    pub fn data_transferred(&self, remote: SocketAddrV4, direction: Direction, bytes: u64) {
        let Some(user_key) = self.throttle.key_for(remote).filter(|k| !k.is_empty()) else {
            debug!(
                "no user key mapped for conn={remote} direction={} done={bytes}",
                direction.as_str()
            );
            return;
        };
        self.sink.emit(&events::format_data_xfer(remote, &user_key, direction.as_str(), bytes));
    }

    /// Tear down a stream's filter state.
    ///
    /// Accounting and the `req_end` event only apply to streams that were
    /// enabled and saw their headers; everything else was never counted.
    pub fn detach(&self, state: &mut StreamState) {
        if !(state.enabled && state.headers_processed) {
            return;
        }
        let (Some(remote), Some(limit), Some(user_key), Some(direction)) =
            (state.remote, state.limit.take(), state.user_key.take(), state.direction)
        else {
            debug_assert!(false, "detach of an enabled stream without limit state");
            return;
        };

        let active = self.limits.on_detach(&limit, state.verb.direction(), self.now_ms());
        self.sink.emit(&events::format_req_end(
            remote,
            &user_key,
            state.verb.as_str(),
            direction.as_str(),
            &self.config.instance_id,
            active,
        ));
        self.throttle.request_end(remote);
        state.enabled = false;
        state.headers_processed = false;
    }

    /// Emit one `active_reqs` event per user and direction with in-flight
    /// requests. Driven periodically so the store's TTL-based invalidation
    /// reflects liveness even when no new requests arrive.
    pub fn emit_active_request_refresh(&self) {
        self.limits.for_each(|user_key, record| {
            for direction in [Direction::Download, Direction::Upload] {
                let active = record.direction(direction).active_requests();
                if active > 0 {
                    self.sink.emit(&events::format_active_reqs(
                        &self.config.instance_id,
                        user_key,
                        direction.as_str(),
                        active,
                    ));
                }
            }
        });
    }
}
