//! Coalescing of parsed events into store updates between flushes.

use ahash::AHashMap;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use crate::clock::epoch_secs;

use super::parser::{ActiveReqsEvent, DataXferEvent, ReqEndEvent, ReqEvent};

/// Key of one per-second counter in the store.
///
/// Commands differ only when they refer to events in different seconds, so
/// equality and hashing both round the timestamp down to the second; two
/// keys that differ only within a second collapse into one counter.
#[derive(Debug, Clone, Eq)]
pub struct CmdKey {
    pub user: String,
    pub timestamp: SystemTime,
    pub category: String,
}

impl PartialEq for CmdKey {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user
            && epoch_secs(self.timestamp) == epoch_secs(other.timestamp)
            && self.category == other.category
    }
}

impl Hash for CmdKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.user.hash(state);
        epoch_secs(self.timestamp).hash(state);
        self.category.hash(state);
    }
}

/// Counters and gauges accumulated since the last flush.
///
/// Counters are `(user, second, category) -> delta` increments; gauges are
/// `connection_key -> value` assignments where the latest event wins.
#[derive(Debug, Default)]
pub struct CommandBucket {
    commands: AHashMap<CmdKey, i64>,
    gauges: AHashMap<String, i64>,
    pending: usize,
}

fn conn_key(direction: &str, instance_id: &str, user_key: &str, endpoint: &str) -> String {
    // "$" separates the entity key from the endpoint; it is invalid in IPs,
    // access keys and bucket names.
    format!("conn_v2_user_{direction}_{instance_id}_{user_key}${endpoint}")
}

fn cmd_user(user_key: &str) -> String {
    format!("user_{user_key}")
}

impl CommandBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events accumulated since the last flush (or pending reset).
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn reset_pending(&mut self) {
        self.pending = 0;
    }

    pub fn apply_req(&mut self, event: &ReqEvent, now: SystemTime, endpoint: &str) {
        let user = cmd_user(&event.user_key);
        if !event.request_class.is_empty() {
            *self
                .commands
                .entry(CmdKey {
                    user: user.clone(),
                    timestamp: now,
                    category: event.request_class.clone(),
                })
                .or_insert(0) += 1;
        }
        *self
            .commands
            .entry(CmdKey { user, timestamp: now, category: event.verb.clone() })
            .or_insert(0) += 1;
        self.gauges.insert(
            conn_key(&event.direction, &event.instance_id, &event.user_key, endpoint),
            event.active_requests,
        );
        self.pending += 1;
    }

    pub fn apply_req_end(&mut self, event: &ReqEndEvent, endpoint: &str) {
        self.gauges.insert(
            conn_key(&event.direction, &event.instance_id, &event.user_key, endpoint),
            event.active_requests,
        );
        self.pending += 1;
    }

    pub fn apply_data_xfer(&mut self, event: &DataXferEvent, now: SystemTime) {
        if event.user_key.is_empty() {
            return;
        }
        let category = format!("bnd_{}", event.direction);
        *self
            .commands
            .entry(CmdKey { user: cmd_user(&event.user_key), timestamp: now, category })
            .or_insert(0) += event.bytes;
        self.pending += 1;
    }

    pub fn apply_active_reqs(&mut self, event: &ActiveReqsEvent, endpoint: &str) {
        self.gauges.insert(
            conn_key(&event.direction, &event.instance_id, &event.user_key, endpoint),
            event.active_requests,
        );
        self.pending += 1;
    }

    /// Take everything accumulated, leaving the bucket empty.
    pub fn take(&mut self) -> (AHashMap<CmdKey, i64>, AHashMap<String, i64>) {
        self.pending = 0;
        (std::mem::take(&mut self.commands), std::mem::take(&mut self.gauges))
    }

    /// Drop counter entries older than `cutoff`. Used while the store is
    /// unreachable: entries the store would already have expired are not
    /// worth keeping locally.
    pub fn drop_commands_before(&mut self, cutoff: SystemTime) {
        self.commands.retain(|key, _| key.timestamp >= cutoff);
    }

    pub fn clear_gauges(&mut self) {
        self.gauges.clear();
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub fn gauge_count(&self) -> usize {
        self.gauges.len()
    }
}
