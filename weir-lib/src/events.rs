//! Event lines exchanged between the enforcer and the aggregator.
//!
//! Each line is shipped as one UDP datagram. Fields are separated by
//! [`DELIMITER`] and the leading token identifies the shape.

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

pub const DELIMITER: &str = "~|~";

pub const REQ_PREFIX: &str = "req~|~";
pub const REQ_END_PREFIX: &str = "req_end~|~";
pub const DATA_XFER_PREFIX: &str = "data_xfer~|~";
pub const ACTIVE_REQS_PREFIX: &str = "active_reqs~|~";

/// Destination for enforcer event lines.
///
/// The production sink ships each line as one datagram to the aggregator;
/// tests collect lines in memory instead.
pub trait EventSink: Send + Sync {
    fn emit(&self, line: &str);
}

/// Sink sending each line as a UDP datagram to a fixed target.
pub struct UdpEventSink {
    socket: UdpSocket,
}

impl UdpEventSink {
    pub fn connect(target: &str) -> crate::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(target)?;
        Ok(Self { socket })
    }
}

impl EventSink for UdpEventSink {
    fn emit(&self, line: &str) {
        // Delivery is best-effort; the aggregator tolerates missing events.
        if let Err(e) = self.socket.send(line.as_bytes()) {
            debug!("failed to send event line: {e}");
        }
    }
}

/// Sink that stores emitted lines in memory.
#[derive(Debug, Default)]
pub struct VecEventSink {
    lines: Mutex<Vec<String>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.lines.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, line: &str) {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).push(line.to_string());
    }
}

#[allow(clippy::too_many_arguments)]
pub fn format_req(
    remote: SocketAddrV4,
    user_key: &str,
    verb: &str,
    direction: &str,
    instance_id: &str,
    active_requests: i32,
    request_class: &str,
) -> String {
    format!(
        "req{DELIMITER}{remote}{DELIMITER}{user_key}{DELIMITER}{verb}{DELIMITER}{direction}\
         {DELIMITER}{instance_id}{DELIMITER}{active_requests}{DELIMITER}{request_class}"
    )
}

pub fn format_req_end(
    remote: SocketAddrV4,
    user_key: &str,
    verb: &str,
    direction: &str,
    instance_id: &str,
    active_requests: i32,
) -> String {
    format!(
        "req_end{DELIMITER}{remote}{DELIMITER}{user_key}{DELIMITER}{verb}{DELIMITER}{direction}\
         {DELIMITER}{instance_id}{DELIMITER}{active_requests}"
    )
}

pub fn format_data_xfer(remote: SocketAddrV4, user_key: &str, direction: &str, bytes: u64) -> String {
    format!("data_xfer{DELIMITER}{remote}{DELIMITER}{user_key}{DELIMITER}{direction}{DELIMITER}{bytes}")
}

pub fn format_active_reqs(instance_id: &str, user_key: &str, direction: &str, count: i32) -> String {
    format!("active_reqs{DELIMITER}{instance_id}{DELIMITER}{user_key}{DELIMITER}{direction}{DELIMITER}{count}")
}

pub fn format_throttle(timestamp_usec: u64, direction: &str, user_key: &str) -> String {
    format!("weir-throttle{DELIMITER}{timestamp_usec}{DELIMITER}user_bnd_{direction}{DELIMITER}{user_key}")
}

/// Identifier for one proxy listener: `<peer-name>-<port>`.
///
/// Dash is the field separator in downstream store keys, so any underscore
/// in the peer name is remapped to a dash.
pub fn instance_id(peer_name: &str, port: u16) -> String {
    format!("{peer_name}-{port}").replace('_', "-")
}

/// Local peer name used when none is configured.
pub fn local_peer_name() -> String {
    if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
