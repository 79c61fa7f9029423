//! UDP ingress: socket setup and the producer loop.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::events::{ACTIVE_REQS_PREFIX, DATA_XFER_PREFIX, REQ_END_PREFIX, REQ_PREFIX};
use crate::shutdown::StopSignal;

use super::access_log::AccessLog;
use super::STATS_LOG_INTERVAL;

const RMEM_MAX_PATH: &str = "/proc/sys/net/core/rmem_max";
const MAX_UDP_RECV_BUFFER_SIZE: usize = 64 * 1024 * 1024;

fn rmem_max() -> usize {
    match std::fs::read_to_string(RMEM_MAX_PATH) {
        Ok(value) => match value.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                error!("failed to parse rmem_max: {e}");
                MAX_UDP_RECV_BUFFER_SIZE
            }
        },
        Err(e) => {
            error!("failed to read rmem_max: {e}");
            MAX_UDP_RECV_BUFFER_SIZE
        }
    }
}

/// Bind the ingest socket on all interfaces with port reuse enabled, so
/// several worker processes can share the port.
pub fn create_socket(port: u16) -> crate::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket)
}

/// Raise the socket's receive buffer and return its actual size.
///
/// The kernel doubles the value passed to `SO_RCVBUF` to leave room for its
/// bookkeeping, and reports the doubled value back; requesting twice
/// `rmem_max` therefore yields `rmem_max` of real datagram capacity, which
/// is the most the kernel will grant.
pub fn set_recv_buffer_size(socket: &Socket) -> crate::Result<usize> {
    let current = socket.recv_buffer_size()?;
    let desired = rmem_max().saturating_mul(2);
    if desired > current {
        socket.set_recv_buffer_size(desired)?;
    }
    let actual = socket.recv_buffer_size()?;

    info!("default UDP recv buf size {current} bytes");
    info!("max UDP recv buf size {desired} bytes");
    info!("new UDP recv buf size {actual} bytes");
    Ok(actual)
}

/// Where one datagram goes after framing is stripped.
#[derive(Debug, PartialEq, Eq)]
pub enum DatagramClass<'a> {
    /// An enforcer event line, starting at the recognized prefix.
    Event(&'a str),
    /// A JSON access-log line from the proxy.
    AccessLog(&'a str),
    /// Anything else logged by the proxy.
    Log(&'a str),
}

/// Classify a framing-stripped datagram by the first recognized event
/// prefix; the syslog header in front of the prefix is discarded.
pub fn classify(msg: &str) -> DatagramClass<'_> {
    const PREFIXES: [&str; 4] = [REQ_PREFIX, REQ_END_PREFIX, DATA_XFER_PREFIX, ACTIVE_REQS_PREFIX];
    for prefix in PREFIXES {
        if let Some(pos) = msg.find(prefix) {
            return DatagramClass::Event(&msg[pos..]);
        }
    }
    if msg.starts_with('{') {
        DatagramClass::AccessLog(msg)
    } else {
        DatagramClass::Log(msg)
    }
}

/// Receive datagrams until `stop` is requested, classifying each and
/// enqueueing event lines for the consumer.
///
/// `buffer_len` must be the socket's receive-buffer size so that a datagram
/// can never exceed the user-space buffer; a datagram that fills the buffer
/// exactly may have been truncated and is dropped. The socket should carry a
/// read timeout, which doubles as the stop-polling interval.
pub fn run_producer(
    socket: &UdpSocket,
    buffer_len: usize,
    queue: &SyncSender<String>,
    access_log: &AccessLog,
    worker_id: usize,
    stop: &StopSignal,
) -> crate::Result<()> {
    let mut buffer = vec![0u8; buffer_len];
    let mut total_msgs_processed = 0u64;
    let mut last_logged_msgs_processed = 0u64;
    let mut last_stats_time = Instant::now();

    while !stop.is_stopped() {
        let recv_len = match socket.recv_from(&mut buffer) {
            Ok((len, _)) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                error!("error when receiving data: {e}");
                return Err(e.into());
            }
        };

        if recv_len == 0 {
            continue;
        }

        let text = String::from_utf8_lossy(&buffer[..recv_len]);
        if recv_len == buffer.len() {
            // the data might be truncated
            error!("message is too big: {text}");
            continue;
        }

        let msg = text.trim_end_matches('\n');
        match classify(msg) {
            DatagramClass::Event(line) => {
                match queue.try_send(line.to_string()) {
                    Ok(()) => debug!("proxy logged command: {msg}"),
                    Err(TrySendError::Full(dropped)) => {
                        error!("queue is full, dropping message: {dropped}");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        error!("consumer is gone, stopping producer");
                        return Ok(());
                    }
                }
            }
            DatagramClass::AccessLog(line) => access_log.write_line(line),
            DatagramClass::Log(line) => info!("proxy logged message: {line}"),
        }

        total_msgs_processed += 1;
        if last_stats_time.elapsed() > STATS_LOG_INTERVAL {
            let new_msgs_processed = total_msgs_processed - last_logged_msgs_processed;
            info!(
                "msg producer thread - msgs processed since last log={new_msgs_processed}, \
                 worker_id={worker_id}"
            );
            last_logged_msgs_processed = total_msgs_processed;
            last_stats_time = Instant::now();
        }
    }
    Ok(())
}
