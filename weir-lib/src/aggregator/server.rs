//! Per-worker wiring of socket, queue, processor and producer loop.

use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::SystemClock;
use crate::config::AggregatorConfig;
use crate::shutdown::StopSignal;
use crate::store::{RespTransport, StoreClient, SystemResolver};

use super::access_log::AccessLog;
use super::processor::Processor;
use super::receiver::{create_socket, run_producer, set_recv_buffer_size};

// How often the producer loop re-checks the stop signal while idle.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Run one aggregator worker until `stop` is requested or a socket error is
/// fatal. Each worker is an independent pipeline: its own socket (shared
/// port), queue, consumer and store connection.
pub fn run_worker(
    config: &AggregatorConfig,
    worker_id: usize,
    stop: Arc<StopSignal>,
) -> crate::Result<()> {
    info!("started syslog worker {worker_id} with pid {}", std::process::id());

    let socket = create_socket(config.port)?;
    let buffer_len = set_recv_buffer_size(&socket)?;
    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

    // Shared queue between the producer (this thread) and the consumer.
    // Exactly one of each; a second producer would need a different queue.
    let (sender, receiver) = mpsc::sync_channel(config.msg_queue_size);

    let access_log = AccessLog::open(config.access_log_file_name.as_deref())?;

    let (redis_host, redis_port) = config.redis_host_port()?;
    let store = StoreClient::new(
        &redis_host,
        redis_port,
        Box::new(RespTransport::new()),
        Arc::new(SystemResolver),
    );

    let processor =
        Processor::new(config, worker_id, receiver, store, Arc::new(SystemClock));
    let processor_handle = processor.start(Arc::clone(&stop));

    // Read incoming proxy messages until shutdown and dispatch to the queue.
    let result = run_producer(&socket, buffer_len, &sender, &access_log, worker_id, &stop);

    // Let the consumer see a disconnected queue while it drains.
    drop(sender);
    drop(processor_handle);
    result
}
