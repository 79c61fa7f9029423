//! Message consumer: parse, coalesce, flush to the store.

use ahash::AHashSet;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use tracing::info;

use crate::clock::{epoch_secs, Clock};
use crate::config::AggregatorConfig;
use crate::events::{ACTIVE_REQS_PREFIX, DATA_XFER_PREFIX, REQ_END_PREFIX, REQ_PREFIX};
use crate::shutdown::StopSignal;
use crate::store::StoreClient;

use super::coalesce::CommandBucket;
use super::parser;
use super::STATS_LOG_INTERVAL;

const DEQUEUE_TIMEOUT: Duration = Duration::from_micros(100);

/// Turns enforcer event lines into batched store updates.
///
/// The processor must stay on a single thread: the message queue has exactly
/// one consumer, and the store client's pipeline may only be driven from the
/// thread that submits to it. [`Processor::start`] spawns that thread plus
/// the connection watcher.
pub struct Processor {
    endpoint: String,
    worker_id: usize,
    clock: Arc<dyn Clock>,
    queue: Receiver<String>,
    store: StoreClient,
    bucket: CommandBucket,
    qos_ttl: Duration,
    conn_ttl_secs: u64,
    check_conn_interval: Duration,
    batch_count: usize,
    batch_period: Duration,
    last_flush_time: SystemTime,
    last_connect_time: SystemTime,
}

impl Processor {
    pub fn new(
        config: &AggregatorConfig,
        worker_id: usize,
        queue: Receiver<String>,
        store: StoreClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            endpoint: config.endpoint.clone(),
            worker_id,
            clock,
            queue,
            store,
            bucket: CommandBucket::new(),
            qos_ttl: Duration::from_secs(config.redis_qos_ttl),
            conn_ttl_secs: config.redis_qos_conn_ttl,
            check_conn_interval: Duration::from_secs(config.redis_check_conn_interval_sec),
            batch_count: config.metrics_batch_count,
            batch_period: Duration::from_millis(config.metrics_batch_period_msec),
            last_flush_time: now,
            last_connect_time: now,
        }
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut StoreClient {
        &mut self.store
    }

    pub fn bucket(&self) -> &CommandBucket {
        &self.bucket
    }

    /// Start the consumer and watcher threads. The returned handle stops and
    /// joins both on drop, consumer first.
    pub fn start(mut self, stop: Arc<StopSignal>) -> ProcessorHandle {
        let probe = self.store.probe();
        let check_conn_interval = self.check_conn_interval;

        let consumer_stop = Arc::clone(&stop);
        let consumer = std::thread::spawn(move || self.run(&consumer_stop));

        let watcher_stop = Arc::clone(&stop);
        let watcher = std::thread::spawn(move || {
            while !watcher_stop.wait_timeout(check_conn_interval) {
                probe.check_needs_reconnect();
            }
        });

        ProcessorHandle { stop, consumer: Some(consumer), watcher: Some(watcher) }
    }

    fn run(&mut self, stop: &StopSignal) {
        self.last_connect_time = self.clock.now();
        self.store.connect();

        let mut last_stats_time = std::time::Instant::now();
        while !stop.is_stopped() {
            match self.queue.recv_timeout(DEQUEUE_TIMEOUT) {
                Ok(message) => self.process_message(&message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.flush_if_due();

            if last_stats_time.elapsed() > STATS_LOG_INTERVAL {
                info!(
                    "msg consumer thread - pending events:{} worker_id:{}",
                    self.bucket.pending(),
                    self.worker_id
                );
                last_stats_time = std::time::Instant::now();
            }

            self.store.drain();
            self.store.reconnect_if_needed();
        }
    }

    /// Parse one event line and fold it into the current batch.
    pub fn process_message(&mut self, message: &str) {
        if message.starts_with(REQ_PREFIX) {
            if let Some(event) = parser::parse_req(message) {
                self.bucket.apply_req(&event, self.clock.now(), &self.endpoint);
            }
        } else if message.starts_with(DATA_XFER_PREFIX) {
            if let Some(event) = parser::parse_data_xfer(message) {
                self.bucket.apply_data_xfer(&event, self.clock.now());
            }
        } else if message.starts_with(ACTIVE_REQS_PREFIX) {
            if let Some(event) = parser::parse_active_reqs(message) {
                self.bucket.apply_active_reqs(&event, &self.endpoint);
            }
        } else if message.starts_with(REQ_END_PREFIX) {
            if let Some(event) = parser::parse_req_end(message) {
                self.bucket.apply_req_end(&event, &self.endpoint);
            }
        } else {
            info!("unrecognized message:{message}");
        }
    }

    /// Flush when enough events are pending or enough time has passed.
    pub fn flush_if_due(&mut self) {
        let now = self.clock.now();
        let flush_for_time = now
            .duration_since(self.last_flush_time)
            .map_or(false, |since| since > self.batch_period);
        let flush_for_count = self.bucket.pending() >= self.batch_count;
        if !flush_for_time && !flush_for_count {
            return;
        }
        self.last_flush_time = now;
        self.bucket.reset_pending();
        self.flush();
    }

    // Submit the batch when connected. When the store is down, counters the
    // store would already have expired are dropped, gauges are discarded
    // wholesale, and a connect is re-attempted at most once per check
    // interval.
    fn flush(&mut self) {
        let now = self.clock.now();
        if !self.store.connected() {
            let reconnect_due = now
                .duration_since(self.last_connect_time)
                .map_or(false, |since| since > self.check_conn_interval);
            if reconnect_due {
                self.last_connect_time = now;
                self.store.connect();
            }

            self.bucket.drop_commands_before(now - self.qos_ttl);
            self.bucket.clear_gauges();
            return;
        }

        let (commands, gauges) = self.bucket.take();

        let mut keys_found: AHashSet<String> = AHashSet::new();
        for (key, value) in &commands {
            // Example: HINCRBY verb_1599322430_user_AKIAIOSFODNN7EXAMPLE$dev.dc PUT 1
            // "$" separates the entity key from the endpoint.
            let store_key =
                format!("verb_{}_{}${}", epoch_secs(key.timestamp), key.user, self.endpoint);
            self.store.add_command(&format!("HINCRBY {store_key} {} {value}", key.category));

            if keys_found.insert(store_key.clone()) {
                let ttl = self.qos_ttl.as_secs();
                self.store.add_command(&format!("EXPIRE {store_key} {ttl}"));
            }
        }

        for (key, value) in &gauges {
            self.store.add_command(&format!("SET {key} {value} EX {}", self.conn_ttl_secs));
        }
    }
}

/// Stops and joins the processor threads on drop.
pub struct ProcessorHandle {
    stop: Arc<StopSignal>,
    consumer: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for ProcessorHandle {
    fn drop(&mut self) {
        self.stop.request_stop();
        // The consumer owns the store pipeline; join it before the watcher
        // so nothing races shutdown of the shared probe state.
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }
}
