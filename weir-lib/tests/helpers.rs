//! Shared mocks for the store-facing tests.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use weir_lib::config::AggregatorConfig;
use weir_lib::store::{Resolver, StoreTransport, TransportEvent};

/// Scripted transport: records submitted commands and connection calls,
/// plays back queued event batches from `drain`.
#[derive(Default)]
pub struct MockTransportState {
    pub commands: Vec<String>,
    pub connect_calls: usize,
    pub disconnect_calls: usize,
    pub events: Vec<Vec<TransportEvent>>,
    pub fail_connects: bool,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockTransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_events(&self, events: Vec<TransportEvent>) {
        self.lock().events.push(events);
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    /// Make every `start_connect` fail synchronously.
    pub fn fail_connects(&self) {
        self.lock().fail_connects = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreTransport for MockTransport {
    fn start_connect(&mut self, _host: &str, _port: u16) -> weir_lib::Result<()> {
        let mut state = self.lock();
        state.connect_calls += 1;
        if state.fail_connects {
            return Err(weir_lib::WeirError::Store("connection refused".to_string()));
        }
        Ok(())
    }

    fn submit(&mut self, command: &str) -> weir_lib::Result<()> {
        self.lock().commands.push(command.to_string());
        Ok(())
    }

    fn drain(&mut self) -> Vec<TransportEvent> {
        let mut state = self.lock();
        if state.events.is_empty() {
            Vec::new()
        } else {
            state.events.remove(0)
        }
    }

    fn start_disconnect(&mut self) {
        self.lock().disconnect_calls += 1;
    }
}

/// Resolver returning a configurable address list, or an error when empty.
#[derive(Clone, Default)]
pub struct MockResolver {
    pub addrs: Arc<Mutex<Vec<IpAddr>>>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockResolver {
    pub fn new(addrs: Vec<IpAddr>) -> Self {
        Self { addrs: Arc::new(Mutex::new(addrs)), calls: Arc::new(Mutex::new(0)) }
    }

    pub fn set_addrs(&self, addrs: Vec<IpAddr>) {
        *self.addrs.lock().unwrap_or_else(PoisonError::into_inner) = addrs;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Resolver for MockResolver {
    fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let addrs = self.addrs.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if addrs.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }
}

pub fn test_config(endpoint: &str) -> AggregatorConfig {
    AggregatorConfig {
        port: 0,
        num_of_syslog_servers: 1,
        msg_queue_size: 64,
        endpoint: endpoint.to_string(),
        redis_server: "store.example:6379".to_string(),
        redis_qos_ttl: 2,
        redis_qos_conn_ttl: 60,
        redis_check_conn_interval_sec: 5,
        metrics_batch_count: 250_000,
        metrics_batch_period_msec: 31,
        log_file_name: None,
        access_log_file_name: None,
        log_level: "info".to_string(),
    }
}
