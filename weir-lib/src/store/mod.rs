//! Store client: pipelined command submission with reconnect on DNS change.
//!
//! The client wraps a [`StoreTransport`] in a connection state machine and
//! must only be used from one thread (the aggregator's consumer thread); the
//! watcher thread interacts exclusively with the shared [`ReconnectProbe`].

mod resp;
mod transport;

pub use resp::RespTransport;
pub use transport::{Resolver, StoreTransport, SystemResolver, TransportEvent};

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnecting,
    Disconnected,
    Connecting,
    Connected,
}

/// Monotonic transfer and connection counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    sent: AtomicU64,
    sent_failure: AtomicU64,
    recv: AtomicU64,
    recv_failure: AtomicU64,
    conns_requested: AtomicU64,
    conns_made: AtomicU64,
    conns_failed: AtomicU64,
    conns_success: AtomicU64,
    conn_drops: AtomicU64,
    reconnects: AtomicU64,
}

impl StoreStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn sent_failure(&self) -> u64 {
        self.sent_failure.load(Ordering::Relaxed)
    }

    pub fn recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    pub fn recv_failure(&self) -> u64 {
        self.recv_failure.load(Ordering::Relaxed)
    }

    pub fn conns_requested(&self) -> u64 {
        self.conns_requested.load(Ordering::Relaxed)
    }

    pub fn conns_made(&self) -> u64 {
        self.conns_made.load(Ordering::Relaxed)
    }

    pub fn conns_failed(&self) -> u64 {
        self.conns_failed.load(Ordering::Relaxed)
    }

    pub fn conns_success(&self) -> u64 {
        self.conns_success.load(Ordering::Relaxed)
    }

    pub fn conn_drops(&self) -> u64 {
        self.conn_drops.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared with the watcher thread.
///
/// The watcher periodically re-resolves the store host and compares the
/// answers against the peer IP of the live connection; a mismatch flags the
/// connection for replacement. Only the consumer thread acts on the flag.
pub struct ReconnectProbe {
    host: String,
    port: u16,
    peer_ip: Mutex<Option<IpAddr>>,
    needs_reconnect: AtomicBool,
    resolver: Arc<dyn Resolver>,
}

impl ReconnectProbe {
    fn new(host: String, port: u16, resolver: Arc<dyn Resolver>) -> Self {
        Self { host, port, peer_ip: Mutex::new(None), needs_reconnect: AtomicBool::new(false), resolver }
    }

    fn set_peer_ip(&self, peer: Option<IpAddr>) {
        *self.peer_ip.lock().unwrap_or_else(PoisonError::into_inner) = peer;
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        *self.peer_ip.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect.load(Ordering::SeqCst)
    }

    /// Re-resolve the host and flag the connection for replacement when no
    /// resolved address matches the connected peer. Resolution failures are
    /// logged and leave the flag unchanged ("no change known"). No-op while
    /// disconnected or already flagged.
    pub fn check_needs_reconnect(&self) {
        if self.needs_reconnect() {
            return;
        }
        let Some(peer) = self.peer_ip() else {
            return;
        };
        match self.resolver.resolve(&self.host, self.port) {
            Ok(addrs) => {
                if !addrs.contains(&peer) {
                    self.needs_reconnect.store(true, Ordering::SeqCst);
                }
            }
            Err(e) => {
                error!("failed to check connectivity to {}:{}: {e}", self.host, self.port);
            }
        }
    }
}

/// Connection to the shared key-value store.
pub struct StoreClient {
    conn_id: String,
    host: String,
    port: u16,
    state: ConnectionState,
    transport: Box<dyn StoreTransport>,
    probe: Arc<ReconnectProbe>,
    stats: Arc<StoreStats>,
}

impl StoreClient {
    pub fn new(
        host: &str,
        port: u16,
        transport: Box<dyn StoreTransport>,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            conn_id: format!("QoS({host}:{port})"),
            host: host.to_string(),
            port,
            state: ConnectionState::Disconnected,
            transport,
            probe: Arc::new(ReconnectProbe::new(host.to_string(), port, resolver)),
            stats: Arc::new(StoreStats::default()),
        }
    }

    pub fn probe(&self) -> Arc<ReconnectProbe> {
        Arc::clone(&self.probe)
    }

    pub fn stats(&self) -> Arc<StoreStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Initiate a connection attempt. A no-op (with a log) in any state but
    /// `Disconnected`.
    pub fn connect(&mut self) {
        StoreStats::incr(&self.stats.conns_requested);

        match self.state {
            ConnectionState::Connecting => {
                info!("waiting for pending connection attempt to {}", self.conn_id);
                return;
            }
            ConnectionState::Connected => {
                error!("already connected to {}", self.conn_id);
                return;
            }
            ConnectionState::Disconnecting => {
                info!("waiting for disconnection from {}", self.conn_id);
                return;
            }
            ConnectionState::Disconnected => {}
        }

        StoreStats::incr(&self.stats.conns_made);
        info!("initiating connection attempt to {}", self.conn_id);

        if let Err(e) = self.transport.start_connect(&self.host, self.port) {
            StoreStats::incr(&self.stats.conns_failed);
            error!("failed to connect to {}: {e}", self.conn_id);
            return;
        }
        self.state = ConnectionState::Connecting;
    }

    /// Queue one command onto the async pipeline.
    pub fn add_command(&mut self, command: &str) {
        debug!("store command: {command}");
        StoreStats::incr(&self.stats.sent);

        if let Err(e) = self.transport.submit(command) {
            // The transport will surface a disconnect eventually.
            error!("send to {} failed: {e}", self.conn_id);
            StoreStats::incr(&self.stats.sent_failure);
        }
    }

    /// Run the transport's event loop once without blocking.
    pub fn drain(&mut self) {
        for event in self.transport.drain() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => {
                StoreStats::incr(&self.stats.conns_success);
                self.state = ConnectionState::Connected;
                self.probe.set_peer_ip(Some(peer));
                info!("connected to {} with IP addr {peer}", self.conn_id);
            }
            TransportEvent::ConnectFailed { error } => {
                StoreStats::incr(&self.stats.conns_failed);
                self.state = ConnectionState::Disconnected;
                self.probe.set_peer_ip(None);
                error!("{} connect error: {error}", self.conn_id);
            }
            TransportEvent::Disconnected { error } => {
                self.state = ConnectionState::Disconnected;
                StoreStats::incr(&self.stats.conn_drops);
                self.probe.set_peer_ip(None);
                match error {
                    Some(error) => error!("{} connection failed: {error}", self.conn_id),
                    None => {
                        info!("{} reconnecting after deliberate disconnect", self.conn_id);
                        self.connect();
                    }
                }
            }
            TransportEvent::ReplyOk => {
                StoreStats::incr(&self.stats.recv);
            }
            TransportEvent::ReplyError { error } => {
                StoreStats::incr(&self.stats.recv);
                StoreStats::incr(&self.stats.recv_failure);
                error!("{} store reply error: {error}", self.conn_id);
            }
        }
    }

    /// Turn a pending reconnect flag into a disconnect. Runs on the consumer
    /// thread; the disconnect completion re-initiates the connect.
    pub fn reconnect_if_needed(&mut self) {
        if self.probe.needs_reconnect.swap(false, Ordering::SeqCst)
            && self.state == ConnectionState::Connected
        {
            self.state = ConnectionState::Disconnecting;
            StoreStats::incr(&self.stats.reconnects);
            self.transport.start_disconnect();
        }
    }
}
