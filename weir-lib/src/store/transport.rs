//! Transport seam between the store client and the wire.
//!
//! The original client is callback-driven; here the connect, disconnect and
//! reply callbacks become [`TransportEvent`] values returned from the
//! event-loop pump, which keeps the whole state machine on the consumer
//! thread. The traits exist so a mock transport and the real one
//! interchange in tests; the client never touches wire primitives directly.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

/// DNS resolution used for reconnect checks.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver. IPv4 results are preferred; IPv6 is the fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let v4: Vec<IpAddr> =
            addrs.iter().map(SocketAddr::ip).filter(IpAddr::is_ipv4).collect();
        let resolved = if v4.is_empty() {
            addrs.into_iter().map(|addr| addr.ip()).collect()
        } else {
            v4
        };
        if resolved.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(resolved)
    }
}

/// Events surfaced by a transport's [`StoreTransport::drain`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { peer: IpAddr },
    ConnectFailed { error: String },
    /// `error` is `None` for a deliberate disconnect.
    Disconnected { error: Option<String> },
    ReplyOk,
    ReplyError { error: String },
}

/// Pipelined command transport with asynchronous completion.
///
/// Commands are queued with [`submit`] and move on the wire during
/// [`drain`], which must never block; replies and connection transitions
/// come back as events from the same call.
///
/// [`submit`]: StoreTransport::submit
/// [`drain`]: StoreTransport::drain
pub trait StoreTransport: Send {
    /// Begin a connection attempt. Completion (or failure after this call
    /// returns `Ok`) arrives as a `Connected`/`ConnectFailed` event.
    fn start_connect(&mut self, host: &str, port: u16) -> crate::Result<()>;

    /// Queue one command onto the pipeline.
    fn submit(&mut self, command: &str) -> crate::Result<()>;

    /// Pump the transport once without blocking and collect events.
    fn drain(&mut self) -> Vec<TransportEvent>;

    /// Begin a deliberate disconnect; completion arrives as a
    /// `Disconnected { error: None }` event.
    fn start_disconnect(&mut self);
}
