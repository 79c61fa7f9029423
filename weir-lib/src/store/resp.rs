//! RESP transport over a non-blocking TCP stream.
//!
//! Commands are space-separated words (none of the keys weir writes contain
//! spaces) encoded as RESP arrays of bulk strings. Replies are parsed just
//! far enough to count them and to spot `-ERR` responses; their contents are
//! otherwise uninteresting to the pipeline.

use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::WeirError;

use super::transport::{StoreTransport, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

enum SocketState {
    Idle,
    // Connected at the TCP level; the Connected event is surfaced on the
    // next drain so the client's state machine sees Connecting first.
    Pending(TcpStream, IpAddr),
    Ready(TcpStream, IpAddr),
}

pub struct RespTransport {
    state: SocketState,
    out: Vec<u8>,
    inbuf: Vec<u8>,
    closing: bool,
}

impl Default for RespTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RespTransport {
    pub fn new() -> Self {
        Self { state: SocketState::Idle, out: Vec::new(), inbuf: Vec::new(), closing: false }
    }

    fn encode(command: &str, out: &mut Vec<u8>) {
        let args: Vec<&str> = command.split_whitespace().collect();
        out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn pump(&mut self, events: &mut Vec<TransportEvent>) {
        let SocketState::Ready(stream, _) = &mut self.state else {
            return;
        };

        // Flush as much of the pipeline as the socket accepts.
        let mut written = 0;
        while written < self.out.len() {
            match stream.write(&self.out[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    events.push(TransportEvent::Disconnected { error: Some(e.to_string()) });
                    self.reset();
                    return;
                }
            }
        }
        self.out.drain(..written);

        // Pull in whatever replies have arrived.
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    events.push(TransportEvent::Disconnected {
                        error: Some("connection closed by peer".to_string()),
                    });
                    self.reset();
                    return;
                }
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    events.push(TransportEvent::Disconnected { error: Some(e.to_string()) });
                    self.reset();
                    return;
                }
            }
        }

        while let Some((consumed, reply)) = parse_reply(&self.inbuf) {
            self.inbuf.drain(..consumed);
            match reply {
                Ok(()) => events.push(TransportEvent::ReplyOk),
                Err(error) => events.push(TransportEvent::ReplyError { error }),
            }
        }

        if self.closing && self.out.is_empty() {
            if let SocketState::Ready(stream, _) = &self.state {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.reset();
            events.push(TransportEvent::Disconnected { error: None });
        }
    }

    fn reset(&mut self) {
        self.state = SocketState::Idle;
        self.out.clear();
        self.inbuf.clear();
        self.closing = false;
    }
}

impl StoreTransport for RespTransport {
    fn start_connect(&mut self, host: &str, port: u16) -> crate::Result<()> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let addr = addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| WeirError::Store(format!("no addresses found for {host}")))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        self.out.clear();
        self.inbuf.clear();
        self.closing = false;
        self.state = SocketState::Pending(stream, addr.ip());
        Ok(())
    }

    fn submit(&mut self, command: &str) -> crate::Result<()> {
        match self.state {
            SocketState::Idle => Err(WeirError::Store("not connected".to_string())),
            SocketState::Pending(..) | SocketState::Ready(..) => {
                Self::encode(command, &mut self.out);
                Ok(())
            }
        }
    }

    fn drain(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let SocketState::Pending(..) = self.state {
            if let SocketState::Pending(stream, peer) =
                std::mem::replace(&mut self.state, SocketState::Idle)
            {
                events.push(TransportEvent::Connected { peer });
                self.state = SocketState::Ready(stream, peer);
            }
        }
        self.pump(&mut events);
        events
    }

    fn start_disconnect(&mut self) {
        self.closing = true;
    }
}

// Parse one complete reply from the front of `buf`. Returns the number of
// bytes consumed and whether the reply was an error.
fn parse_reply(buf: &[u8]) -> Option<(usize, Result<(), String>)> {
    let (line, header_len) = read_line(buf)?;
    let (kind, rest) = line.split_first()?;
    match kind {
        b'+' | b':' => Some((header_len, Ok(()))),
        b'-' => Some((header_len, Err(String::from_utf8_lossy(rest).into_owned()))),
        b'$' => {
            let len: i64 = std::str::from_utf8(rest).ok()?.parse().ok()?;
            if len < 0 {
                return Some((header_len, Ok(())));
            }
            let total = header_len + usize::try_from(len).ok()? + 2;
            (buf.len() >= total).then_some((total, Ok(())))
        }
        b'*' => {
            let count: i64 = std::str::from_utf8(rest).ok()?.parse().ok()?;
            let mut consumed = header_len;
            for _ in 0..count.max(0) {
                let (inner, _) = parse_reply(&buf[consumed..])?;
                consumed += inner;
            }
            Some((consumed, Ok(())))
        }
        _ => {
            // Unknown type byte; skip the line to avoid wedging the stream.
            Some((header_len, Ok(())))
        }
    }
}

// Returns the line without its CRLF plus the consumed length including CRLF.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}
