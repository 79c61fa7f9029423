mod helpers;

use std::net::IpAddr;
use std::sync::Arc;

use helpers::{MockResolver, MockTransport};
use weir_lib::store::{ConnectionState, StoreClient, TransportEvent};

fn ip(s: &str) -> IpAddr {
    s.parse().expect("ip literal")
}

fn client(transport: &MockTransport, resolver: &MockResolver) -> StoreClient {
    StoreClient::new(
        "store.example",
        6379,
        Box::new(transport.clone()),
        Arc::new(resolver.clone()),
    )
}

#[test]
fn test_connect_transitions_through_connecting() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);

    assert_eq!(client.state(), ConnectionState::Disconnected);
    client.connect();
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(transport.connect_calls(), 1);

    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();
    assert!(client.connected());
    assert_eq!(client.probe().peer_ip(), Some(ip("1.1.1.1")));
    assert_eq!(client.stats().conns_success(), 1);
}

#[test]
fn test_connect_is_a_noop_outside_disconnected() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);

    client.connect();
    client.connect();
    // The second call is rejected while a connect is pending.
    assert_eq!(transport.connect_calls(), 1);
    assert_eq!(client.stats().conns_requested(), 2);
    assert_eq!(client.stats().conns_made(), 1);
}

#[test]
fn test_synchronous_connect_failure_stays_disconnected() {
    let transport = MockTransport::new();
    transport.fail_connects();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);

    client.connect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.stats().conns_failed(), 1);
}

#[test]
fn test_commands_and_reply_stats() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);
    client.connect();
    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();

    client.add_command("SET a 1");
    client.add_command("SET b 2");
    assert_eq!(transport.commands(), vec!["SET a 1", "SET b 2"]);
    assert_eq!(client.stats().sent(), 2);

    transport.push_events(vec![
        TransportEvent::ReplyOk,
        TransportEvent::ReplyError { error: "ERR oops".to_string() },
    ]);
    client.drain();
    assert_eq!(client.stats().recv(), 2);
    assert_eq!(client.stats().recv_failure(), 1);
}

#[test]
fn test_probe_ignores_dns_while_disconnected() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("2.2.2.2")]);
    let client = client(&transport, &resolver);

    client.probe().check_needs_reconnect();
    assert_eq!(resolver.calls(), 0);
    assert!(!client.probe().needs_reconnect());
}

#[test]
fn test_probe_keeps_flag_clear_when_ip_matches() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1"), ip("3.3.3.3")]);
    let mut client = client(&transport, &resolver);
    client.connect();
    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();

    client.probe().check_needs_reconnect();
    assert!(!client.probe().needs_reconnect());
}

#[test]
fn test_dns_failure_leaves_flag_unchanged() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![]);
    let mut client = client(&transport, &resolver);
    client.connect();
    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();

    client.probe().check_needs_reconnect();
    assert_eq!(resolver.calls(), 1);
    assert!(!client.probe().needs_reconnect());
}

#[test]
fn test_reconnect_on_ip_change() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);

    client.connect();
    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();
    assert!(client.connected());

    // DNS now points somewhere else.
    resolver.set_addrs(vec![ip("2.2.2.2")]);
    client.probe().check_needs_reconnect();
    assert!(client.probe().needs_reconnect());

    // The consumer thread turns the flag into a deliberate disconnect.
    client.reconnect_if_needed();
    assert_eq!(client.state(), ConnectionState::Disconnecting);
    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(client.stats().reconnects(), 1);
    assert!(!client.probe().needs_reconnect());

    // Disconnect completion re-initiates the connect; the new session's
    // peer IP is recorded.
    transport.push_events(vec![TransportEvent::Disconnected { error: None }]);
    client.drain();
    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(transport.connect_calls(), 2);

    transport.push_events(vec![TransportEvent::Connected { peer: ip("2.2.2.2") }]);
    client.drain();
    assert!(client.connected());
    assert_eq!(client.probe().peer_ip(), Some(ip("2.2.2.2")));
}

#[test]
fn test_error_disconnect_does_not_auto_reconnect() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);
    client.connect();
    transport.push_events(vec![TransportEvent::Connected { peer: ip("1.1.1.1") }]);
    client.drain();

    transport.push_events(vec![TransportEvent::Disconnected {
        error: Some("connection reset".to_string()),
    }]);
    client.drain();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.stats().conn_drops(), 1);
    // The flush path owns retry pacing for error drops.
    assert_eq!(transport.connect_calls(), 1);
}

#[test]
fn test_reconnect_flag_without_connection_is_cleared_quietly() {
    let transport = MockTransport::new();
    let resolver = MockResolver::new(vec![ip("1.1.1.1")]);
    let mut client = client(&transport, &resolver);

    // Flag can only be set while connected, but a disconnect may race it;
    // acting on it while disconnected must not do anything.
    client.reconnect_if_needed();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.disconnect_calls(), 0);
}
