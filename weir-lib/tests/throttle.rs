use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use weir_lib::clock::ManualClock;
use weir_lib::limit::Direction;
use weir_lib::throttle::{ThrottleDecision, ThrottleTable};

fn addr(last_octet: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), port)
}

fn table_at(secs: u64) -> (Arc<ManualClock>, ThrottleTable) {
    let clock = Arc::new(ManualClock::at_epoch_secs(secs));
    let table = ThrottleTable::new(Arc::clone(&clock) as Arc<dyn weir_lib::clock::Clock>);
    (clock, table)
}

fn set_time(clock: &ManualClock, secs: u64, usec: u64) {
    clock.set(UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(usec));
}

#[test]
fn test_connection_mapping_and_counts() {
    let (_clock, table) = table_at(100);

    table.set_ip_port_key(addr(1, 5000), "alice");
    table.set_ip_port_key(addr(1, 5001), "alice");
    table.set_ip_port_key(addr(2, 5000), "bob");

    assert_eq!(table.key_for(addr(1, 5000)).as_deref(), Some("alice"));
    assert_eq!(table.connection_count("alice"), 2);
    assert_eq!(table.connection_count("bob"), 1);

    table.request_end(addr(1, 5000));
    assert_eq!(table.key_for(addr(1, 5000)), None);
    assert_eq!(table.connection_count("alice"), 1);

    table.request_end(addr(1, 5001));
    assert_eq!(table.connection_count("alice"), 0);
}

#[test]
fn test_keepalive_key_replacement() {
    let (_clock, table) = table_at(100);

    table.set_ip_port_key(addr(1, 5000), "alice");
    table.set_ip_port_key(addr(1, 5000), "bob");
    assert_eq!(table.key_for(addr(1, 5000)).as_deref(), Some("bob"));

    table.request_end(addr(1, 5000));
    assert_eq!(table.connection_count("bob"), 0);
}

#[test]
fn test_empty_key_is_ignored() {
    let (_clock, table) = table_at(100);
    table.set_ip_port_key(addr(1, 5000), "");
    assert_eq!(table.key_for(addr(1, 5000)), None);
}

#[test]
fn test_no_policy_means_no_throttle() {
    let (_clock, table) = table_at(100);
    table.set_ip_port_key(addr(1, 5000), "alice");
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Download), ThrottleDecision::NoThrottle);
    // Unmapped connections are never throttled either.
    assert_eq!(table.speed_throttle(addr(9, 9), Direction::Download), ThrottleDecision::NoThrottle);
}

#[test]
fn test_backoff_schedule() {
    let (clock, table) = table_at(100);
    table.set_ip_port_key(addr(1, 5000), "u");
    table.set_throttle_epoch("u", 750_000, Direction::Download, 2.0);

    // Age 0: no allowed run time at all, everything throttles.
    set_time(&clock, 100, 100_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), Some(0));
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Download), ThrottleDecision::Throttle);

    // Age 1: allowed = max(50ms, 750ms / 2.0) = 375ms per second.
    set_time(&clock, 101, 100_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), Some(375_000));
    assert_eq!(
        table.speed_throttle(addr(1, 5000), Direction::Download),
        ThrottleDecision::NoThrottle
    );
    set_time(&clock, 101, 500_000);
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Download), ThrottleDecision::Throttle);

    // Age 2 doubles the allowance.
    set_time(&clock, 102, 500_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), Some(750_000));

    // The allowance saturates at a full second.
    set_time(&clock, 103, 990_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), Some(1_000_000));
    assert_eq!(
        table.speed_throttle(addr(1, 5000), Direction::Download),
        ThrottleDecision::NoThrottle
    );

    // Past the backoff window the policy no longer applies.
    set_time(&clock, 107, 990_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), None);
    assert_eq!(
        table.speed_throttle(addr(1, 5000), Direction::Download),
        ThrottleDecision::NoThrottle
    );
}

#[test]
fn test_allowed_run_time_bounds() {
    let (clock, table) = table_at(200);
    // A tiny elapsed fraction with a huge ratio still yields the minimum.
    table.set_throttle_epoch("u", 1_000, Direction::Upload, 100.0);

    for age in 1..=6u64 {
        set_time(&clock, 200 + age, 0);
        let allowed = table.allowed_run_time("u", Direction::Upload).expect("valid policy");
        assert!((50_000..=1_000_000).contains(&allowed), "age {age}: allowed = {allowed}");
    }
}

#[test]
fn test_policy_carries_previous_ratio() {
    let (_clock, table) = table_at(100);
    table.set_throttle_epoch("u", 500_000, Direction::Download, 2.0);
    table.set_throttle_epoch("u", 600_000, Direction::Download, 3.5);

    let policy = table.policy("u", Direction::Download).expect("policy exists");
    assert_eq!(policy.diff_ratio(), 3.5);
    assert_eq!(policy.previous_diff_ratio(), 2.0);
    assert_eq!(policy.received_epoch_sec(), 100);
}

#[test]
fn test_directions_have_separate_policies() {
    let (clock, table) = table_at(100);
    table.set_ip_port_key(addr(1, 5000), "u");
    table.set_throttle_epoch("u", 750_000, Direction::Download, 2.0);

    set_time(&clock, 100, 900_000);
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Download), ThrottleDecision::Throttle);
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Upload), ThrottleDecision::NoThrottle);
}

#[test]
fn test_backwards_clock_treats_policy_as_fresh() {
    let (clock, table) = table_at(100);
    table.set_ip_port_key(addr(1, 5000), "u");
    table.set_throttle_epoch("u", 750_000, Direction::Download, 2.0);

    // Wall clock steps back: the policy looks like it came from the future.
    set_time(&clock, 95, 900_000);
    assert_eq!(table.allowed_run_time("u", Direction::Download), Some(0));
    assert_eq!(table.speed_throttle(addr(1, 5000), Direction::Download), ThrottleDecision::Throttle);
}

#[test]
fn test_sweeper_thread_removes_stale_policies() {
    let clock = Arc::new(ManualClock::at_epoch_secs(100));
    let table =
        Arc::new(ThrottleTable::new(Arc::clone(&clock) as Arc<dyn weir_lib::clock::Clock>));
    table.set_throttle_epoch("u", 0, Direction::Download, 2.0);
    set_time(&clock, 300, 0);

    // The sweeper's first pass covers the download direction immediately.
    let stop = weir_lib::shutdown::StopSignal::new();
    let handle = weir_lib::throttle::spawn_sweeper(Arc::clone(&table), stop);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while table.policy_count(Direction::Download) > 0 {
        assert!(std::time::Instant::now() < deadline, "sweeper did not run");
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(handle);
}

#[test]
fn test_sweep_removes_stale_policies() {
    let (clock, table) = table_at(100);
    table.set_throttle_epoch("u", 0, Direction::Download, 2.0);
    table.set_throttle_epoch("v", 0, Direction::Upload, 2.0);

    // Exactly at the stale age the policies survive.
    set_time(&clock, 220, 0);
    table.sweep_direction(Direction::Download);
    table.sweep_direction(Direction::Upload);
    assert_eq!(table.policy_count(Direction::Download), 1);
    assert_eq!(table.policy_count(Direction::Upload), 1);

    set_time(&clock, 221, 0);
    table.sweep_direction(Direction::Download);
    assert_eq!(table.policy_count(Direction::Download), 0);
    // The other direction is only swept on its own turn.
    assert_eq!(table.policy_count(Direction::Upload), 1);
    table.sweep_direction(Direction::Upload);
    assert_eq!(table.policy_count(Direction::Upload), 0);
}
