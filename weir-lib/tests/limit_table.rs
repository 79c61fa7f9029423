use weir_lib::limit::{Direction, UserLimitTable};

#[test]
fn test_shares_are_monotone_in_timestamp() {
    let table = UserLimitTable::new();
    table.ingest_share(10, "alice", Direction::Upload, 100);
    table.ingest_share(5, "alice", Direction::Upload, 50);

    let record = table.get("alice").expect("record exists");
    assert_eq!(record.upload.bytes_per_second(), 100);
    assert_eq!(record.upload.limit_timestamp(), 10);

    // An equal timestamp may overwrite, a newer one always does.
    table.ingest_share(10, "alice", Direction::Upload, 70);
    assert_eq!(record.upload.bytes_per_second(), 70);
    table.ingest_share(20, "alice", Direction::Upload, 90);
    assert_eq!(record.upload.bytes_per_second(), 90);
}

#[test]
fn test_shares_are_clamped_to_u32() {
    let table = UserLimitTable::new();
    table.ingest_share(1, "alice", Direction::Download, 5_000_000_000);
    let record = table.get("alice").expect("record exists");
    assert_eq!(record.download.bytes_per_second(), u32::MAX);
}

#[test]
fn test_directions_are_independent() {
    let table = UserLimitTable::new();
    table.ingest_share(1, "alice", Direction::Upload, 111);
    table.ingest_share(1, "alice", Direction::Download, 222);

    let record = table.get("alice").expect("record exists");
    assert_eq!(record.upload.bytes_per_second(), 111);
    assert_eq!(record.download.bytes_per_second(), 222);
    assert!(record.upload.limit_received());
    assert!(record.download.limit_received());
}

#[test]
fn test_attach_detach_conservation() {
    let table = UserLimitTable::new();
    let record = table.on_attach("alice", Direction::Download, 0);
    table.on_attach("alice", Direction::Download, 0);
    assert_eq!(record.download.active_requests(), 2);
    assert_eq!(record.upload.active_requests(), 0);

    assert_eq!(table.on_detach(&record, Direction::Download, 100), 1);
    assert_eq!(table.on_detach(&record, Direction::Download, 200), 0);
    assert_eq!(record.last_request_end_tick(), 200);
}

#[test]
fn test_sweep_respects_grace_period() {
    let table = UserLimitTable::new();
    let record = table.on_attach("alice", Direction::Upload, 0);
    table.on_detach(&record, Direction::Upload, 1000);

    // Within the grace period the record survives even with no requests.
    table.sweep(1500);
    assert!(table.get("alice").is_some());

    table.sweep(7000);
    assert!(table.get("alice").is_none());
}

#[test]
fn test_sweep_keeps_active_users() {
    let table = UserLimitTable::new();
    let _record = table.on_attach("alice", Direction::Upload, 0);
    table.sweep(1_000_000);
    assert!(table.get("alice").is_some());
}

#[test]
fn test_attach_sweeps_at_most_every_thirty_seconds() {
    let table = UserLimitTable::new();
    let record = table.on_attach("alice", Direction::Upload, 0);
    table.on_detach(&record, Direction::Upload, 0);

    // alice is sweepable from tick 5000, but the opportunistic sweep ran at
    // tick 0 and won't run again before tick 30000.
    table.on_attach("bob", Direction::Upload, 10_000);
    assert!(table.get("alice").is_some());

    table.on_attach("carol", Direction::Upload, 31_000);
    assert!(table.get("alice").is_none());
}

#[test]
fn test_record_handle_survives_sweep() {
    let table = UserLimitTable::new();
    let record = table.on_attach("alice", Direction::Upload, 0);
    table.on_detach(&record, Direction::Upload, 0);
    table.sweep(60_000);

    assert!(table.get("alice").is_none());
    // The stream's handle still reads coherent state.
    assert_eq!(record.upload.active_requests(), 0);
}

#[test]
fn test_csv_dump_single_row() {
    let table = UserLimitTable::new();
    table.ingest_share(7, "alice", Direction::Upload, 2048);

    let mut out = String::new();
    let mut skip = 0;
    assert!(table.dump_csv(&mut skip, 100, &mut out));

    let mut lines = out.lines();
    let header = lines.next().expect("header row");
    assert!(header.starts_with("user_key,last_request_end_tick,up_limit_received"));
    assert_eq!(lines.next(), Some("alice,0,1,2048,7,0,0,0,0,0"));
    assert_eq!(lines.next(), None);
}

#[test]
fn test_csv_dump_is_resumable() {
    let table = UserLimitTable::new();
    for user in ["alice", "bob", "carol"] {
        table.ingest_share(1, user, Direction::Download, 1024);
    }

    let mut skip = 0;
    let mut chunks = Vec::new();
    loop {
        let mut out = String::new();
        let done = table.dump_csv(&mut skip, 1, &mut out);
        chunks.push(out);
        if done {
            break;
        }
    }

    let all: String = chunks.concat();
    let rows: Vec<&str> = all.lines().collect();
    // One header plus one row per user, each user exactly once.
    assert_eq!(rows.len(), 4);
    for user in ["alice", "bob", "carol"] {
        assert_eq!(rows.iter().filter(|row| row.starts_with(&format!("{user},"))).count(), 1);
    }
}
