use std::net::SocketAddr;

use smartbeat::collection::{
    CreateOutcome, HeartbeatOutcome, MergeOutcome, ServiceCollection, ServiceKey, ServiceRecord,
};
use smartbeat::protocol::ServiceState;
use smartbeat::smartbeat::Smartbeat;

fn addr(last: u8) -> SocketAddr {
    SocketAddr::from(([192, 168, 1, last], 5000))
}

fn stamp(ms: u64) -> Smartbeat {
    Smartbeat {
        sec: 1_000 + ms / 1_000,
        usec: (ms % 1_000) * 1_000,
        checkpoint: 0,
    }
}

fn record(host: u8, id: u64, received_ms: u64) -> ServiceRecord {
    let key = ServiceKey {
        addr: addr(host),
        id,
        service_type: 1,
    };
    let mut record = ServiceRecord::new(key, format!("svc-{id}"));
    record.state = ServiceState::Running;
    record.activity_timeout_ms = 800;
    record.received_at = stamp(received_ms);
    record
}

#[test]
fn quiet_service_times_out_between_sweeps() {
    let services = ServiceCollection::new(10);
    services.create(record(1, 7, 0)).expect("create");

    assert_eq!(services.sweep(&stamp(700)).expect("sweep"), 0);
    assert_eq!(services.active_len().expect("active"), 1);

    assert_eq!(services.sweep(&stamp(900)).expect("sweep"), 1);
    assert_eq!(services.active_len().expect("active"), 0);
    let history = services.history().expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].inactive);
    assert_eq!(history[0].key.id, 7);
}

#[test]
fn duplicate_create_displaces_previous_registration() {
    let services = ServiceCollection::new(10);
    assert_eq!(services.create(record(1, 7, 0)).expect("create"), CreateOutcome::Appended);

    let mut replacement = record(1, 7, 10);
    replacement.state = ServiceState::Starting;
    assert_eq!(services.create(replacement).expect("create"), CreateOutcome::Displaced);

    let active = services.active().expect("active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].state, ServiceState::Starting);
    assert!(!active[0].displaced);

    let history = services.history().expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].displaced);
    assert_eq!(history[0].state, ServiceState::Running);

    let mut other_type = record(1, 7, 20);
    other_type.key.service_type = 2;
    assert_eq!(services.create(other_type).expect("create"), CreateOutcome::Appended);
    assert_eq!(services.create(record(2, 7, 20)).expect("create"), CreateOutcome::Appended);
    assert_eq!(services.active_len().expect("active"), 3);
    assert_eq!(services.history_len().expect("history"), 1);
}

#[test]
fn heartbeat_resurrects_timed_out_service() {
    let services = ServiceCollection::new(10);
    services.create(record(1, 7, 0)).expect("create");
    services.sweep(&stamp(900)).expect("sweep");

    let beat = Smartbeat {
        checkpoint: 12,
        ..stamp(950)
    };
    assert_eq!(
        services.heartbeat(addr(1), 7, beat, stamp(950)).expect("heartbeat"),
        HeartbeatOutcome::Resurrected
    );
    let active = services.active().expect("active");
    assert_eq!(active.len(), 1);
    assert!(!active[0].inactive);
    assert_eq!(active[0].smartbeat.checkpoint, 12);
    assert_eq!(services.history_len().expect("history"), 0);

    assert_eq!(services.sweep(&stamp(1_500)).expect("sweep"), 0);
}

#[test]
fn destroy_merged_into_history_stays_in_history() {
    let services = ServiceCollection::new(10);
    services.create(record(1, 7, 0)).expect("create");
    services.sweep(&stamp(900)).expect("sweep");

    let mut destroy = record(1, 7, 950);
    destroy.state = ServiceState::Stopped;
    assert_eq!(services.destroy(&destroy).expect("destroy"), MergeOutcome::MergedInHistory);
    assert_eq!(services.active_len().expect("active"), 0);
    assert_eq!(services.history().expect("history")[0].state, ServiceState::Stopped);
}

#[test]
fn history_keeps_only_most_recent_entries() {
    let services = ServiceCollection::new(2);
    for id in 1..=3 {
        services.create(record(1, id, 0)).expect("create");
    }
    for id in 1..=3 {
        let mut destroy = record(1, id, 100);
        destroy.state = ServiceState::Stopped;
        assert_eq!(services.destroy(&destroy).expect("destroy"), MergeOutcome::MovedToHistory);
    }

    let ids: Vec<u64> = services
        .history()
        .expect("history")
        .iter()
        .map(|r| r.key.id)
        .collect();
    assert_eq!(ids, vec![3, 2]);
    assert_eq!(services.active_len().expect("active"), 0);
}

#[test]
fn every_path_into_history_honours_capacity() {
    let services = ServiceCollection::new(2);
    services.create(record(1, 1, 0)).expect("create");
    services.create(record(1, 1, 0)).expect("displace");
    services.create(record(1, 2, 0)).expect("create");
    services.create(record(1, 3, 0)).expect("create");
    services.sweep(&stamp(5_000)).expect("sweep");
    assert_eq!(services.history_len().expect("history"), 2);
    assert!(services.history().expect("history").iter().all(|r| r.inactive));
}

#[test]
fn concurrent_heartbeats_destroys_and_sweeps_keep_each_record_once() {
    let services = ServiceCollection::new(256);
    let ids: Vec<u64> = (0..64).collect();
    for &id in &ids {
        services.create(record(1, id, 0)).expect("create");
    }

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for round in 0..20u64 {
                for &id in &ids {
                    let beat = stamp(1_000 + round);
                    services.heartbeat(addr(1), id, beat, beat).expect("heartbeat");
                    if id % 3 == 0 {
                        let mut destroy = record(1, id, 0);
                        destroy.state = ServiceState::Stopped;
                        services.destroy(&destroy).expect("destroy");
                    }
                }
            }
        });
        scope.spawn(|| {
            for tick in 0..200u64 {
                services.sweep(&stamp(900 + tick * 10)).expect("sweep");
            }
        });
    });

    let active = services.active().expect("active");
    let history = services.history().expect("history");
    assert_eq!(active.len() + history.len(), ids.len());
    for &id in &ids {
        let seen = active
            .iter()
            .chain(history.iter())
            .filter(|r| r.key.id == id)
            .count();
        assert_eq!(seen, 1, "service {id} seen {seen} times");
    }
}
