use std::net::SocketAddr;
use std::sync::Arc;

use smartbeat::clock::ManualClock;
use smartbeat::config::NameServiceConfig;
use smartbeat::names::{NameOutcome, NameRequest, NameServer};
use smartbeat::protocol::{tags, NAME_REQUEST_SEQUENCE_ID};
use smartbeat::sequence::{Sequence, SequenceKind};
use smartbeat::timer::TimerSet;
use smartbeat::transport::{FlowEvents, FlowId, Inbound, MemoryTransport};

fn peer() -> SocketAddr {
    "10.3.0.7:5555".parse().unwrap()
}

fn setup() -> (Arc<NameServer>, Arc<MemoryTransport>, Arc<ManualClock>) {
    let transport = Arc::new(MemoryTransport::new());
    let clock = Arc::new(ManualClock::new(3_000_000_000_000));
    let server = NameServer::new(9, transport.clone(), clock.clone(), &NameServiceConfig::default());
    (server, transport, clock)
}

fn send(server: &NameServer, flow: FlowId, request: &NameRequest, kind: SequenceKind) -> NameOutcome {
    let inbound = Inbound {
        flow,
        peer: peer(),
        protocol: "tcp".into(),
        sequence: request.to_sequence(kind).expect("request"),
    };
    server.handle(&inbound).expect("handle")
}

fn request_id(seq: &Sequence) -> u64 {
    let data = seq.find_data(tags::NS_REQUEST_ID).expect("request id");
    u64::from_le_bytes(data[..8].try_into().expect("8 bytes"))
}

fn registration(name: &str, group: &str, port: u16) -> NameRequest {
    NameRequest {
        name: name.into(),
        group: group.into(),
        connect_addr: Some(SocketAddr::from(([10, 3, 0, 1], port))),
        protocol: Some("tcp".into()),
        linger_secs: Some(3),
        ft_state: 0,
        request_id: 0x11,
    }
}

#[test]
fn registration_is_acknowledged_and_queryable() {
    let (server, transport, _) = setup();
    assert_eq!(
        send(&server, 1, &registration("quotes", "", 7000), SequenceKind::Request),
        NameOutcome::Registered(0)
    );
    let ack = transport.take_sent().expect("sent");
    assert_eq!(ack.len(), 1);
    assert_eq!(ack[0].1.id(), NAME_REQUEST_SEQUENCE_ID);
    assert_eq!(ack[0].1.kind(), SequenceKind::Request);
    assert_eq!(request_id(&ack[0].1), 0x11);

    let mut query = NameRequest::new("QUOTES");
    query.request_id = 0x22;
    assert_eq!(send(&server, 2, &query, SequenceKind::Query), NameOutcome::Answered(1));

    let answers = transport.take_sent().expect("sent");
    assert_eq!(answers.len(), 1);
    let (flow, answer) = &answers[0];
    assert_eq!(*flow, 2);
    assert_eq!(answer.kind(), SequenceKind::Query);
    assert_eq!(request_id(answer), 0x22);
    assert_eq!(
        answer.find_data(tags::NS_CONNECT_ADDR),
        Some("10.3.0.1:7000".as_bytes())
    );
    let ids: Vec<u64> = answer
        .leaves()
        .filter(|(tag, _)| *tag == tags::NS_REQUEST_ID)
        .map(|(_, data)| u64::from_le_bytes(data[..8].try_into().unwrap()))
        .collect();
    assert_eq!(ids, vec![0x22]);
}

#[test]
fn groups_are_separate_and_unknown_groups_use_default() {
    let (server, transport, _) = setup();
    send(&server, 1, &registration("quotes", "east", 7000), SequenceKind::Request);
    send(&server, 1, &registration("quotes", "", 7001), SequenceKind::Request);
    transport.take_sent().expect("drain");

    let mut query = NameRequest::new("quotes");
    query.group = "east".into();
    assert_eq!(send(&server, 2, &query, SequenceKind::Query), NameOutcome::Answered(1));

    query.group = "nowhere".into();
    assert_eq!(send(&server, 2, &query, SequenceKind::Query), NameOutcome::Answered(1));
    let answers = transport.take_sent().expect("sent");
    assert_eq!(
        answers[1].1.find_data(tags::NS_CONNECT_ADDR),
        Some("10.3.0.1:7001".as_bytes())
    );
}

#[test]
fn subscribers_hear_later_registrations() {
    let (server, transport, _) = setup();
    let mut subscribe = NameRequest::new("quotes");
    subscribe.request_id = 0x55;
    assert_eq!(send(&server, 4, &subscribe, SequenceKind::Subscribe), NameOutcome::Subscribed(0));
    transport.take_sent().expect("drain");

    assert_eq!(
        send(&server, 1, &registration("quotes", "", 7000), SequenceKind::Request),
        NameOutcome::Registered(1)
    );
    let sent = transport.take_sent().expect("sent");
    let forwarded: Vec<&Sequence> = sent
        .iter()
        .filter(|(flow, _)| *flow == 4)
        .map(|(_, seq)| seq)
        .collect();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(request_id(forwarded[0]), 0x55);
    assert_eq!(server.subscribed(), 1);
}

#[test]
fn disconnected_registration_lingers_then_expires() {
    let (server, transport, clock) = setup();
    send(&server, 1, &registration("quotes", "", 7000), SequenceKind::Request);
    send(&server, 1, &NameRequest::new("trades"), SequenceKind::Subscribe);
    transport.take_sent().expect("drain");

    let timers = TimerSet::new(clock.clone(), 2);
    server.start_gc(&timers, 1_000).expect("gc timer");
    server.on_disconnected(1).expect("disconnect");

    clock.advance_ms(1_000);
    timers.dispatch(0).expect("dispatch");
    assert_eq!(server.subscribed(), 0);
    assert_eq!(server.registered(), 1);
    assert_eq!(server.lookup("", "quotes").expect("lookup")[0].flow, None);

    clock.advance_ms(1_000);
    timers.dispatch(0).expect("dispatch");
    assert_eq!(server.registered(), 1);

    clock.advance_ms(1_500);
    timers.dispatch(0).expect("dispatch");
    assert_eq!(server.registered(), 0);
}

#[test]
fn capacity_limit_applies_across_groups() {
    let transport = Arc::new(MemoryTransport::new());
    let clock = Arc::new(ManualClock::new(0));
    let config = NameServiceConfig {
        max_names: Some(2),
        ..NameServiceConfig::default()
    };
    let server = NameServer::new(1, transport, clock, &config);
    send(&server, 1, &registration("a", "east", 1), SequenceKind::Request);
    send(&server, 1, &registration("b", "west", 2), SequenceKind::Request);
    let inbound = Inbound {
        flow: 1,
        peer: peer(),
        protocol: "tcp".into(),
        sequence: registration("c", "", 3)
            .to_sequence(SequenceKind::Request)
            .expect("request"),
    };
    assert!(server.handle(&inbound).is_err());
    assert_eq!(server.registered(), 2);
}
