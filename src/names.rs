//! Name service: registrations, queries and subscriptions kept in bucketed
//! registry stores, one store per group.
//!
//! Registrations outlive the flow they arrived on by their linger time;
//! subscriptions die with their flow. A periodic collection pass removes
//! whatever has expired.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::clock::Clock;
use crate::config::NameServiceConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    decode_addr, decode_str, encode_addr, tags, NAME_REQUEST_SEQUENCE_ID, SMARTBEAT_SEQUENCE_ID,
};
use crate::registry::{lock_store, Registry, RegistryEntry, RegistryStore};
use crate::sequence::{Sequence, SequenceKind, SharedSequence};
use crate::timer::{TimerEvent, TimerHandle, TimerReason, TimerSet};
use crate::transport::{FlowEvents, FlowId, Inbound, Transport};
use crate::wire::{le_u32, le_u64};

pub const NAME_GC_TIMER_ID: u64 = 0x2000_0001;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A name registration as stored by the server.
#[derive(Debug, Clone)]
pub struct NameRecord {
    pub connect_addr: Option<SocketAddr>,
    pub protocol: Option<String>,
    pub linger_secs: u32,
    pub ft_state: u32,
    pub request_id: u64,
    /// The registrant's sequence, turned into a query answer.
    pub registration: SharedSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub subscription_id: u64,
}

/// Fields of a register, query or subscribe sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameRequest {
    pub name: String,
    pub group: String,
    pub connect_addr: Option<SocketAddr>,
    pub protocol: Option<String>,
    pub linger_secs: Option<u32>,
    pub ft_state: u32,
    pub request_id: u64,
}

fn expect_len(record: &'static str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(Error::RecordTooSmall {
            record,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

impl NameRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn to_sequence(&self, kind: SequenceKind) -> Result<Sequence> {
        let mut seq = Sequence::new(self.name.clone(), NAME_REQUEST_SEQUENCE_ID, kind);
        seq.add_owned_copy(self.name.as_bytes(), tags::NS_NAME)?;
        if !self.group.is_empty() {
            seq.add_owned_copy(self.group.as_bytes(), tags::NS_GROUP_NAME)?;
        }
        if let Some(addr) = &self.connect_addr {
            seq.add_owned_copy(&encode_addr(addr), tags::NS_CONNECT_ADDR)?;
        }
        if let Some(protocol) = &self.protocol {
            seq.add_owned_copy(protocol.as_bytes(), tags::NS_PROTOCOL)?;
        }
        if let Some(linger) = self.linger_secs {
            seq.add_owned_copy(&(linger as i32).to_le_bytes(), tags::NS_LINGER)?;
        }
        if self.ft_state != 0 {
            seq.add_owned_copy(&self.ft_state.to_le_bytes(), tags::NS_FT_STATE)?;
        }
        seq.add_owned_copy(&self.request_id.to_le_bytes(), tags::NS_REQUEST_ID)?;
        Ok(seq)
    }

    /// Reads the request fields; the name falls back to the sequence name.
    pub fn from_sequence(seq: &Sequence) -> Result<Self> {
        let mut request = Self::new(seq.name());
        seq.for_each_leaf(|tag, data| -> Result<()> {
            match tag {
                tags::NS_NAME => request.name = decode_str(data),
                tags::NS_GROUP_NAME => request.group = decode_str(data),
                tags::NS_CONNECT_ADDR => request.connect_addr = Some(decode_addr(data)?),
                tags::NS_PROTOCOL => request.protocol = Some(decode_str(data)),
                tags::NS_LINGER => {
                    expect_len("linger", data, 4)?;
                    request.linger_secs = Some((le_u32(data, 0) as i32).max(0) as u32);
                }
                tags::NS_FT_STATE => {
                    expect_len("fault tolerance state", data, 4)?;
                    request.ft_state = le_u32(data, 0);
                }
                tags::NS_REQUEST_ID => {
                    expect_len("request id", data, 8)?;
                    request.request_id = le_u64(data, 0);
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(request)
    }
}

/// What the server did with an inbound sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameOutcome {
    Echoed,
    /// Registered; carries the number of subscribers notified.
    Registered(usize),
    /// Query answered with this many registrations.
    Answered(usize),
    /// Subscription stored and answered with this many registrations.
    Subscribed(usize),
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collected {
    pub names: usize,
    pub subscriptions: usize,
}

pub struct NameServer {
    id: u64,
    names: Registry<NameRecord>,
    subscriptions: Registry<Subscription>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    default_linger_secs: u32,
}

impl NameServer {
    pub fn new(
        id: u64,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: &NameServiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            names: Registry::new(config.max_names),
            subscriptions: Registry::new(None),
            transport,
            clock,
            default_linger_secs: config.default_linger_secs,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registered(&self) -> usize {
        self.names.live_entries()
    }

    pub fn subscribed(&self) -> usize {
        self.subscriptions.live_entries()
    }

    pub fn handle(&self, inbound: &Inbound) -> Result<NameOutcome> {
        let seq = &inbound.sequence;
        if seq.id() == SMARTBEAT_SEQUENCE_ID {
            self.echo_smartbeat(inbound)?;
            return Ok(NameOutcome::Echoed);
        }
        match seq.kind() {
            SequenceKind::Request => self.register(inbound).map(NameOutcome::Registered),
            SequenceKind::Query => {
                let request = NameRequest::from_sequence(seq)?;
                self.answer_query(inbound.flow, &request)
                    .map(NameOutcome::Answered)
            }
            SequenceKind::Subscribe => self.subscribe(inbound).map(NameOutcome::Subscribed),
            other => {
                warn!(
                    "name server ignoring unexpected {other:?} sequence {:#x} from {}",
                    seq.id(),
                    inbound.peer
                );
                Ok(NameOutcome::Ignored)
            }
        }
    }

    fn echo_smartbeat(&self, inbound: &Inbound) -> Result<()> {
        debug!("echoing smartbeat on flow {}", inbound.flow);
        let mut echo = inbound.sequence.clone();
        echo.add_owned_copy(&self.id.to_le_bytes(), tags::NS_SERVER_ID)?;
        if let Err(err) = self.transport.send(inbound.flow, &echo) {
            debug!("failed to return smartbeat on flow {}: {err}", inbound.flow);
        }
        Ok(())
    }

    fn register(&self, inbound: &Inbound) -> Result<usize> {
        let request = NameRequest::from_sequence(&inbound.sequence)?;
        info!(
            "registering name {} group '{}' from {}",
            request.name, request.group, inbound.peer
        );

        let mut stored = inbound.sequence.clone();
        stored.set_kind(SequenceKind::Query);
        stored.remove_by_tag(tags::NS_REQUEST_ID, 0);
        let registration = stored.into_shared();

        let record = NameRecord {
            connect_addr: request.connect_addr,
            protocol: request.protocol.clone(),
            linger_secs: request.linger_secs.unwrap_or(self.default_linger_secs),
            ft_state: request.ft_state,
            request_id: request.request_id,
            registration: registration.clone(),
        };
        let store = self.names.find_or_add_store(&request.group)?;
        {
            let mut store = lock_store(&store)?;
            replace_from_flow(
                &mut store,
                RegistryEntry::new(request.name.as_str(), request.group.as_str(), record)
                    .with_flow(inbound.flow),
            )?;
        }

        self.acknowledge(inbound.flow, &request)?;

        let subscribers: Vec<(FlowId, u64)> = {
            let store = self.subscriptions.find_store(&request.group)?;
            let store = lock_store(&store)?;
            store
                .iter()
                .filter(|(_, e)| e.key.eq_ignore_ascii_case(&request.name))
                .filter_map(|(_, e)| e.flow.map(|flow| (flow, e.payload.subscription_id)))
                .collect()
        };
        for &(flow, subscription_id) in &subscribers {
            self.send_query_response(flow, &request.name, &registration, subscription_id);
        }
        Ok(subscribers.len())
    }

    fn subscribe(&self, inbound: &Inbound) -> Result<usize> {
        let request = NameRequest::from_sequence(&inbound.sequence)?;
        info!(
            "subscription {:#x} for name {} group '{}' from {}",
            request.request_id, request.name, request.group, inbound.peer
        );
        let store = self.subscriptions.find_or_add_store(&request.group)?;
        {
            let mut store = lock_store(&store)?;
            replace_from_flow(
                &mut store,
                RegistryEntry::new(
                    request.name.as_str(),
                    request.group.as_str(),
                    Subscription {
                        subscription_id: request.request_id,
                    },
                )
                .with_flow(inbound.flow),
            )?;
        }
        self.acknowledge(inbound.flow, &request)?;
        self.answer_query(inbound.flow, &request)
    }

    fn acknowledge(&self, flow: FlowId, request: &NameRequest) -> Result<()> {
        let mut ack = Sequence::new("name request", NAME_REQUEST_SEQUENCE_ID, SequenceKind::Request);
        ack.add_owned_copy(&request.request_id.to_le_bytes(), tags::NS_REQUEST_ID)?;
        ack.add_owned_copy(request.name.as_bytes(), tags::NS_NAME)?;
        if let Err(err) = self.transport.send(flow, &ack) {
            warn!("failed to acknowledge {} on flow {flow}: {err}", request.name);
        }
        Ok(())
    }

    /// Sends every registration of the requested name to `flow`.
    fn answer_query(&self, flow: FlowId, request: &NameRequest) -> Result<usize> {
        let matches: Vec<SharedSequence> = {
            let store = self.names.find_store(&request.group)?;
            let store = lock_store(&store)?;
            let mut found = Vec::new();
            let mut cursor = store.find(&request.name, None);
            while let Some(handle) = cursor {
                if let Some(entry) = store.get(handle) {
                    found.push(entry.payload.registration.hold());
                }
                cursor = store.find(&request.name, Some(handle));
            }
            found
        };
        debug!(
            "query for {} group '{}' matched {} registrations",
            request.name,
            request.group,
            matches.len()
        );
        for registration in &matches {
            self.send_query_response(flow, &request.name, registration, request.request_id);
        }
        Ok(matches.len())
    }

    /// Wraps a stored registration with the asker's request id. The stored
    /// sequence itself is shared and never modified.
    fn send_query_response(
        &self,
        flow: FlowId,
        name: &str,
        registration: &SharedSequence,
        request_id: u64,
    ) {
        let sent = query_response(name, registration, request_id)
            .and_then(|seq| self.transport.send(flow, &seq));
        if let Err(err) = sent {
            warn!("failed to answer for {name} on flow {flow}: {err}");
        }
    }

    /// Registrations currently held for `name` in `group`.
    pub fn lookup(&self, group: &str, name: &str) -> Result<Vec<RegistryEntry<NameRecord>>> {
        let store = self.names.find_store(group)?;
        let store = lock_store(&store)?;
        Ok(store
            .iter()
            .filter(|(_, e)| e.key.eq_ignore_ascii_case(name))
            .map(|(_, e)| e.clone())
            .collect())
    }

    /// Removes expired registrations and subscriptions from every store.
    pub fn collect_expired(&self) -> Result<Collected> {
        let now = self.clock.now();
        let mut collected = Collected::default();
        self.names.iterate_stores(|store| {
            for entry in store.drain_expired(now)? {
                info!("name {} group '{}' expired", entry.key, entry.group);
                collected.names += 1;
            }
            Ok(())
        })?;
        self.subscriptions.iterate_stores(|store| {
            for entry in store.drain_expired(now)? {
                debug!("subscription for {} expired", entry.key);
                collected.subscriptions += 1;
            }
            Ok(())
        })?;
        Ok(collected)
    }

    /// Runs [`NameServer::collect_expired`] every `interval_ms` on `timers`.
    pub fn start_gc(self: &Arc<Self>, timers: &TimerSet, interval_ms: u64) -> Result<TimerHandle> {
        let server: Weak<Self> = Arc::downgrade(self);
        timers.schedule(
            NAME_GC_TIMER_ID,
            interval_ms,
            move |set: &TimerSet, event: &TimerEvent| {
                if event.reason == TimerReason::Cancelled {
                    return;
                }
                let Some(server) = server.upgrade() else {
                    return;
                };
                if let Err(err) = set.reschedule(event.handle) {
                    warn!("failed to re-arm name gc timer: {err}");
                }
                if let Err(err) = server.collect_expired() {
                    warn!("name gc failed: {err}");
                }
            },
        )
    }
}

fn query_response(name: &str, registration: &SharedSequence, request_id: u64) -> Result<Sequence> {
    let mut seq = Sequence::new(name, NAME_REQUEST_SEQUENCE_ID, SequenceKind::Query);
    seq.add_nested(registration, 0)?;
    seq.add_owned_copy(&request_id.to_le_bytes(), tags::NS_REQUEST_ID)?;
    Ok(seq)
}

/// Adds `entry`, first dropping an entry of the same name from the same flow.
fn replace_from_flow<T>(store: &mut RegistryStore<T>, entry: RegistryEntry<T>) -> Result<()> {
    let mut cursor = store.find(&entry.key, None);
    while let Some(handle) = cursor {
        if store.get(handle).is_some_and(|e| e.flow == entry.flow) {
            store.remove(handle)?;
            break;
        }
        cursor = store.find(&entry.key, Some(handle));
    }
    store.add(entry)?;
    Ok(())
}

impl FlowEvents for NameServer {
    fn on_disconnected(&self, flow: FlowId) -> Result<()> {
        let now = self.clock.now();
        self.names.iterate_stores(|store| {
            let mut cursor = store.find_by_flow(flow, None);
            while let Some(handle) = cursor {
                if let Some(entry) = store.get_mut(handle) {
                    let linger = entry.payload.linger_secs as u64;
                    entry.expires_at = Some(now + linger * NANOS_PER_SEC);
                    entry.flow = None;
                    info!("name {} lingering {linger}s after flow {flow} closed", entry.key);
                }
                cursor = store.find_by_flow(flow, Some(handle));
            }
            Ok(())
        })?;
        self.subscriptions.iterate_stores(|store| {
            let mut cursor = store.find_by_flow(flow, None);
            while let Some(handle) = cursor {
                if let Some(entry) = store.get_mut(handle) {
                    entry.expires_at = Some(now);
                    entry.flow = None;
                }
                cursor = store.find_by_flow(flow, Some(handle));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::MemoryTransport;

    fn peer() -> SocketAddr {
        "10.0.0.9:4000".parse().unwrap()
    }

    fn server(max_names: Option<usize>) -> (Arc<NameServer>, Arc<MemoryTransport>, Arc<ManualClock>) {
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new(1_000 * NANOS_PER_SEC));
        let config = NameServiceConfig {
            max_names,
            ..NameServiceConfig::default()
        };
        let server = NameServer::new(42, transport.clone(), clock.clone(), &config);
        (server, transport, clock)
    }

    fn inbound(flow: FlowId, request: &NameRequest, kind: SequenceKind) -> Inbound {
        Inbound {
            flow,
            peer: peer(),
            protocol: "tcp".into(),
            sequence: request.to_sequence(kind).unwrap(),
        }
    }

    #[test]
    fn request_fields_survive_sequence_encoding() {
        let request = NameRequest {
            name: "quotes".into(),
            group: "east".into(),
            connect_addr: Some("10.1.1.1:7000".parse().unwrap()),
            protocol: Some("tcp".into()),
            linger_secs: Some(30),
            ft_state: 1,
            request_id: 0xabc,
        };
        let seq = request.to_sequence(SequenceKind::Request).unwrap();
        assert_eq!(NameRequest::from_sequence(&seq).unwrap(), request);
    }

    #[test]
    fn short_request_id_is_rejected() {
        let mut seq = Sequence::new("x", NAME_REQUEST_SEQUENCE_ID, SequenceKind::Request);
        seq.add_owned_copy(&[1, 2, 3], tags::NS_REQUEST_ID).unwrap();
        assert!(matches!(
            NameRequest::from_sequence(&seq),
            Err(Error::RecordTooSmall { expected: 8, actual: 3, .. })
        ));
    }

    #[test]
    fn reregistration_from_same_flow_replaces() {
        let (server, transport, _) = server(None);
        let request = NameRequest::new("quotes");
        server.handle(&inbound(1, &request, SequenceKind::Request)).unwrap();
        server.handle(&inbound(1, &request, SequenceKind::Request)).unwrap();
        server.handle(&inbound(2, &request, SequenceKind::Request)).unwrap();
        assert_eq!(server.lookup("", "quotes").unwrap().len(), 2);

        let acks = transport.take_sent().unwrap();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|(_, seq)| seq.kind() == SequenceKind::Request));
    }

    #[test]
    fn stored_registration_drops_request_id() {
        let (server, _, _) = server(None);
        let mut request = NameRequest::new("quotes");
        request.request_id = 7;
        server.handle(&inbound(1, &request, SequenceKind::Request)).unwrap();
        let entries = server.lookup("", "quotes").unwrap();
        let registration = &entries[0].payload.registration;
        assert_eq!(registration.kind(), SequenceKind::Query);
        assert!(registration.find_data(tags::NS_REQUEST_ID).is_none());
        assert_eq!(entries[0].payload.request_id, 7);
    }

    #[test]
    fn smartbeat_is_echoed_with_server_id() {
        let (server, transport, _) = server(None);
        let seq = Sequence::new("Smartbeat", SMARTBEAT_SEQUENCE_ID, SequenceKind::Management);
        let outcome = server
            .handle(&Inbound {
                flow: 3,
                peer: peer(),
                protocol: "tcp".into(),
                sequence: seq,
            })
            .unwrap();
        assert_eq!(outcome, NameOutcome::Echoed);
        let sent = transport.take_sent().unwrap();
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].1.find_data(tags::NS_SERVER_ID), Some(&42u64.to_le_bytes()[..]));
    }

    #[test]
    fn unexpected_kind_is_ignored() {
        let (server, transport, _) = server(None);
        let outcome = server
            .handle(&inbound(1, &NameRequest::new("x"), SequenceKind::Data))
            .unwrap();
        assert_eq!(outcome, NameOutcome::Ignored);
        assert!(transport.take_sent().unwrap().is_empty());
    }

    #[test]
    fn capacity_limit_rejects_extra_names() {
        let (server, _, _) = server(Some(1));
        server
            .handle(&inbound(1, &NameRequest::new("a"), SequenceKind::Request))
            .unwrap();
        let err = server
            .handle(&inbound(1, &NameRequest::new("b"), SequenceKind::Request))
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 1 }));
        assert_eq!(server.registered(), 1);
    }

    #[test]
    fn disconnect_lingers_names_and_expires_subscriptions() {
        let (server, _, clock) = server(None);
        let mut request = NameRequest::new("quotes");
        request.linger_secs = Some(2);
        server.handle(&inbound(1, &request, SequenceKind::Request)).unwrap();
        server
            .handle(&inbound(1, &NameRequest::new("quotes"), SequenceKind::Subscribe))
            .unwrap();

        server.on_disconnected(1).unwrap();
        clock.advance_ms(1);
        let collected = server.collect_expired().unwrap();
        assert_eq!(collected, Collected { names: 0, subscriptions: 1 });

        clock.advance_ms(2_000);
        assert_eq!(server.collect_expired().unwrap().names, 1);
        assert_eq!(server.registered(), 0);
    }
}
