//! Seam between the fabric and whatever moves bytes between processes.
//!
//! The fabric never opens sockets. A [`Transport`] sends sequences over
//! numbered flows and reports the local address of each flow; inbound traffic
//! is handed in as [`Inbound`] envelopes and connection changes through
//! [`FlowEvents`].

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::sequence::Sequence;
use crate::wire;

/// Identity of a transport endpoint. Only ever compared, never dereferenced.
pub type FlowId = u64;

pub trait Transport: Send + Sync {
    fn send(&self, flow: FlowId, seq: &Sequence) -> Result<()>;

    /// Address this process reports to peers reached over `flow`.
    fn local_addr(&self, flow: FlowId) -> Result<SocketAddr>;
}

pub trait FlowEvents: Send + Sync {
    fn on_connected(&self, _flow: FlowId) -> Result<()> {
        Ok(())
    }

    fn on_disconnected(&self, flow: FlowId) -> Result<()>;
}

/// A received sequence together with where it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub flow: FlowId,
    pub peer: SocketAddr,
    pub protocol: String,
    pub sequence: Sequence,
}

impl Inbound {
    pub fn decode(flow: FlowId, peer: SocketAddr, protocol: &str, frame: &[u8]) -> Result<Self> {
        Ok(Self {
            flow,
            peer,
            protocol: protocol.to_string(),
            sequence: wire::decode(frame)?,
        })
    }
}

/// In-process transport: frames every send and keeps it until taken.
#[derive(Default)]
pub struct MemoryTransport {
    locals: Mutex<HashMap<FlowId, SocketAddr>>,
    refusing: Mutex<HashSet<FlowId>>,
    sent: Mutex<Vec<(FlowId, Vec<u8>)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, flow: FlowId, local: SocketAddr) -> Result<()> {
        self.locals
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .insert(flow, local);
        Ok(())
    }

    pub fn disconnect(&self, flow: FlowId) -> Result<()> {
        self.locals
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .remove(&flow);
        Ok(())
    }

    /// Makes every later send on `flow` fail.
    pub fn refuse_sends(&self, flow: FlowId) -> Result<()> {
        self.refusing
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .insert(flow);
        Ok(())
    }

    /// Drains sent frames, decoding each back into a sequence.
    pub fn take_sent(&self) -> Result<Vec<(FlowId, Sequence)>> {
        let frames = std::mem::take(
            &mut *self
                .sent
                .lock()
                .map_err(|_| Error::LockPoisoned("memory transport"))?,
        );
        frames
            .into_iter()
            .map(|(flow, frame)| Ok((flow, wire::decode(&frame)?)))
            .collect()
    }

    /// Drains sent frames without decoding them.
    pub fn take_frames(&self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        Ok(std::mem::take(
            &mut *self
                .sent
                .lock()
                .map_err(|_| Error::LockPoisoned("memory transport"))?,
        ))
    }
}

impl Transport for MemoryTransport {
    fn send(&self, flow: FlowId, seq: &Sequence) -> Result<()> {
        if self
            .refusing
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .contains(&flow)
        {
            return Err(Error::Transport(format!("flow {flow} refused send")));
        }
        let frame = wire::encode(seq)?;
        self.sent
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .push((flow, frame));
        Ok(())
    }

    fn local_addr(&self, flow: FlowId) -> Result<SocketAddr> {
        self.locals
            .lock()
            .map_err(|_| Error::LockPoisoned("memory transport"))?
            .get(&flow)
            .copied()
            .ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceKind;

    #[test]
    fn sends_are_framed_and_decoded() {
        let transport = MemoryTransport::new();
        let mut seq = Sequence::new("hello", 11, SequenceKind::Data);
        seq.add_owned_copy(b"payload", 1).unwrap();
        transport.send(3, &seq).unwrap();

        let sent = transport.take_sent().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 3);
        assert_eq!(sent[0].1.find_data(1), Some(&b"payload"[..]));
        assert!(transport.take_sent().unwrap().is_empty());
    }

    #[test]
    fn refused_flow_reports_transport_error() {
        let transport = MemoryTransport::new();
        transport.refuse_sends(4).unwrap();
        let seq = Sequence::new("x", 1, SequenceKind::Data);
        assert!(matches!(transport.send(4, &seq), Err(Error::Transport(_))));
    }

    #[test]
    fn unknown_flow_has_no_local_address() {
        let transport = MemoryTransport::new();
        assert!(matches!(transport.local_addr(1), Err(Error::NotFound)));
        let addr: SocketAddr = "10.0.0.5:29090".parse().unwrap();
        transport.connect(1, addr).unwrap();
        assert_eq!(transport.local_addr(1).unwrap(), addr);
        transport.disconnect(1).unwrap();
        assert!(transport.local_addr(1).is_err());
    }

    #[test]
    fn inbound_decodes_frames() {
        let mut seq = Sequence::new("hello", 11, SequenceKind::Management);
        seq.add_owned_copy(b"x", 2).unwrap();
        let frame = wire::encode(&seq).unwrap();
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let inbound = Inbound::decode(8, peer, "tcp", &frame).unwrap();
        assert_eq!(inbound.flow, 8);
        assert_eq!(inbound.sequence.id(), 11);
        assert_eq!(inbound.protocol, "tcp");
    }
}
