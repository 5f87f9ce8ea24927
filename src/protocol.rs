//! Tag space, sequence ids and fixed-layout records exchanged between
//! services, monitors and name servers.
//!
//! Fixed-layout records start with their declared size. Receivers accept any
//! record at least as large as the layout they were built with and ignore the
//! trailing bytes, so senders can grow a record without breaking old peers.

use std::net::SocketAddr;

use log::debug;

use crate::error::{Error, Result};
use crate::sequence::{Sequence, SequenceKind};
use crate::smartbeat::Smartbeat;
use crate::wire::{le_u16, le_u32, le_u64};

pub mod tags {
    pub const SERVICE_INSTANCE: u64 = 0x8100;
    pub const SERVICE_NAME: u64 = 0x8101;
    pub const SERVICE_STATE: u64 = 0x8102;
    pub const REPORTING_ADDR: u64 = 0x8103;
    pub const SERVICE_STATE_NAME: u64 = 0x8104;
    pub const GROUP_NAME: u64 = 0x8110;
    pub const SMARTBEAT_RECORD: u64 = 0x5000_0001;

    pub const NS_NAME: u64 = 1;
    pub const NS_CONNECT_ADDR: u64 = 2;
    pub const NS_GROUP_NAME: u64 = 3;
    pub const NS_LINGER: u64 = 4;
    pub const NS_REQUEST_ID: u64 = 5;
    pub const NS_PROTOCOL: u64 = 6;
    pub const NS_FT_STATE: u64 = 7;
    pub const NS_SERVER_ID: u64 = 8;
}

pub const SMARTBEAT_SEQUENCE_ID: u64 = 0x0300_0000;
pub const SMARTBEAT_SEQUENCE_NAME: &str = "Smartbeat";
pub const SERVICE_CREATE_SEQUENCE_ID: u64 = 0xe00;
pub const SERVICE_DESTROY_SEQUENCE_ID: u64 = 0xe01;
pub const SERVICE_STATE_SEQUENCE_ID: u64 = 0xe02;
pub const NAME_REQUEST_SEQUENCE_ID: u64 = 0x9a3e_07e9;

pub const MAX_STATE_NAME_LEN: usize = 80;

/// Decodes a text segment, tolerating a trailing NUL from C peers.
pub(crate) fn decode_str(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .trim_end_matches('\0')
        .to_string()
}

fn check_declared(record: &'static str, data: &[u8], expected: usize) -> Result<()> {
    let declared = if data.len() >= 4 {
        le_u32(data, 0) as usize
    } else {
        data.len()
    };
    let actual = declared.min(data.len());
    if actual < expected {
        return Err(Error::RecordTooSmall {
            record,
            expected,
            actual,
        });
    }
    Ok(())
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ServiceState {
    #[default]
    Invalid = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    TimedOut = 5,
}

impl ServiceState {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::Starting),
            2 => Ok(Self::Running),
            3 => Ok(Self::Stopping),
            4 => Ok(Self::Stopped),
            5 => Ok(Self::TimedOut),
            other => Err(Error::InvalidState(other as u32)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::TimedOut => "timed out",
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceOp {
    #[default]
    None = 0,
    Create = 1,
    Destroy = 2,
}

impl ServiceOp {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Create,
            2 => Self::Destroy,
            _ => Self::None,
        }
    }
}

pub const SERVICE_INSTANCE_LEN: usize = 48;

/// Snapshot of a service instance as announced by the service itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceInstance {
    pub op: ServiceOp,
    pub id: u64,
    pub service_type: u16,
    pub state: ServiceState,
    pub activity_timeout_ms: u32,
    pub smartbeat: Smartbeat,
}

impl ServiceInstance {
    pub fn to_bytes(&self) -> [u8; SERVICE_INSTANCE_LEN] {
        let mut buf = [0u8; SERVICE_INSTANCE_LEN];
        buf[0..4].copy_from_slice(&(SERVICE_INSTANCE_LEN as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.op as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..18].copy_from_slice(&self.service_type.to_le_bytes());
        buf[18..20].copy_from_slice(&(self.state as u16).to_le_bytes());
        buf[20..24].copy_from_slice(&self.activity_timeout_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.smartbeat.sec.to_le_bytes());
        buf[32..40].copy_from_slice(&self.smartbeat.usec.to_le_bytes());
        buf[40..48].copy_from_slice(&self.smartbeat.checkpoint.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_declared("service instance", data, SERVICE_INSTANCE_LEN)?;
        Ok(Self {
            op: ServiceOp::from_u32(le_u32(data, 4)),
            id: le_u64(data, 8),
            service_type: le_u16(data, 16),
            state: ServiceState::from_u16(le_u16(data, 18))?,
            activity_timeout_ms: le_u32(data, 20),
            smartbeat: Smartbeat {
                sec: le_u64(data, 24),
                usec: le_u64(data, 32),
                checkpoint: le_u64(data, 40),
            },
        })
    }
}

pub const SMARTBEAT_RECORD_LEN: usize = 40;

/// One entity's heartbeat inside a smartbeat sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmartbeatRecord {
    pub service_id: u64,
    pub smartbeat: Smartbeat,
}

impl SmartbeatRecord {
    pub fn to_bytes(&self) -> [u8; SMARTBEAT_RECORD_LEN] {
        let mut buf = [0u8; SMARTBEAT_RECORD_LEN];
        buf[0..4].copy_from_slice(&(SMARTBEAT_RECORD_LEN as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.service_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.smartbeat.sec.to_le_bytes());
        buf[24..32].copy_from_slice(&self.smartbeat.usec.to_le_bytes());
        buf[32..40].copy_from_slice(&self.smartbeat.checkpoint.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        check_declared("smartbeat", data, SMARTBEAT_RECORD_LEN)?;
        Ok(Self {
            service_id: le_u64(data, 8),
            smartbeat: Smartbeat {
                sec: le_u64(data, 16),
                usec: le_u64(data, 24),
                checkpoint: le_u64(data, 32),
            },
        })
    }
}

pub fn encode_addr(addr: &SocketAddr) -> Vec<u8> {
    addr.to_string().into_bytes()
}

pub fn decode_addr(data: &[u8]) -> Result<SocketAddr> {
    decode_str(data)
        .parse()
        .map_err(|_| Error::Corrupt("unparseable address"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Create,
    Destroy,
    State,
}

impl NotificationKind {
    pub fn sequence_id(self) -> u64 {
        match self {
            Self::Create => SERVICE_CREATE_SEQUENCE_ID,
            Self::Destroy => SERVICE_DESTROY_SEQUENCE_ID,
            Self::State => SERVICE_STATE_SEQUENCE_ID,
        }
    }

    pub fn from_sequence_id(id: u64) -> Option<Self> {
        match id {
            SERVICE_CREATE_SEQUENCE_ID => Some(Self::Create),
            SERVICE_DESTROY_SEQUENCE_ID => Some(Self::Destroy),
            SERVICE_STATE_SEQUENCE_ID => Some(Self::State),
            _ => None,
        }
    }
}

/// A service lifecycle notification as carried by a management sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceNotification {
    pub kind: NotificationKind,
    pub instance: Option<ServiceInstance>,
    pub name: Option<String>,
    pub state_update: Option<ServiceState>,
    pub state_name: Option<String>,
    pub group: Option<String>,
    pub reporting_addr: Option<SocketAddr>,
}

impl ServiceNotification {
    pub fn new(kind: NotificationKind) -> Self {
        Self {
            kind,
            instance: None,
            name: None,
            state_update: None,
            state_name: None,
            group: None,
            reporting_addr: None,
        }
    }

    pub fn to_sequence(&self) -> Result<Sequence> {
        let mut seq = Sequence::new(
            "service notification",
            self.kind.sequence_id(),
            SequenceKind::Management,
        );
        if let Some(instance) = &self.instance {
            seq.add_owned_copy(&instance.to_bytes(), tags::SERVICE_INSTANCE)?;
        }
        if let Some(name) = &self.name {
            seq.add_owned_copy(name.as_bytes(), tags::SERVICE_NAME)?;
        }
        if let Some(state) = self.state_update {
            seq.add_owned_copy(&(state as u16).to_le_bytes(), tags::SERVICE_STATE)?;
        }
        if let Some(state_name) = &self.state_name {
            let state_name = truncate_chars(state_name, MAX_STATE_NAME_LEN);
            seq.add_owned_copy(state_name.as_bytes(), tags::SERVICE_STATE_NAME)?;
        }
        if let Some(group) = &self.group {
            seq.add_owned_copy(group.as_bytes(), tags::GROUP_NAME)?;
        }
        if let Some(addr) = &self.reporting_addr {
            seq.add_owned_copy(&encode_addr(addr), tags::REPORTING_ADDR)?;
        }
        Ok(seq)
    }

    /// Parses a notification; returns `None` for sequences that are not one.
    pub fn from_sequence(seq: &Sequence) -> Result<Option<Self>> {
        let kind = match NotificationKind::from_sequence_id(seq.id()) {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let mut notification = Self::new(kind);
        seq.for_each_leaf(|tag, data| -> Result<()> {
            match tag {
                tags::SERVICE_INSTANCE => {
                    notification.instance = Some(ServiceInstance::from_bytes(data)?)
                }
                tags::SERVICE_NAME => notification.name = Some(decode_str(data)),
                tags::SERVICE_STATE => {
                    if data.len() < 2 {
                        return Err(Error::RecordTooSmall {
                            record: "service state",
                            expected: 2,
                            actual: data.len(),
                        });
                    }
                    notification.state_update = Some(ServiceState::from_u16(le_u16(data, 0))?);
                }
                tags::SERVICE_STATE_NAME => notification.state_name = Some(decode_str(data)),
                tags::GROUP_NAME => notification.group = Some(decode_str(data)),
                tags::REPORTING_ADDR => notification.reporting_addr = Some(decode_addr(data)?),
                other => debug!("skipping unknown service notification tag {other:#x}"),
            }
            Ok(())
        })?;
        Ok(Some(notification))
    }
}

/// Heartbeats received in one smartbeat sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmartbeatReport {
    pub reporting_addr: Option<SocketAddr>,
    pub records: Vec<SmartbeatRecord>,
}

impl SmartbeatReport {
    pub fn from_sequence(seq: &Sequence) -> Result<Option<Self>> {
        if seq.id() != SMARTBEAT_SEQUENCE_ID {
            return Ok(None);
        }
        let mut report = Self::default();
        seq.for_each_leaf(|tag, data| -> Result<()> {
            match tag {
                tags::SMARTBEAT_RECORD => report.records.push(SmartbeatRecord::from_bytes(data)?),
                tags::REPORTING_ADDR => report.reporting_addr = Some(decode_addr(data)?),
                other => debug!("skipping unknown smartbeat tag {other:#x}"),
            }
            Ok(())
        })?;
        Ok(Some(report))
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let end = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&end| end <= max)
        .last()
        .unwrap_or(0);
    &s[..end]
}
