//! Service discovery and smartbeat liveness fabric.
//!
//! Services announce themselves and their lifecycle to monitors as tagged
//! [`sequence::Sequence`]s, then keep proving they are alive with periodic
//! smartbeats. Monitors track what they hear in an active set and a bounded
//! history; name servers keep registrations in bucketed registry stores.
//! Transports are supplied by the embedding application.

pub mod clock;
pub mod collection;
pub mod config;
pub mod error;
pub mod monitor;
pub mod names;
pub mod protocol;
pub mod registry;
pub mod sequence;
pub mod smartbeat;
pub mod timer;
pub mod transport;
pub mod wire;

pub use collection::{ServiceCollection, ServiceKey, ServiceRecord};
pub use error::{Error, Result};
pub use monitor::Monitor;
pub use names::NameServer;
pub use sequence::{Sequence, SequenceKind, SharedSequence};
pub use smartbeat::{Smartbeat, SmartbeatController};
pub use timer::TimerSet;
