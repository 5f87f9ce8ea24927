//! Active and history sets of services seen by a monitor.
//!
//! Records move between two ordered lists, each behind its own lock. Paths
//! that touch both always lock `active` before `history`. History is bounded;
//! moving a record in when it is full drops the oldest one.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::ServiceState;
use crate::smartbeat::{has_timed_out, Smartbeat};

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Identity a service is matched on: where it reports from plus its id and type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub addr: SocketAddr,
    pub id: u64,
    pub service_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub name: String,
    pub group: Option<String>,
    pub protocol: String,
    pub state: ServiceState,
    pub state_name: Option<String>,
    pub smartbeat: Smartbeat,
    /// When this monitor last heard from the service.
    pub received_at: Smartbeat,
    pub activity_timeout_ms: u32,
    /// Superseded by a newer registration of the same key.
    pub displaced: bool,
    /// Went quiet or reported itself timed out.
    pub inactive: bool,
}

impl ServiceRecord {
    pub fn new(key: ServiceKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            group: None,
            protocol: String::new(),
            state: ServiceState::Invalid,
            state_name: None,
            smartbeat: Smartbeat::default(),
            received_at: Smartbeat::default(),
            activity_timeout_ms: 0,
            displaced: false,
            inactive: false,
        }
    }

    /// Folds a later report about the same service into this record.
    fn merge(&mut self, incoming: &ServiceRecord) {
        if self.state != incoming.state {
            self.state_name = None;
        }
        if incoming.state_name.is_some() {
            self.state_name = incoming.state_name.clone();
        }
        if incoming.state != ServiceState::Invalid {
            self.state = incoming.state;
        }
        if incoming.activity_timeout_ms != 0 {
            self.activity_timeout_ms = incoming.activity_timeout_ms;
        }
        self.smartbeat = incoming.smartbeat;
        if incoming.state == ServiceState::TimedOut {
            self.inactive = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Appended,
    /// An active record with the same key was moved to history.
    Displaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    MovedToHistory,
    MergedInHistory,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Number of active records refreshed.
    Updated(usize),
    /// A history record came back to the active set.
    Resurrected,
    Unknown,
}

pub struct ServiceCollection {
    active: Mutex<VecDeque<ServiceRecord>>,
    history: Mutex<VecDeque<ServiceRecord>>,
    history_capacity: usize,
}

impl Default for ServiceCollection {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ServiceCollection {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            active: Mutex::new(VecDeque::new()),
            history: Mutex::new(VecDeque::new()),
            history_capacity,
        }
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, VecDeque<ServiceRecord>>> {
        self.active
            .lock()
            .map_err(|_| Error::LockPoisoned("active services"))
    }

    fn lock_history(&self) -> Result<MutexGuard<'_, VecDeque<ServiceRecord>>> {
        self.history
            .lock()
            .map_err(|_| Error::LockPoisoned("service history"))
    }

    /// Newest at the front; trims from the back.
    fn push_history(&self, history: &mut VecDeque<ServiceRecord>, record: ServiceRecord) {
        history.push_front(record);
        while history.len() > self.history_capacity {
            if let Some(evicted) = history.pop_back() {
                debug!(
                    "evicting {} ({}) from service history",
                    evicted.name, evicted.key.id
                );
            }
        }
    }

    pub fn create(&self, record: ServiceRecord) -> Result<CreateOutcome> {
        let mut active = self.lock_active()?;
        let mut outcome = CreateOutcome::Appended;
        if let Some(pos) = active.iter().position(|r| r.key == record.key) {
            if let Some(mut old) = active.remove(pos) {
                info!(
                    "service {} ({}) at {} displaced by a new registration",
                    old.name, old.key.id, old.key.addr
                );
                old.displaced = true;
                let mut history = self.lock_history()?;
                self.push_history(&mut history, old);
                outcome = CreateOutcome::Displaced;
            }
        }
        info!(
            "service {} ({}) created at {}",
            record.name, record.key.id, record.key.addr
        );
        active.push_back(record);
        Ok(outcome)
    }

    /// Merges a destroy notification; an active match moves to history.
    pub fn destroy(&self, incoming: &ServiceRecord) -> Result<MergeOutcome> {
        self.retire(incoming, "destroyed")
    }

    /// Merges a state notification. Same path as [`ServiceCollection::destroy`]:
    /// an active match moves to history, a history match merges in place.
    pub fn update_state(&self, incoming: &ServiceRecord) -> Result<MergeOutcome> {
        self.retire(incoming, "reported state")
    }

    fn retire(&self, incoming: &ServiceRecord, event: &str) -> Result<MergeOutcome> {
        let mut active = self.lock_active()?;
        if let Some(pos) = active.iter().position(|r| r.key == incoming.key) {
            if let Some(mut record) = active.remove(pos) {
                record.merge(incoming);
                info!(
                    "service {} ({}) {event}, state {}",
                    record.name,
                    record.key.id,
                    record.state.as_str()
                );
                let mut history = self.lock_history()?;
                self.push_history(&mut history, record);
                return Ok(MergeOutcome::MovedToHistory);
            }
        }
        let mut history = self.lock_history()?;
        Ok(merge_late_arrival(&mut history, incoming))
    }

    /// Applies a state update to the active record reported from `addr`
    /// under `name` (case-insensitive).
    pub fn apply_state_update(
        &self,
        addr: SocketAddr,
        name: &str,
        state: ServiceState,
        state_name: Option<&str>,
    ) -> Result<bool> {
        if state == ServiceState::Invalid {
            return Ok(false);
        }
        let mut active = self.lock_active()?;
        match active
            .iter_mut()
            .find(|r| r.key.addr == addr && r.name.eq_ignore_ascii_case(name))
        {
            Some(record) => {
                record.state = state;
                if let Some(state_name) = state_name {
                    record.state_name = Some(state_name.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Records a smartbeat. Lifecycle state is left alone; a service only
    /// known to history comes back to the active set.
    pub fn heartbeat(
        &self,
        addr: SocketAddr,
        service_id: u64,
        smartbeat: Smartbeat,
        received_at: Smartbeat,
    ) -> Result<HeartbeatOutcome> {
        let mut active = self.lock_active()?;
        let mut updated = 0;
        for record in active
            .iter_mut()
            .filter(|r| r.key.addr == addr && r.key.id == service_id)
        {
            record.smartbeat = smartbeat;
            record.received_at = received_at;
            updated += 1;
        }
        if updated > 0 {
            return Ok(HeartbeatOutcome::Updated(updated));
        }

        let mut history = self.lock_history()?;
        let pos = history
            .iter()
            .position(|r| r.key.addr == addr && r.key.id == service_id);
        match pos.and_then(|pos| history.remove(pos)) {
            Some(mut record) => {
                record.smartbeat = smartbeat;
                record.received_at = received_at;
                record.inactive = false;
                record.displaced = false;
                info!(
                    "service {} ({}) at {} is alive again",
                    record.name, record.key.id, record.key.addr
                );
                active.push_back(record);
                Ok(HeartbeatOutcome::Resurrected)
            }
            None => Ok(HeartbeatOutcome::Unknown),
        }
    }

    /// Moves every active record not heard from within its activity timeout
    /// to history. `now` is taken once by the caller for the whole sweep.
    pub fn sweep(&self, now: &Smartbeat) -> Result<usize> {
        let mut active = self.lock_active()?;
        let mut history = self.lock_history()?;
        let mut timed_out = 0;
        let mut idx = 0;
        while idx < active.len() {
            let stale = {
                let record = &active[idx];
                has_timed_out(&record.received_at, now, record.activity_timeout_ms as u64)
            };
            if !stale {
                idx += 1;
                continue;
            }
            if let Some(mut record) = active.remove(idx) {
                info!(
                    "service {} ({}) at {} timed out after {} ms",
                    record.name, record.key.id, record.key.addr, record.activity_timeout_ms
                );
                record.inactive = true;
                self.push_history(&mut history, record);
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    pub fn active(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.lock_active()?.iter().cloned().collect())
    }

    /// History, newest first.
    pub fn history(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self.lock_history()?.iter().cloned().collect())
    }

    pub fn active_len(&self) -> Result<usize> {
        Ok(self.lock_active()?.len())
    }

    pub fn history_len(&self) -> Result<usize> {
        Ok(self.lock_history()?.len())
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Releases every record in both sets.
    pub fn clear(&self) -> Result<()> {
        let mut active = self.lock_active()?;
        let mut history = self.lock_history()?;
        active.clear();
        history.clear();
        Ok(())
    }
}

fn merge_late_arrival(history: &mut VecDeque<ServiceRecord>, incoming: &ServiceRecord) -> MergeOutcome {
    match history.iter_mut().find(|r| r.key == incoming.key) {
        Some(record) => {
            record.merge(incoming);
            if incoming.state != ServiceState::TimedOut {
                record.inactive = false;
            }
            MergeOutcome::MergedInHistory
        }
        None => MergeOutcome::NotFound,
    }
}
