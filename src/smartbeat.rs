//! Smartbeats: liveness stamps, staleness checks and periodic emission.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, warn};

use crate::clock::{Clock, NANOS_PER_MICRO};
use crate::error::{Error, Result};
use crate::protocol::{
    encode_addr, tags, SmartbeatRecord, SMARTBEAT_SEQUENCE_ID, SMARTBEAT_SEQUENCE_NAME,
};
use crate::sequence::{Sequence, SequenceKind, SharedSequence};
use crate::timer::{TimerEvent, TimerHandle, TimerReason, TimerSet};
use crate::transport::{FlowId, Transport};

pub const SMARTBEAT_TIMER_ID: u64 = 0x2000_0000;
pub const DEFAULT_SMARTBEAT_INTERVAL_MS: u64 = 500;
/// Service id carried by name-service heartbeats.
pub const NAME_SERVICE_SMARTBEAT_ID: u64 = 0;

const MICROS_PER_SEC: u64 = 1_000_000;

/// Wall-clock stamp plus a checkpoint the sender bumps as it makes progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Smartbeat {
    pub sec: u64,
    pub usec: u64,
    pub checkpoint: u64,
}

impl Smartbeat {
    pub fn from_nanos(nanos: u64, checkpoint: u64) -> Self {
        let micros = nanos / NANOS_PER_MICRO;
        Self {
            sec: micros / MICROS_PER_SEC,
            usec: micros % MICROS_PER_SEC,
            checkpoint,
        }
    }

    pub fn now(clock: &dyn Clock, checkpoint: u64) -> Self {
        Self::from_nanos(clock.now(), checkpoint)
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }
}

/// Stale iff `last + activity_timeout_ms` lies strictly before `current`.
pub fn has_timed_out(last: &Smartbeat, current: &Smartbeat, activity_timeout_ms: u64) -> bool {
    let usec = last.usec + activity_timeout_ms * 1000;
    let sec = last.sec + usec / MICROS_PER_SEC;
    let usec = usec % MICROS_PER_SEC;
    (sec, usec) < (current.sec, current.usec)
}

/// A service whose liveness this process reports.
#[derive(Debug)]
pub struct TrackedService {
    id: u64,
    checkpoint: AtomicU64,
    flows: Mutex<Vec<FlowId>>,
}

impl TrackedService {
    /// `flows` are the observers (monitoring, notification) that should hear
    /// this service's smartbeats.
    pub fn new(id: u64, flows: Vec<FlowId>) -> Arc<Self> {
        Arc::new(Self {
            id,
            checkpoint: AtomicU64::new(0),
            flows: Mutex::new(flows),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    pub fn bump_checkpoint(&self) -> u64 {
        self.checkpoint.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn set_flows(&self, flows: Vec<FlowId>) -> Result<()> {
        *self
            .flows
            .lock()
            .map_err(|_| Error::LockPoisoned("tracked service flows"))? = flows;
        Ok(())
    }

    pub fn flows(&self) -> Result<Vec<FlowId>> {
        Ok(self
            .flows
            .lock()
            .map_err(|_| Error::LockPoisoned("tracked service flows"))?
            .clone())
    }
}

/// Outcome of one emission round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitSummary {
    pub sent: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct Tracked {
    services: Vec<Arc<TrackedService>>,
    name_services: Vec<FlowId>,
}

impl Tracked {
    fn is_empty(&self) -> bool {
        self.services.is_empty() && self.name_services.is_empty()
    }
}

/// Periodically sends smartbeats for every tracked service and name service.
///
/// Each round sends one `Smartbeat` management sequence per distinct
/// destination flow, carrying a record per service and the local address the
/// flow reports. Destinations that cannot be resolved or refuse the send are
/// skipped with a warning; the round always completes.
pub struct SmartbeatController {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    interval_ms: u64,
    tracked: Mutex<Tracked>,
    timer: Mutex<Option<TimerHandle>>,
}

impl SmartbeatController {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, interval_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            transport,
            clock,
            interval_ms,
            tracked: Mutex::new(Tracked::default()),
            timer: Mutex::new(None),
        })
    }

    fn tracked(&self) -> Result<MutexGuard<'_, Tracked>> {
        self.tracked
            .lock()
            .map_err(|_| Error::LockPoisoned("smartbeat controller"))
    }

    /// Starts reporting `service`; the first tracked entity arms the timer.
    /// Nothing is tracked if the timer cannot be armed.
    pub fn add_service(self: &Arc<Self>, service: Arc<TrackedService>, timers: &TimerSet) -> Result<()> {
        self.tracked()?.services.push(service.clone());
        if let Err(err) = self.ensure_timer(timers) {
            self.tracked()?
                .services
                .retain(|s| !Arc::ptr_eq(s, &service));
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_service(&self, id: u64) -> Result<bool> {
        let mut tracked = self.tracked()?;
        let before = tracked.services.len();
        tracked.services.retain(|s| s.id != id);
        Ok(tracked.services.len() != before)
    }

    pub fn add_name_service(self: &Arc<Self>, flow: FlowId, timers: &TimerSet) -> Result<()> {
        let added = {
            let mut tracked = self.tracked()?;
            let added = !tracked.name_services.contains(&flow);
            if added {
                tracked.name_services.push(flow);
            }
            added
        };
        if let Err(err) = self.ensure_timer(timers) {
            if added {
                self.tracked()?.name_services.retain(|f| *f != flow);
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_name_service(&self, flow: FlowId) -> Result<bool> {
        let mut tracked = self.tracked()?;
        let before = tracked.name_services.len();
        tracked.name_services.retain(|f| *f != flow);
        Ok(tracked.name_services.len() != before)
    }

    pub fn is_armed(&self) -> Result<bool> {
        Ok(self
            .timer
            .lock()
            .map_err(|_| Error::LockPoisoned("smartbeat timer"))?
            .is_some())
    }

    fn ensure_timer(self: &Arc<Self>, timers: &TimerSet) -> Result<()> {
        let mut timer = self
            .timer
            .lock()
            .map_err(|_| Error::LockPoisoned("smartbeat timer"))?;
        if let Some(handle) = *timer {
            if timers.is_scheduled(handle)? {
                return Ok(());
            }
        }
        let controller: Weak<Self> = Arc::downgrade(self);
        let handle = timers.schedule(
            SMARTBEAT_TIMER_ID,
            self.interval_ms,
            move |set: &TimerSet, event: &TimerEvent| {
                if event.reason == TimerReason::Cancelled {
                    return;
                }
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                if let Err(err) = controller.emit() {
                    warn!("smartbeat emission failed: {err}");
                }
                if let Err(err) = set.reschedule(event.handle) {
                    warn!("failed to re-arm smartbeat timer: {err}");
                }
            },
        )?;
        *timer = Some(handle);
        Ok(())
    }

    /// Sends one round of smartbeats now.
    pub fn emit(&self) -> Result<EmitSummary> {
        let now = self.clock.now();
        let (services, name_flows) = {
            let tracked = self.tracked()?;
            if tracked.is_empty() {
                return Ok(EmitSummary::default());
            }
            (tracked.services.clone(), tracked.name_services.clone())
        };

        let mut summary = EmitSummary::default();

        if !services.is_empty() {
            let mut body = Sequence::new("smartbeat records", 0, SequenceKind::Data);
            let mut destinations: Vec<FlowId> = Vec::new();
            for service in &services {
                let record = SmartbeatRecord {
                    service_id: service.id,
                    smartbeat: Smartbeat::from_nanos(now, service.checkpoint()),
                };
                body.add_owned_copy(&record.to_bytes(), tags::SMARTBEAT_RECORD)?;
                for flow in service.flows()? {
                    if !destinations.contains(&flow) {
                        destinations.push(flow);
                    }
                }
            }
            self.fan_out(&body.into_shared(), &destinations, &mut summary)?;
        }

        if !name_flows.is_empty() {
            let record = SmartbeatRecord {
                service_id: NAME_SERVICE_SMARTBEAT_ID,
                smartbeat: Smartbeat::from_nanos(now, 0),
            };
            let mut body = Sequence::new("name service smartbeat", 0, SequenceKind::Data);
            body.add_owned_copy(&record.to_bytes(), tags::SMARTBEAT_RECORD)?;
            self.fan_out(&body.into_shared(), &name_flows, &mut summary)?;
        }

        debug!(
            "smartbeat round: {} sent, {} skipped",
            summary.sent, summary.skipped
        );
        Ok(summary)
    }

    fn fan_out(&self, body: &SharedSequence, flows: &[FlowId], summary: &mut EmitSummary) -> Result<()> {
        for &flow in flows {
            let local: SocketAddr = match self.transport.local_addr(flow) {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("skipping smartbeat to flow {flow}: no local address ({err})");
                    summary.skipped += 1;
                    continue;
                }
            };
            let mut seq = Sequence::new(
                SMARTBEAT_SEQUENCE_NAME,
                SMARTBEAT_SEQUENCE_ID,
                SequenceKind::Management,
            );
            seq.add_owned_copy(&encode_addr(&local), tags::REPORTING_ADDR)?;
            seq.add_nested(body, 0)?;
            match self.transport.send(flow, &seq) {
                Ok(()) => summary.sent += 1,
                Err(err) => {
                    warn!("smartbeat send to flow {flow} failed: {err}");
                    summary.skipped += 1;
                }
            }
        }
        Ok(())
    }
}
