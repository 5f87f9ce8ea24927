//! Monitor side of the fabric: turns inbound lifecycle notifications and
//! smartbeats into [`ServiceCollection`] operations and sweeps for services
//! that went quiet.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use crate::clock::Clock;
use crate::collection::{HeartbeatOutcome, ServiceCollection, ServiceKey, ServiceRecord};
use crate::config::MonitorConfig;
use crate::error::Result;
use crate::protocol::{NotificationKind, ServiceNotification, SmartbeatReport};
use crate::sequence::SequenceKind;
use crate::smartbeat::Smartbeat;
use crate::timer::{TimerEvent, TimerHandle, TimerReason, TimerSet};
use crate::transport::Inbound;

pub const MONITOR_SWEEP_TIMER_ID: u64 = 0x2000_0002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Notification(NotificationKind),
    /// Smartbeat applied to this many known services.
    Smartbeat(usize),
    Ignored,
    /// Malformed input, logged and discarded.
    Dropped,
}

pub struct Monitor {
    services: ServiceCollection,
    clock: Arc<dyn Clock>,
    default_activity_timeout_ms: u32,
}

impl Monitor {
    pub fn new(clock: Arc<dyn Clock>, config: &MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            services: ServiceCollection::new(config.history_capacity),
            clock,
            default_activity_timeout_ms: config.default_activity_timeout_ms,
        })
    }

    pub fn services(&self) -> &ServiceCollection {
        &self.services
    }

    pub fn handle(&self, inbound: &Inbound) -> Result<Handled> {
        let seq = &inbound.sequence;
        match seq.kind() {
            SequenceKind::Request => return Ok(Handled::Ignored),
            SequenceKind::Management => {}
            other => {
                info!(
                    "monitor ignoring {other:?} sequence {:#x} from {}",
                    seq.id(),
                    inbound.peer
                );
                return Ok(Handled::Ignored);
            }
        }

        match SmartbeatReport::from_sequence(seq) {
            Ok(Some(report)) => return self.apply_smartbeat(inbound, report),
            Ok(None) => {}
            Err(err) => {
                warn!("dropping smartbeat from {}: {err}", inbound.peer);
                return Ok(Handled::Dropped);
            }
        }

        match ServiceNotification::from_sequence(seq) {
            Ok(Some(notification)) => self.apply_notification(inbound, notification),
            Ok(None) => {
                debug!("monitor ignoring management sequence {:#x}", seq.id());
                Ok(Handled::Ignored)
            }
            Err(err) => {
                warn!("dropping service notification from {}: {err}", inbound.peer);
                Ok(Handled::Dropped)
            }
        }
    }

    fn now(&self) -> Smartbeat {
        Smartbeat::now(&*self.clock, 0)
    }

    fn apply_smartbeat(&self, inbound: &Inbound, report: SmartbeatReport) -> Result<Handled> {
        let addr = report.reporting_addr.unwrap_or(inbound.peer);
        let received_at = self.now();
        let mut applied = 0;
        for record in &report.records {
            match self
                .services
                .heartbeat(addr, record.service_id, record.smartbeat, received_at)?
            {
                HeartbeatOutcome::Updated(n) => applied += n,
                HeartbeatOutcome::Resurrected => applied += 1,
                HeartbeatOutcome::Unknown => {
                    debug!("smartbeat from unknown service {} at {addr}", record.service_id)
                }
            }
        }
        Ok(Handled::Smartbeat(applied))
    }

    fn apply_notification(
        &self,
        inbound: &Inbound,
        notification: ServiceNotification,
    ) -> Result<Handled> {
        let addr = notification.reporting_addr.unwrap_or(inbound.peer);
        if let Some(record) = self.record_from(addr, inbound, &notification) {
            match notification.kind {
                NotificationKind::Create => {
                    self.services.create(record)?;
                }
                NotificationKind::Destroy => {
                    let outcome = self.services.destroy(&record)?;
                    debug!("destroy of {} ({}): {outcome:?}", record.name, record.key.id);
                }
                NotificationKind::State => {
                    let outcome = self.services.update_state(&record)?;
                    debug!("state of {} ({}): {outcome:?}", record.name, record.key.id);
                }
            }
        } else if notification.kind == NotificationKind::Create {
            warn!("dropping service create from {} without an instance", inbound.peer);
            return Ok(Handled::Dropped);
        }

        if let (Some(state), Some(name)) = (notification.state_update, &notification.name) {
            self.services.apply_state_update(
                addr,
                name,
                state,
                notification.state_name.as_deref(),
            )?;
        }
        Ok(Handled::Notification(notification.kind))
    }

    fn record_from(
        &self,
        addr: SocketAddr,
        inbound: &Inbound,
        notification: &ServiceNotification,
    ) -> Option<ServiceRecord> {
        let instance = notification.instance?;
        let key = ServiceKey {
            addr,
            id: instance.id,
            service_type: instance.service_type,
        };
        let mut record = ServiceRecord::new(key, notification.name.clone().unwrap_or_default());
        record.group = notification.group.clone();
        record.protocol = inbound.protocol.clone();
        record.state = instance.state;
        record.state_name = notification.state_name.clone();
        record.smartbeat = instance.smartbeat;
        record.received_at = self.now();
        record.activity_timeout_ms = if instance.activity_timeout_ms == 0 {
            self.default_activity_timeout_ms
        } else {
            instance.activity_timeout_ms
        };
        Some(record)
    }

    /// Moves services whose activity timeout has passed to history.
    pub fn sweep(&self) -> Result<usize> {
        self.services.sweep(&self.now())
    }

    /// Runs [`Monitor::sweep`] every `interval_ms` on `timers`.
    pub fn start_sweeps(self: &Arc<Self>, timers: &TimerSet, interval_ms: u64) -> Result<TimerHandle> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        timers.schedule(
            MONITOR_SWEEP_TIMER_ID,
            interval_ms,
            move |set: &TimerSet, event: &TimerEvent| {
                if event.reason == TimerReason::Cancelled {
                    return;
                }
                let Some(monitor) = monitor.upgrade() else {
                    return;
                };
                if let Err(err) = monitor.sweep() {
                    warn!("service sweep failed: {err}");
                }
                if let Err(err) = set.reschedule(event.handle) {
                    warn!("failed to re-arm service sweep timer: {err}");
                }
            },
        )
    }
}
