//! Timer sets driven from an embedding event loop.
//!
//! A [`TimerSet`] keeps armed timers in two buckets sorted by expiry: one for
//! periods under a second and one for everything else. The loop sizes its
//! poll timeout with [`TimerSet::next_due_ms`] and calls
//! [`TimerSet::dispatch`] when it wakes. Callbacks run with the set unlocked
//! and may schedule, reschedule or cancel timers on the same set.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::debug;

use crate::clock::{Clock, NANOS_PER_MILLI};
use crate::error::{Error, Result};

const SUB_SECOND_MS: u64 = 1000;

pub type TimerCallback = Box<dyn FnMut(&TimerSet, &TimerEvent) + Send>;

/// Stable reference to a scheduled timer. A handle goes stale once its timer
/// is released; stale handles are reported as [`Error::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReason {
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub handle: TimerHandle,
    pub id: u64,
    pub reason: TimerReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Every due timer fired.
    Complete(usize),
    /// The callback cap was hit; due timers may remain.
    CapReached(usize),
}

impl DispatchStatus {
    pub fn fired(self) -> usize {
        match self {
            Self::Complete(n) | Self::CapReached(n) => n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Armed,
    Firing,
    CancelledWhileFiring,
    /// Re-armed by its own callback, then cancelled before that callback
    /// returned. The Cancelled call runs once dispatch gets the callback back.
    CancelPending,
    Cancelling,
}

struct Slot {
    generation: u64,
    state: SlotState,
    id: u64,
    period_ms: u64,
    expiry_ns: u64,
    /// Dispatch holds the callback.
    firing: bool,
    callback: Option<TimerCallback>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            generation: 0,
            state: SlotState::Free,
            id: 0,
            period_ms: 0,
            expiry_ns: 0,
            firing: false,
            callback: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    SubSecond,
    Coarse,
}

impl Bucket {
    fn for_period(period_ms: u64) -> Self {
        if period_ms < SUB_SECOND_MS {
            Self::SubSecond
        } else {
            Self::Coarse
        }
    }
}

struct TimerSlots {
    slots: Vec<Slot>,
    free: Vec<usize>,
    sub_second: VecDeque<usize>,
    coarse: VecDeque<usize>,
}

impl TimerSlots {
    fn with_capacity(max_preallocated: usize) -> Self {
        let slots: Vec<Slot> = (0..max_preallocated).map(|_| Slot::vacant()).collect();
        // Reverse so the lowest index is handed out first.
        let free = (0..max_preallocated).rev().collect();
        Self {
            slots,
            free,
            sub_second: VecDeque::new(),
            coarse: VecDeque::new(),
        }
    }

    fn bucket(&mut self, bucket: Bucket) -> &mut VecDeque<usize> {
        match bucket {
            Bucket::SubSecond => &mut self.sub_second,
            Bucket::Coarse => &mut self.coarse,
        }
    }

    fn acquire(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::vacant());
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.state = SlotState::Free;
        slot.firing = false;
        slot.callback = None;
        self.free.push(index);
    }

    fn slot(&mut self, handle: TimerHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation && slot.state != SlotState::Free => {
                Ok(slot)
            }
            _ => Err(Error::NotFound),
        }
    }

    /// Ordered insert, scanning back from the tail; equal expiries keep FIFO order.
    fn link(&mut self, index: usize) {
        let expiry = self.slots[index].expiry_ns;
        let bucket = Bucket::for_period(self.slots[index].period_ms);
        let slots = &self.slots;
        let list = match bucket {
            Bucket::SubSecond => &mut self.sub_second,
            Bucket::Coarse => &mut self.coarse,
        };
        let pos = list
            .iter()
            .rposition(|&i| slots[i].expiry_ns <= expiry)
            .map_or(0, |p| p + 1);
        list.insert(pos, index);
    }

    fn unlink(&mut self, index: usize) {
        let bucket = Bucket::for_period(self.slots[index].period_ms);
        let list = self.bucket(bucket);
        if let Some(pos) = list.iter().position(|&i| i == index) {
            list.remove(pos);
        }
    }

    fn handle(&self, index: usize) -> TimerHandle {
        TimerHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn pop_due(&mut self, bucket: Bucket, now: u64) -> Option<(TimerHandle, u64, Option<TimerCallback>)> {
        let index = *self.bucket(bucket).front()?;
        if self.slots[index].expiry_ns > now {
            return None;
        }
        self.bucket(bucket).pop_front();
        let handle = self.handle(index);
        let slot = &mut self.slots[index];
        slot.state = SlotState::Firing;
        slot.firing = true;
        Some((handle, slot.id, slot.callback.take()))
    }

    /// Takes the callback back from dispatch. Returns it when a Cancelled call
    /// is still owed; the caller runs it and then releases the slot.
    fn finish_firing(
        &mut self,
        handle: TimerHandle,
        callback: Option<TimerCallback>,
    ) -> Option<TimerCallback> {
        let slot = match self.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot,
            _ => return None,
        };
        slot.firing = false;
        let state = slot.state;
        match state {
            // Re-armed by its own callback: keep the slot, restore the callback.
            SlotState::Armed => {
                slot.callback = callback;
                None
            }
            SlotState::CancelPending => {
                slot.state = SlotState::Cancelling;
                callback
            }
            SlotState::Firing | SlotState::CancelledWhileFiring => {
                self.release(handle.index);
                None
            }
            SlotState::Free | SlotState::Cancelling => None,
        }
    }

    fn earliest_expiry(&self) -> Option<u64> {
        let head = |list: &VecDeque<usize>| list.front().map(|&i| self.slots[i].expiry_ns);
        match (head(&self.sub_second), head(&self.coarse)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

fn expiry_after(now: u64, delay_ms: u64) -> Result<u64> {
    delay_ms
        .checked_mul(NANOS_PER_MILLI)
        .and_then(|delay_ns| now.checked_add(delay_ns))
        .ok_or(Error::InvalidDelay)
}

pub struct TimerSet {
    clock: Arc<dyn Clock>,
    slots: Mutex<TimerSlots>,
}

impl TimerSet {
    /// Creates a set with `max_preallocated` slots ready in the free pool.
    pub fn new(clock: Arc<dyn Clock>, max_preallocated: usize) -> Self {
        Self {
            clock,
            slots: Mutex::new(TimerSlots::with_capacity(max_preallocated)),
        }
    }

    /// Creates a shared set, optionally registered with an owner that
    /// dispatches several sets from one loop.
    pub fn create(
        clock: Arc<dyn Clock>,
        max_preallocated: usize,
        owner: Option<&TimerPools>,
    ) -> Result<Arc<Self>> {
        let set = Arc::new(Self::new(clock, max_preallocated));
        if let Some(pools) = owner {
            pools.register(&set)?;
        }
        Ok(set)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> Result<MutexGuard<'_, TimerSlots>> {
        self.slots
            .lock()
            .map_err(|_| Error::LockPoisoned("timer set"))
    }

    /// Arms a timer `delay_ms` from now. The delay doubles as the period used
    /// by [`TimerSet::reschedule`].
    pub fn schedule<F>(&self, id: u64, delay_ms: u64, callback: F) -> Result<TimerHandle>
    where
        F: FnMut(&TimerSet, &TimerEvent) + Send + 'static,
    {
        if delay_ms == 0 {
            return Err(Error::InvalidDelay);
        }
        let expiry_ns = expiry_after(self.clock.now(), delay_ms)?;
        let mut slots = self.lock()?;
        let index = slots.acquire();
        {
            let slot = &mut slots.slots[index];
            slot.state = SlotState::Armed;
            slot.id = id;
            slot.period_ms = delay_ms;
            slot.expiry_ns = expiry_ns;
            slot.callback = Some(Box::new(callback));
        }
        slots.link(index);
        Ok(slots.handle(index))
    }

    /// Re-arms a timer one period from now, keeping its id and callback.
    pub fn reschedule(&self, handle: TimerHandle) -> Result<()> {
        let now = self.clock.now();
        let mut slots = self.lock()?;
        let slot = slots.slot(handle)?;
        match slot.state {
            SlotState::Armed | SlotState::Firing => {}
            _ => return Err(Error::NotFound),
        }
        let was_armed = slot.state == SlotState::Armed;
        slot.expiry_ns = expiry_after(now, slot.period_ms)?;
        slot.state = SlotState::Armed;
        if was_armed {
            slots.unlink(handle.index);
        }
        slots.link(handle.index);
        Ok(())
    }

    /// Disarms a timer and runs its callback once with
    /// [`TimerReason::Cancelled`]. Cancelling the timer whose callback is
    /// currently running releases it once that callback returns; if the
    /// callback had re-armed it, the Cancelled call runs at that point.
    pub fn cancel(&self, handle: TimerHandle) -> Result<()> {
        let (id, callback) = {
            let mut slots = self.lock()?;
            let slot = slots.slot(handle)?;
            let (state, firing) = (slot.state, slot.firing);
            match state {
                SlotState::Armed if firing => {
                    slot.state = SlotState::CancelPending;
                    slots.unlink(handle.index);
                    return Ok(());
                }
                SlotState::Armed => {}
                SlotState::Firing => {
                    slot.state = SlotState::CancelledWhileFiring;
                    return Ok(());
                }
                _ => return Err(Error::NotFound),
            }
            slot.state = SlotState::Cancelling;
            let id = slot.id;
            let callback = slot.callback.take();
            slots.unlink(handle.index);
            (id, callback)
        };

        if let Some(mut callback) = callback {
            callback(
                self,
                &TimerEvent {
                    handle,
                    id,
                    reason: TimerReason::Cancelled,
                },
            );
        }
        self.lock()?.release(handle.index);
        Ok(())
    }

    /// Cancels the first armed timer carrying `id`, sub-second bucket first.
    pub fn cancel_by_id(&self, id: u64) -> Result<()> {
        let handle = {
            let slots = self.lock()?;
            let index = slots
                .sub_second
                .iter()
                .chain(slots.coarse.iter())
                .copied()
                .find(|&i| slots.slots[i].id == id)
                .ok_or(Error::NotFound)?;
            slots.handle(index)
        };
        self.cancel(handle)
    }

    /// Fires every timer due at the time of the call, in expiry order within
    /// each bucket. `max_callbacks` of 0 means no cap.
    pub fn dispatch(&self, max_callbacks: usize) -> Result<DispatchStatus> {
        let now = self.clock.now();
        let mut fired = 0;
        loop {
            let mut found = false;
            for bucket in [Bucket::SubSecond, Bucket::Coarse] {
                loop {
                    let due = self.lock()?.pop_due(bucket, now);
                    let (handle, id, mut callback) = match due {
                        Some(due) => due,
                        None => break,
                    };
                    found = true;
                    fired += 1;
                    if let Some(cb) = callback.as_mut() {
                        cb(
                            self,
                            &TimerEvent {
                                handle,
                                id,
                                reason: TimerReason::Expired,
                            },
                        );
                    }
                    let owed = self.lock()?.finish_firing(handle, callback);
                    if let Some(mut cb) = owed {
                        cb(
                            self,
                            &TimerEvent {
                                handle,
                                id,
                                reason: TimerReason::Cancelled,
                            },
                        );
                        self.lock()?.release(handle.index);
                    }
                    if max_callbacks != 0 && fired >= max_callbacks {
                        debug!("timer dispatch stopped after {fired} callbacks");
                        return Ok(DispatchStatus::CapReached(fired));
                    }
                }
            }
            if !found {
                return Ok(DispatchStatus::Complete(fired));
            }
        }
    }

    /// Time until the earliest armed timer, zero if one is overdue.
    pub fn next_due(&self) -> Result<Option<Duration>> {
        let earliest = self.lock()?.earliest_expiry();
        let now = self.clock.now();
        Ok(earliest.map(|expiry| Duration::from_nanos(expiry.saturating_sub(now))))
    }

    /// Poll timeout for the embedding loop: -1 when nothing is armed, 0 when
    /// a timer is overdue, otherwise milliseconds rounded up.
    pub fn next_due_ms(&self) -> Result<i64> {
        Ok(match self.next_due()? {
            None => -1,
            Some(wait) => {
                let nanos = wait.as_nanos();
                let ms = (nanos + NANOS_PER_MILLI as u128 - 1) / NANOS_PER_MILLI as u128;
                i64::try_from(ms).unwrap_or(i64::MAX)
            }
        })
    }

    pub fn pending(&self) -> Result<usize> {
        let slots = self.lock()?;
        Ok(slots.sub_second.len() + slots.coarse.len())
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> Result<bool> {
        let mut slots = self.lock()?;
        Ok(matches!(slots.slot(handle), Ok(slot) if slot.state == SlotState::Armed))
    }

    /// Disarms every timer, running Cancelled callbacks when `cancel_timers`
    /// is set. Returns how many timers were released.
    pub fn shutdown(&self, cancel_timers: bool) -> Result<usize> {
        let drained: Vec<(TimerHandle, u64, Option<TimerCallback>)> = {
            let mut guard = self.lock()?;
            let slots = &mut *guard;
            let mut indices: Vec<usize> = slots.sub_second.drain(..).collect();
            indices.extend(slots.coarse.drain(..));
            indices
                .into_iter()
                .map(|index| {
                    let handle = slots.handle(index);
                    let slot = &mut slots.slots[index];
                    slot.state = SlotState::Cancelling;
                    (handle, slot.id, slot.callback.take())
                })
                .collect()
        };

        let released = drained.len();
        for (handle, id, callback) in drained {
            if cancel_timers {
                if let Some(mut callback) = callback {
                    callback(
                        self,
                        &TimerEvent {
                            handle,
                            id,
                            reason: TimerReason::Cancelled,
                        },
                    );
                }
            }
            self.lock()?.release(handle.index);
        }
        Ok(released)
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        self.slots.lock().map(|s| s.free.len()).unwrap_or(0)
    }
}

/// Timer sets dispatched together by one event loop.
#[derive(Default)]
pub struct TimerPools {
    sets: Mutex<Vec<Weak<TimerSet>>>,
}

impl TimerPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, set: &Arc<TimerSet>) -> Result<()> {
        self.sets
            .lock()
            .map_err(|_| Error::LockPoisoned("timer pools"))?
            .push(Arc::downgrade(set));
        Ok(())
    }

    fn live(&self) -> Result<Vec<Arc<TimerSet>>> {
        let mut sets = self
            .sets
            .lock()
            .map_err(|_| Error::LockPoisoned("timer pools"))?;
        sets.retain(|weak| weak.strong_count() > 0);
        Ok(sets.iter().filter_map(Weak::upgrade).collect())
    }

    /// Dispatches every registered set; the cap applies per set.
    pub fn dispatch_all(&self, max_callbacks: usize) -> Result<DispatchStatus> {
        let mut fired = 0;
        let mut capped = false;
        for set in self.live()? {
            match set.dispatch(max_callbacks)? {
                DispatchStatus::Complete(n) => fired += n,
                DispatchStatus::CapReached(n) => {
                    fired += n;
                    capped = true;
                }
            }
        }
        Ok(if capped {
            DispatchStatus::CapReached(fired)
        } else {
            DispatchStatus::Complete(fired)
        })
    }

    pub fn next_due_ms(&self) -> Result<i64> {
        let mut earliest = -1;
        for set in self.live()? {
            let due = set.next_due_ms()?;
            if due >= 0 && (earliest < 0 || due < earliest) {
                earliest = due;
            }
        }
        Ok(earliest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, TimerSet) {
        let clock = Arc::new(ManualClock::new(1_000 * NANOS_PER_MILLI));
        let set = TimerSet::new(clock.clone(), 4);
        (clock, set)
    }

    fn recorder() -> (Arc<Mutex<Vec<(u64, TimerReason)>>>, impl Fn() -> TimerCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = log.clone();
        let make = move || -> TimerCallback {
            let log = shared.clone();
            Box::new(move |_set: &TimerSet, event: &TimerEvent| {
                log.lock().unwrap().push((event.id, event.reason));
            })
        };
        (log, make)
    }

    #[test]
    fn rejects_zero_delay() {
        let (_clock, set) = setup();
        assert!(matches!(set.schedule(1, 0, |_, _| {}), Err(Error::InvalidDelay)));
    }

    #[test]
    fn rejects_delay_past_clock_range() {
        let (_clock, set) = setup();
        assert!(matches!(
            set.schedule(1, u64::MAX / 2, |_, _| {}),
            Err(Error::InvalidDelay)
        ));
        assert!(matches!(
            set.schedule(2, u64::MAX / NANOS_PER_MILLI, |_, _| {}),
            Err(Error::InvalidDelay)
        ));
        assert_eq!(set.pending().unwrap(), 0);
    }

    #[test]
    fn dispatch_fires_in_expiry_order_per_bucket() {
        let (clock, set) = setup();
        let (log, make) = recorder();
        for (id, delay) in [(3, 300), (1, 100), (2, 200), (20, 2_000), (10, 1_000)] {
            set.schedule(id, delay, make()).unwrap();
        }
        clock.advance_ms(5_000);
        assert_eq!(set.dispatch(0).unwrap(), DispatchStatus::Complete(5));
        let ids: Vec<u64> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 10, 20]);
        assert_eq!(set.pending().unwrap(), 0);
    }

    #[test]
    fn only_due_timers_fire() {
        let (clock, set) = setup();
        let (log, make) = recorder();
        set.schedule(1, 100, make()).unwrap();
        set.schedule(2, 500, make()).unwrap();
        clock.advance_ms(100);
        assert_eq!(set.dispatch(0).unwrap(), DispatchStatus::Complete(1));
        assert_eq!(log.lock().unwrap().as_slice(), &[(1, TimerReason::Expired)]);
        assert_eq!(set.pending().unwrap(), 1);
    }

    #[test]
    fn next_due_ms_rounds_up() {
        let (clock, set) = setup();
        assert_eq!(set.next_due_ms().unwrap(), -1);
        set.schedule(1, 10, |_, _| {}).unwrap();
        set.schedule(2, 3_000, |_, _| {}).unwrap();
        assert_eq!(set.next_due_ms().unwrap(), 10);
        clock.set(clock.now() + 9 * NANOS_PER_MILLI + 1);
        assert_eq!(set.next_due_ms().unwrap(), 1);
        clock.advance_ms(1);
        assert_eq!(set.next_due_ms().unwrap(), 0);
    }

    #[test]
    fn next_due_considers_coarse_bucket() {
        let (_clock, set) = setup();
        set.schedule(1, 1_500, |_, _| {}).unwrap();
        assert_eq!(set.next_due_ms().unwrap(), 1_500);
    }

    #[test]
    fn cancel_runs_callback_once_and_frees_slot() {
        let (_clock, set) = setup();
        let (log, make) = recorder();
        let handle = set.schedule(9, 50, make()).unwrap();
        let free_before = set.free_slots();
        set.cancel(handle).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &[(9, TimerReason::Cancelled)]);
        assert_eq!(set.free_slots(), free_before + 1);
        assert!(matches!(set.cancel(handle), Err(Error::NotFound)));
        assert!(matches!(set.reschedule(handle), Err(Error::NotFound)));
    }

    #[test]
    fn cancel_by_id_scans_both_buckets() {
        let (_clock, set) = setup();
        let (log, make) = recorder();
        set.schedule(77, 5_000, make()).unwrap();
        set.cancel_by_id(77).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &[(77, TimerReason::Cancelled)]);
        assert!(matches!(set.cancel_by_id(77), Err(Error::NotFound)));
    }

    #[test]
    fn self_rescheduling_timer_keeps_its_slot() {
        let (clock, set) = setup();
        let count = Arc::new(Mutex::new(0));
        let seen = count.clone();
        let handle = set
            .schedule(5, 100, move |s, e| {
                *seen.lock().unwrap() += 1;
                s.reschedule(e.handle).unwrap();
            })
            .unwrap();
        let free_before = set.free_slots();
        for _ in 0..3 {
            clock.advance_ms(100);
            assert_eq!(set.dispatch(0).unwrap(), DispatchStatus::Complete(1));
            assert!(set.is_scheduled(handle).unwrap());
            assert_eq!(set.free_slots(), free_before);
        }
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[test]
    fn timer_cancelled_from_own_callback_is_released_once() {
        let (clock, set) = setup();
        let (log, make) = recorder();
        let mut cb = make();
        let handle = set
            .schedule(6, 100, move |s, e| {
                cb(s, e);
                s.cancel(e.handle).unwrap();
            })
            .unwrap();
        let free_before = set.free_slots();
        clock.advance_ms(100);
        set.dispatch(0).unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), &[(6, TimerReason::Expired)]);
        assert_eq!(set.free_slots(), free_before + 1);
        assert!(!set.is_scheduled(handle).unwrap());
    }

    #[test]
    fn rearmed_then_cancelled_from_own_callback_gets_cancelled_call() {
        let (clock, set) = setup();
        let (log, make) = recorder();
        let mut cb = make();
        let handle = set
            .schedule(8, 100, move |s, e| {
                cb(s, e);
                if e.reason == TimerReason::Expired {
                    s.reschedule(e.handle).unwrap();
                    s.cancel(e.handle).unwrap();
                }
            })
            .unwrap();
        let free_before = set.free_slots();
        clock.advance_ms(100);
        assert_eq!(set.dispatch(0).unwrap(), DispatchStatus::Complete(1));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[(8, TimerReason::Expired), (8, TimerReason::Cancelled)]
        );
        assert_eq!(set.free_slots(), free_before + 1);
        assert_eq!(set.pending().unwrap(), 0);
        assert!(!set.is_scheduled(handle).unwrap());
    }

    #[test]
    fn dispatch_reports_cap() {
        let (clock, set) = setup();
        for id in 0..3 {
            set.schedule(id, 10 + id, |_, _| {}).unwrap();
        }
        clock.advance_ms(50);
        assert_eq!(set.dispatch(2).unwrap(), DispatchStatus::CapReached(2));
        assert_eq!(set.dispatch(2).unwrap(), DispatchStatus::Complete(1));
    }

    #[test]
    fn pool_grows_beyond_preallocation() {
        let (_clock, set) = setup();
        for id in 0..10 {
            set.schedule(id, 100, |_, _| {}).unwrap();
        }
        assert_eq!(set.pending().unwrap(), 10);
    }

    #[test]
    fn shutdown_cancels_remaining_timers() {
        let (_clock, set) = setup();
        let (log, make) = recorder();
        for id in [1, 2] {
            set.schedule(id, id * 700, make()).unwrap();
        }
        assert_eq!(set.shutdown(true).unwrap(), 2);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(set.next_due_ms().unwrap(), -1);
    }

    #[test]
    fn pools_dispatch_every_registered_set() {
        let clock = Arc::new(ManualClock::new(0));
        let pools = TimerPools::new();
        let a = TimerSet::create(clock.clone(), 2, Some(&pools)).unwrap();
        let b = TimerSet::create(clock.clone(), 2, Some(&pools)).unwrap();
        a.schedule(1, 40, |_, _| {}).unwrap();
        b.schedule(2, 20, |_, _| {}).unwrap();
        assert_eq!(pools.next_due_ms().unwrap(), 20);
        clock.advance_ms(40);
        assert_eq!(pools.dispatch_all(0).unwrap(), DispatchStatus::Complete(2));
        drop(b);
        assert_eq!(pools.next_due_ms().unwrap(), -1);
    }
}
