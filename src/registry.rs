//! Bucketed registry stores.
//!
//! A [`RegistryStore`] files entries into 27 buckets by the first letter of
//! their key (A-Z, then one overflow bucket). Entries live in a slab and each
//! bucket is a doubly linked list of slab indices, so an [`EntryHandle`]
//! stays valid while other entries come and go. Handles carry a generation;
//! a handle to a removed entry never aliases a later one.
//!
//! A [`Registry`] owns the default store, the named group stores and the
//! live-entry counter shared by all of them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::transport::FlowId;

pub const BUCKET_COUNT: usize = 27;
pub const OVERFLOW_BUCKET: usize = BUCKET_COUNT - 1;

/// Bucket for `key`: its uppercased first letter, or the overflow bucket.
pub fn bucket_of(key: &str) -> usize {
    match key.bytes().next() {
        Some(b) if b.is_ascii_alphabetic() => (b.to_ascii_uppercase() - b'A') as usize,
        _ => OVERFLOW_BUCKET,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry<T> {
    pub key: String,
    pub group: String,
    /// Expiry in nanoseconds since the epoch; `None` never expires.
    pub expires_at: Option<u64>,
    /// Flow the entry arrived on, compared by identity only.
    pub flow: Option<FlowId>,
    pub payload: T,
}

impl<T> RegistryEntry<T> {
    pub fn new(key: impl Into<String>, group: impl Into<String>, payload: T) -> Self {
        Self {
            key: key.into(),
            group: group.into(),
            expires_at: None,
            flow: None,
            payload,
        }
    }

    pub fn with_flow(mut self, flow: FlowId) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if now > at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: usize,
    generation: u64,
}

struct Node<T> {
    entry: Option<RegistryEntry<T>>,
    generation: u64,
    bucket: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Live-entry count shared by every store of a registry.
#[derive(Debug, Default)]
pub struct LiveCounter {
    count: AtomicUsize,
    limit: Option<usize>,
}

impl LiveCounter {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn acquire(&self) -> Result<()> {
        match self.limit {
            None => {
                self.count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(limit) => self
                .count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| Error::CapacityExceeded { limit }),
        }
    }

    fn release(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct RegistryStore<T> {
    group: String,
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    heads: [Option<usize>; BUCKET_COUNT],
    tails: [Option<usize>; BUCKET_COUNT],
    len: usize,
    live: Arc<LiveCounter>,
}

impl<T> RegistryStore<T> {
    pub fn new(group: impl Into<String>, live: Arc<LiveCounter>) -> Self {
        Self {
            group: group.into(),
            nodes: Vec::new(),
            free: Vec::new(),
            heads: [None; BUCKET_COUNT],
            tails: [None; BUCKET_COUNT],
            len: 0,
            live,
        }
    }

    /// Group name; empty for the default store.
    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn index_of(&self, handle: EntryHandle) -> Option<usize> {
        let node = self.nodes.get(handle.index)?;
        (node.generation == handle.generation && node.entry.is_some()).then_some(handle.index)
    }

    fn handle(&self, index: usize) -> EntryHandle {
        EntryHandle {
            index,
            generation: self.nodes[index].generation,
        }
    }

    /// Appends `entry` to the tail of its bucket.
    pub fn add(&mut self, entry: RegistryEntry<T>) -> Result<EntryHandle> {
        self.live.acquire()?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.nodes.try_reserve(1).is_err() {
                    self.live.release();
                    return Err(Error::OutOfMemory);
                }
                self.nodes.push(Node {
                    entry: None,
                    generation: 0,
                    bucket: 0,
                    prev: None,
                    next: None,
                });
                self.nodes.len() - 1
            }
        };

        let bucket = bucket_of(&entry.key);
        let tail = self.tails[bucket];
        {
            let node = &mut self.nodes[index];
            node.entry = Some(entry);
            node.bucket = bucket;
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(t) => self.nodes[t].next = Some(index),
            None => self.heads[bucket] = Some(index),
        }
        self.tails[bucket] = Some(index);
        self.len += 1;
        Ok(self.handle(index))
    }

    /// Detaches an entry and hands it back.
    pub fn remove(&mut self, handle: EntryHandle) -> Result<RegistryEntry<T>> {
        let index = self.index_of(handle).ok_or(Error::NotFound)?;
        let (bucket, prev, next) = {
            let node = &self.nodes[index];
            (node.bucket, node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.heads[bucket] = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tails[bucket] = prev,
        }
        let node = &mut self.nodes[index];
        node.generation += 1;
        node.prev = None;
        node.next = None;
        let entry = node.entry.take().ok_or(Error::NotFound)?;
        self.free.push(index);
        self.len -= 1;
        self.live.release();
        Ok(entry)
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&RegistryEntry<T>> {
        self.index_of(handle)
            .and_then(|i| self.nodes[i].entry.as_ref())
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut RegistryEntry<T>> {
        let index = self.index_of(handle)?;
        self.nodes[index].entry.as_mut()
    }

    /// Next entry with `key` (case-insensitive), from the head of its bucket
    /// or just after `after`.
    pub fn find(&self, key: &str, after: Option<EntryHandle>) -> Option<EntryHandle> {
        let mut cursor = match after {
            None => self.heads[bucket_of(key)],
            Some(h) => self.nodes[self.index_of(h)?].next,
        };
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            if node
                .entry
                .as_ref()
                .is_some_and(|e| e.key.eq_ignore_ascii_case(key))
            {
                return Some(self.handle(index));
            }
            cursor = node.next;
        }
        None
    }

    fn first_from_bucket(&self, bucket: usize) -> Option<usize> {
        self.heads[bucket..].iter().find_map(|head| *head)
    }

    /// First entry in bucket order.
    pub fn first(&self) -> Option<EntryHandle> {
        self.first_from_bucket(0).map(|i| self.handle(i))
    }

    /// Entry after `handle`, crossing into later buckets as needed.
    pub fn next(&self, handle: EntryHandle) -> Option<EntryHandle> {
        let node = &self.nodes[self.index_of(handle)?];
        let index = match node.next {
            Some(next) => Some(next),
            None if node.bucket + 1 < BUCKET_COUNT => self.first_from_bucket(node.bucket + 1),
            None => None,
        }?;
        Some(self.handle(index))
    }

    fn scan_from<F>(&self, after: Option<EntryHandle>, mut pred: F) -> Option<EntryHandle>
    where
        F: FnMut(&RegistryEntry<T>) -> bool,
    {
        let mut cursor = match after {
            None => self.first(),
            Some(h) => self.next(h),
        };
        while let Some(handle) = cursor {
            if self.get(handle).is_some_and(&mut pred) {
                return Some(handle);
            }
            cursor = self.next(handle);
        }
        None
    }

    /// Next entry whose expiry has passed `now`, in store order.
    pub fn find_expired(&self, now: u64, after: Option<EntryHandle>) -> Option<EntryHandle> {
        self.scan_from(after, |e| e.is_expired(now))
    }

    /// Next entry that arrived on `flow`, in store order.
    pub fn find_by_flow(&self, flow: FlowId, after: Option<EntryHandle>) -> Option<EntryHandle> {
        self.scan_from(after, |e| e.flow == Some(flow))
    }

    /// Removes every expired entry, returning them in store order.
    pub fn drain_expired(&mut self, now: u64) -> Result<Vec<RegistryEntry<T>>> {
        let mut expired = Vec::new();
        let mut cursor = self.find_expired(now, None);
        while let Some(handle) = cursor {
            let next = self.next(handle);
            expired.push(self.remove(handle)?);
            cursor = next.and_then(|h| {
                if self.get(h).is_some_and(|e| e.is_expired(now)) {
                    Some(h)
                } else {
                    self.find_expired(now, Some(h))
                }
            });
        }
        Ok(expired)
    }

    /// Entries in store order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            store: self,
            cursor: self.first(),
        }
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        while let Some(handle) = self.first() {
            let _ = self.remove(handle);
        }
    }
}

impl<T> Drop for RegistryStore<T> {
    fn drop(&mut self) {
        for _ in 0..self.len {
            self.live.release();
        }
    }
}

pub struct Iter<'a, T> {
    store: &'a RegistryStore<T>,
    cursor: Option<EntryHandle>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (EntryHandle, &'a RegistryEntry<T>);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        self.cursor = self.store.next(handle);
        self.store.get(handle).map(|entry| (handle, entry))
    }
}

pub type StoreRef<T> = Arc<Mutex<RegistryStore<T>>>;

/// Default store, named group stores and their shared live counter.
pub struct Registry<T> {
    default: StoreRef<T>,
    groups: Mutex<Vec<StoreRef<T>>>,
    live: Arc<LiveCounter>,
}

impl<T> Registry<T> {
    /// `limit` caps live entries across all stores.
    pub fn new(limit: Option<usize>) -> Self {
        let live = Arc::new(LiveCounter::new(limit));
        Self {
            default: Arc::new(Mutex::new(RegistryStore::new("", live.clone()))),
            groups: Mutex::new(Vec::new()),
            live,
        }
    }

    pub fn live_entries(&self) -> usize {
        self.live.get()
    }

    pub fn default_store(&self) -> StoreRef<T> {
        self.default.clone()
    }

    fn groups(&self) -> Result<MutexGuard<'_, Vec<StoreRef<T>>>> {
        self.groups
            .lock()
            .map_err(|_| Error::LockPoisoned("registry groups"))
    }

    /// Store for `group`; empty or unregistered names resolve to the default store.
    pub fn find_store(&self, group: &str) -> Result<StoreRef<T>> {
        if group.is_empty() {
            return Ok(self.default_store());
        }
        for store in self.groups()?.iter() {
            if lock_store(store)?.group == group {
                return Ok(store.clone());
            }
        }
        Ok(self.default_store())
    }

    /// Store for `group`, registering it on first use.
    pub fn find_or_add_store(&self, group: &str) -> Result<StoreRef<T>> {
        if group.is_empty() {
            return Ok(self.default_store());
        }
        let mut groups = self.groups()?;
        for store in groups.iter() {
            if lock_store(store)?.group == group {
                return Ok(store.clone());
            }
        }
        let store = Arc::new(Mutex::new(RegistryStore::new(group, self.live.clone())));
        groups.push(store.clone());
        Ok(store)
    }

    /// Calls `f` for each group store, then the default store, stopping at the
    /// first error.
    pub fn iterate_stores<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut RegistryStore<T>) -> Result<()>,
    {
        let groups: Vec<StoreRef<T>> = self.groups()?.clone();
        for store in groups.iter().chain(std::iter::once(&self.default)) {
            let mut guard = lock_store(store)?;
            f(&mut guard)?;
        }
        Ok(())
    }
}

pub fn lock_store<T>(store: &StoreRef<T>) -> Result<MutexGuard<'_, RegistryStore<T>>> {
    store
        .lock()
        .map_err(|_| Error::LockPoisoned("registry store"))
}
