//! Segmented sequences.
//!
//! A [`Sequence`] is an ordered list of tagged binary segments plus a side
//! list of meta segments that never leave the process. Segments either own a
//! copy of their bytes, share bytes the caller keeps a handle to, or point at
//! another sequence. Walking a sequence flattens nested sequences in place.

mod cursor;

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

pub use cursor::SegmentCursor;

pub const SEQUENCE_ID_INVALID: u64 = 0;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Invalid = 0,
    Data = 1,
    KeyValue = 2,
    Management = 3,
    Request = 4,
    Query = 5,
    Subscribe = 6,
}

impl SequenceKind {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Invalid),
            1 => Some(Self::Data),
            2 => Some(Self::KeyValue),
            3 => Some(Self::Management),
            4 => Some(Self::Request),
            5 => Some(Self::Query),
            6 => Some(Self::Subscribe),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Backing storage of a segment.
#[derive(Debug, Clone)]
pub enum SegmentData {
    /// Bytes copied into the sequence. `buf.len()` is the allocated size and
    /// `len` the used size.
    Owned { buf: Vec<u8>, len: usize },
    /// Bytes shared with the caller; the sequence only drops its own handle.
    External(Arc<[u8]>),
    /// Another sequence, flattened during iteration.
    Nested(SharedSequence),
}

#[derive(Debug, Clone)]
pub struct Segment {
    tag: u64,
    data: SegmentData,
}

impl Segment {
    fn owned(bytes: &[u8], tag: u64) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes.len())
            .map_err(|_| Error::OutOfMemory)?;
        buf.extend_from_slice(bytes);
        let len = buf.len();
        Ok(Self {
            tag,
            data: SegmentData::Owned { buf, len },
        })
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Used bytes of a leaf segment. Nested segments carry no bytes of their own.
    pub fn data(&self) -> &[u8] {
        match &self.data {
            SegmentData::Owned { buf, len } => &buf[..*len],
            SegmentData::External(bytes) => bytes,
            SegmentData::Nested(_) => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocated(&self) -> usize {
        match &self.data {
            SegmentData::Owned { buf, .. } => buf.len(),
            SegmentData::External(bytes) => bytes.len(),
            SegmentData::Nested(_) => 0,
        }
    }

    pub fn nested(&self) -> Option<&SharedSequence> {
        match &self.data {
            SegmentData::Nested(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn storage(&self) -> &SegmentData {
        &self.data
    }
}

/// Hooks invoked while walking a sequence.
///
/// `before` and `after` bracket every sequence visited, nested ones included.
/// An error from any hook stops the walk; `after` still runs for the sequence
/// being walked and the first error is returned.
pub trait SegmentVisitor {
    type Error;

    fn before(&mut self, _seq: &Sequence) -> std::result::Result<(), Self::Error> {
        Ok(())
    }

    fn segment(&mut self, seq: &Sequence, tag: u64, data: &[u8])
        -> std::result::Result<(), Self::Error>;

    fn after(&mut self, _seq: &Sequence) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

struct LeafFn<F>(F);

impl<F, E> SegmentVisitor for LeafFn<F>
where
    F: FnMut(u64, &[u8]) -> std::result::Result<(), E>,
{
    type Error = E;

    fn segment(&mut self, _seq: &Sequence, tag: u64, data: &[u8]) -> std::result::Result<(), E> {
        (self.0)(tag, data)
    }
}

#[derive(Debug)]
pub struct Sequence {
    id: u64,
    name: String,
    kind: SequenceKind,
    generation: AtomicU64,
    segments: Vec<Segment>,
    meta: Vec<Segment>,
}

impl Clone for Sequence {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            generation: AtomicU64::new(self.generation()),
            segments: self.segments.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl Sequence {
    /// Creates an empty sequence. An id of [`SEQUENCE_ID_INVALID`] is replaced
    /// with a random one.
    pub fn new(name: impl Into<String>, id: u64, kind: SequenceKind) -> Self {
        let id = if id == SEQUENCE_ID_INVALID {
            random_id()
        } else {
            id
        };
        Self {
            id,
            name: name.into(),
            kind,
            generation: AtomicU64::new(0),
            segments: Vec::new(),
            meta: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: SequenceKind) {
        self.kind = kind;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Marks cached or derived copies of this sequence as stale.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn add_owned_copy(&mut self, data: &[u8], tag: u64) -> Result<()> {
        let segment = Segment::owned(data, tag)?;
        push_segment(&mut self.segments, segment)
    }

    pub fn add_reference(&mut self, data: Arc<[u8]>, tag: u64) -> Result<()> {
        push_segment(
            &mut self.segments,
            Segment {
                tag,
                data: SegmentData::External(data),
            },
        )
    }

    pub fn add_nested(&mut self, nested: &SharedSequence, tag: u64) -> Result<()> {
        push_segment(
            &mut self.segments,
            Segment {
                tag,
                data: SegmentData::Nested(nested.hold()),
            },
        )
    }

    /// Removes up to `max` segments tagged `tag` (0 removes all). Returns how
    /// many were removed.
    pub fn remove_by_tag(&mut self, tag: u64, max: usize) -> usize {
        remove_tagged(&mut self.segments, tag, max)
    }

    pub fn find_segment(&self, tag: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.tag == tag)
    }

    pub fn find_data(&self, tag: u64) -> Option<&[u8]> {
        self.find_segment(tag).map(Segment::data)
    }

    pub fn add_meta_copy(&mut self, data: &[u8], tag: u64) -> Result<()> {
        let segment = Segment::owned(data, tag)?;
        push_segment(&mut self.meta, segment)
    }

    pub fn find_meta(&self, tag: u64) -> Option<&[u8]> {
        self.meta.iter().find(|s| s.tag == tag).map(Segment::data)
    }

    pub fn remove_meta_by_tag(&mut self, tag: u64, max: usize) -> usize {
        remove_tagged(&mut self.meta, tag, max)
    }

    /// Direct segments, nested sequences unexpanded.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Number of leaf segments, counting through nested sequences.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match &s.data {
                SegmentData::Nested(nested) => nested.len(),
                _ => 1,
            })
            .sum()
    }

    /// True when there are no leaf segments, even if empty nested
    /// sequences are attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf segments in insertion order with nested sequences flattened.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            stack: vec![self.segments.iter()],
        }
    }

    pub fn visit<V>(&self, visitor: &mut V) -> std::result::Result<(), V::Error>
    where
        V: SegmentVisitor + ?Sized,
    {
        if let Err(err) = visitor.before(self) {
            let _ = visitor.after(self);
            return Err(err);
        }
        for segment in &self.segments {
            let res = match &segment.data {
                SegmentData::Nested(nested) => nested.visit(visitor),
                _ => visitor.segment(self, segment.tag, segment.data()),
            };
            if let Err(err) = res {
                let _ = visitor.after(self);
                return Err(err);
            }
        }
        visitor.after(self)
    }

    /// Walks leaf segments with a closure; the first error stops the walk.
    pub fn for_each_leaf<F, E>(&self, f: F) -> std::result::Result<(), E>
    where
        F: FnMut(u64, &[u8]) -> std::result::Result<(), E>,
    {
        self.visit(&mut LeafFn(f))
    }

    pub fn cursor(&mut self) -> SegmentCursor<'_> {
        SegmentCursor::new(&mut self.segments)
    }

    pub fn into_shared(self) -> SharedSequence {
        SharedSequence(Arc::new(self))
    }
}

fn push_segment(list: &mut Vec<Segment>, segment: Segment) -> Result<()> {
    list.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
    list.push(segment);
    Ok(())
}

fn remove_tagged(list: &mut Vec<Segment>, tag: u64, max: usize) -> usize {
    let mut removed = 0;
    list.retain(|s| {
        if s.tag == tag && (max == 0 || removed < max) {
            removed += 1;
            false
        } else {
            true
        }
    });
    removed
}

fn random_id() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != SEQUENCE_ID_INVALID {
            return id;
        }
    }
}

/// Flattening iterator over leaf segments, yielding `(tag, bytes)`.
pub struct Leaves<'a> {
    stack: Vec<std::slice::Iter<'a, Segment>>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;
            match top.next() {
                None => {
                    self.stack.pop();
                }
                Some(segment) => match &segment.data {
                    SegmentData::Nested(nested) => {
                        let inner: &'a Sequence = nested;
                        self.stack.push(inner.segments.iter());
                    }
                    _ => return Some((segment.tag, segment.data())),
                },
            }
        }
    }
}

/// A reference-counted sequence.
///
/// `hold` adds a holder, `release` drops one; the sequence is freed when the
/// last holder releases it.
#[derive(Debug)]
pub struct SharedSequence(Arc<Sequence>);

impl SharedSequence {
    pub fn hold(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    /// Drops this holder. Returns `true` when it was the last one and the
    /// sequence has been freed.
    pub fn release(self) -> bool {
        Arc::into_inner(self.0).is_some()
    }

    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Mutable access, available only while there is a single holder.
    pub fn get_mut(&mut self) -> Option<&mut Sequence> {
        Arc::get_mut(&mut self.0)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Clone for SharedSequence {
    fn clone(&self) -> Self {
        self.hold()
    }
}

impl Deref for SharedSequence {
    type Target = Sequence;

    fn deref(&self) -> &Sequence {
        &self.0
    }
}

impl From<Sequence> for SharedSequence {
    fn from(seq: Sequence) -> Self {
        seq.into_shared()
    }
}
