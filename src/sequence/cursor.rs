use crate::error::{Error, Result};

use super::{Segment, SegmentData};

/// Bidirectional cursor over the direct segments of a sequence.
///
/// A fresh cursor sits before the first segment: `move_next` lands on the
/// first segment and `move_prev` on the last. Stepping past either end parks
/// the cursor again.
pub struct SegmentCursor<'a> {
    segments: &'a mut Vec<Segment>,
    pos: Option<usize>,
}

impl<'a> SegmentCursor<'a> {
    pub(super) fn new(segments: &'a mut Vec<Segment>) -> Self {
        Self {
            segments,
            pos: None,
        }
    }

    pub fn move_first(&mut self) -> bool {
        self.pos = if self.segments.is_empty() { None } else { Some(0) };
        self.pos.is_some()
    }

    pub fn move_last(&mut self) -> bool {
        self.pos = self.segments.len().checked_sub(1);
        self.pos.is_some()
    }

    pub fn move_next(&mut self) -> bool {
        match self.pos {
            None => self.move_first(),
            Some(idx) if idx + 1 < self.segments.len() => {
                self.pos = Some(idx + 1);
                true
            }
            Some(_) => {
                self.pos = None;
                false
            }
        }
    }

    pub fn move_prev(&mut self) -> bool {
        match self.pos {
            None => self.move_last(),
            Some(0) => {
                self.pos = None;
                false
            }
            Some(idx) => {
                self.pos = Some(idx - 1);
                true
            }
        }
    }

    pub fn current(&self) -> Option<&Segment> {
        self.pos.and_then(|idx| self.segments.get(idx))
    }

    fn current_mut(&mut self) -> Result<&mut Segment> {
        let idx = self.pos.ok_or(Error::NotFound)?;
        self.segments.get_mut(idx).ok_or(Error::NotFound)
    }

    fn owned_mut(&mut self) -> Result<(&mut Vec<u8>, &mut usize)> {
        match &mut self.current_mut()?.data {
            SegmentData::Owned { buf, len } => Ok((buf, len)),
            _ => Err(Error::NotOwned),
        }
    }

    pub fn retag(&mut self, tag: u64) -> Result<()> {
        self.current_mut()?.tag = tag;
        Ok(())
    }

    /// Overwrites the current segment's bytes within its allocation.
    pub fn copy_data(&mut self, data: &[u8]) -> Result<()> {
        let (buf, len) = self.owned_mut()?;
        if data.len() > buf.len() {
            return Err(Error::SegmentTooSmall {
                requested: data.len(),
                allocated: buf.len(),
            });
        }
        buf[..data.len()].copy_from_slice(data);
        *len = data.len();
        Ok(())
    }

    pub fn set_size(&mut self, size: usize) -> Result<()> {
        let (buf, len) = self.owned_mut()?;
        if size > buf.len() {
            return Err(Error::SegmentTooSmall {
                requested: size,
                allocated: buf.len(),
            });
        }
        *len = size;
        Ok(())
    }

    /// Changes the allocated size of the current segment, keeping used bytes.
    pub fn resize(&mut self, allocated: usize) -> Result<()> {
        let (buf, len) = self.owned_mut()?;
        if allocated < *len {
            return Err(Error::ResizeBelowUsed {
                requested: allocated,
                used: *len,
            });
        }
        if allocated > buf.len() {
            buf.try_reserve_exact(allocated - buf.len())
                .map_err(|_| Error::OutOfMemory)?;
            buf.resize(allocated, 0);
        } else {
            buf.truncate(allocated);
            buf.shrink_to_fit();
        }
        Ok(())
    }

    /// Grows the allocation if needed and sets the used size to `size`.
    pub fn ensure_size(&mut self, size: usize) -> Result<()> {
        let allocated = self.owned_mut()?.0.len();
        if size > allocated {
            self.resize(size)?;
        }
        self.set_size(size)
    }

    /// Mutable view of the current segment's used bytes.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        let (buf, len) = self.owned_mut()?;
        Ok(&mut buf[..*len])
    }
}
