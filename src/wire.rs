//! Frame codec for sequences sent between processes.
//!
//! ```text
//! 0       4        6      8         16          20         24      28         30
//! | magic | version | kind | id      | seg count | body len | crc32 | name len | reserved |
//! ```
//!
//! The body holds the sequence name followed by one `(tag u64, len u32, bytes)`
//! record per leaf segment. Nested sequences are flattened; meta segments are
//! never written.

use crate::error::{Error, Result};
use crate::sequence::{Sequence, SequenceKind};

pub const FRAME_HEADER_SIZE: usize = 32;
pub const FRAME_MAGIC: u32 = u32::from_le_bytes(*b"SMBT");
pub const FRAME_VERSION: u16 = 1;
pub const RECORD_HEADER_SIZE: usize = 12;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const KIND_OFFSET: usize = 6;
const ID_OFFSET: usize = 8;
const COUNT_OFFSET: usize = 16;
const BODY_LEN_OFFSET: usize = 20;
const CRC_OFFSET: usize = 24;
const NAME_LEN_OFFSET: usize = 28;

pub(crate) fn le_u16(bytes: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[at..at + 2]);
    u16::from_le_bytes(raw)
}

pub(crate) fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub kind: u16,
    pub id: u64,
    pub segment_count: u32,
    pub body_len: u32,
    pub crc32: u32,
    pub name_len: u16,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&self.magic.to_le_bytes());
        buf[VERSION_OFFSET..VERSION_OFFSET + 2].copy_from_slice(&self.version.to_le_bytes());
        buf[KIND_OFFSET..KIND_OFFSET + 2].copy_from_slice(&self.kind.to_le_bytes());
        buf[ID_OFFSET..ID_OFFSET + 8].copy_from_slice(&self.id.to_le_bytes());
        buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&self.segment_count.to_le_bytes());
        buf[BODY_LEN_OFFSET..BODY_LEN_OFFSET + 4].copy_from_slice(&self.body_len.to_le_bytes());
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&self.crc32.to_le_bytes());
        buf[NAME_LEN_OFFSET..NAME_LEN_OFFSET + 2].copy_from_slice(&self.name_len.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::Corrupt("frame shorter than header"));
        }
        let header = Self {
            magic: le_u32(bytes, MAGIC_OFFSET),
            version: le_u16(bytes, VERSION_OFFSET),
            kind: le_u16(bytes, KIND_OFFSET),
            id: le_u64(bytes, ID_OFFSET),
            segment_count: le_u32(bytes, COUNT_OFFSET),
            body_len: le_u32(bytes, BODY_LEN_OFFSET),
            crc32: le_u32(bytes, CRC_OFFSET),
            name_len: le_u16(bytes, NAME_LEN_OFFSET),
        };
        if header.magic != FRAME_MAGIC {
            return Err(Error::Corrupt("bad frame magic"));
        }
        if header.version != FRAME_VERSION {
            return Err(Error::Corrupt("unsupported frame version"));
        }
        Ok(header)
    }

    pub fn crc32(body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        hasher.finalize()
    }

    pub fn validate_crc(&self, body: &[u8]) -> Result<()> {
        if Self::crc32(body) == self.crc32 {
            Ok(())
        } else {
            Err(Error::Corrupt("crc mismatch"))
        }
    }
}

pub fn encode(seq: &Sequence) -> Result<Vec<u8>> {
    let name = seq.name().as_bytes();
    let name_len = u16::try_from(name.len()).map_err(|_| Error::Corrupt("sequence name too long"))?;

    let mut body = Vec::with_capacity(name.len() + seq.len() * RECORD_HEADER_SIZE);
    body.extend_from_slice(name);
    let mut count: u32 = 0;
    for (tag, data) in seq.leaves() {
        let len = u32::try_from(data.len()).map_err(|_| Error::Corrupt("segment too large"))?;
        body.extend_from_slice(&tag.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(data);
        count += 1;
    }
    let body_len = u32::try_from(body.len()).map_err(|_| Error::Corrupt("frame too large"))?;

    let header = FrameHeader {
        magic: FRAME_MAGIC,
        version: FRAME_VERSION,
        kind: seq.kind().as_u16(),
        id: seq.id(),
        segment_count: count,
        body_len,
        crc32: FrameHeader::crc32(&body),
        name_len,
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode(frame: &[u8]) -> Result<Sequence> {
    let header = FrameHeader::from_bytes(frame)?;
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() != header.body_len as usize {
        return Err(Error::Corrupt("frame body length mismatch"));
    }
    header.validate_crc(body)?;

    let kind = SequenceKind::from_u16(header.kind).ok_or(Error::Corrupt("unknown sequence kind"))?;
    let name_len = header.name_len as usize;
    if name_len > body.len() {
        return Err(Error::Corrupt("truncated sequence name"));
    }
    let name = std::str::from_utf8(&body[..name_len])
        .map_err(|_| Error::Corrupt("sequence name is not utf-8"))?;

    let mut seq = Sequence::new(name, header.id, kind);
    let mut at = name_len;
    for _ in 0..header.segment_count {
        if body.len() - at < RECORD_HEADER_SIZE {
            return Err(Error::Corrupt("truncated segment header"));
        }
        let tag = le_u64(body, at);
        let len = le_u32(body, at + 8) as usize;
        at += RECORD_HEADER_SIZE;
        if body.len() - at < len {
            return Err(Error::Corrupt("truncated segment"));
        }
        seq.add_owned_copy(&body[at..at + len], tag)?;
        at += len;
    }
    if at != body.len() {
        return Err(Error::Corrupt("trailing bytes after segments"));
    }
    Ok(seq)
}
