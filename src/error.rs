use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("allocation failed")]
    OutOfMemory,

    #[error("not found")]
    NotFound,

    #[error("timer delay must be greater than zero")]
    InvalidDelay,

    #[error("segment too small: requested {requested} bytes, allocated {allocated}")]
    SegmentTooSmall { requested: usize, allocated: usize },

    #[error("resize below used size: requested {requested} bytes, used {used}")]
    ResizeBelowUsed { requested: usize, used: usize },

    #[error("segment is not owned by the sequence")]
    NotOwned,

    #[error("{record} record too small: expected at least {expected} bytes, got {actual}")]
    RecordTooSmall {
        record: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    #[error("registry capacity of {limit} entries exceeded")]
    CapacityExceeded { limit: usize },

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid service state {0}")]
    InvalidState(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
