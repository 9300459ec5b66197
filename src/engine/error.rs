use ulid::Ulid;

use super::store::StoreError;

/// Stable error category, so callers can tell "fix the input", "pick
/// another time" and "retry later" apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    LimitExceeded(&'static str),
    /// Booking does not exist.
    NotFound(Ulid),
    RoomNotFound(Ulid),
    /// An active booking already occupies part of the interval.
    Conflict(Ulid),
    DuplicateRoomNo(String),
    /// The write reservation was not granted in time.
    Busy,
    /// The booking moved to another room while the update waited.
    ScopeChanged(Ulid),
    Store(String),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => ErrorKind::InvalidInput,
            EngineError::NotFound(_) | EngineError::RoomNotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) | EngineError::DuplicateRoomNo(_) => ErrorKind::Conflict,
            EngineError::Busy
            | EngineError::ScopeChanged(_)
            | EngineError::Store(_)
            | EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Transient failures: nothing was written, the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy | EngineError::ScopeChanged(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidInput(msg.into())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "booking time overlaps existing booking: {id}")
            }
            EngineError::DuplicateRoomNo(no) => write!(f, "room_no already exists: {no}"),
            EngineError::Busy => write!(f, "room is busy, retry later"),
            EngineError::ScopeChanged(id) => {
                write!(f, "booking {id} moved during update, retry later")
            }
            EngineError::Store(e) => write!(f, "store error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Busy => EngineError::Busy,
            StoreError::ScopeStale(id) => EngineError::ScopeChanged(id),
            StoreError::Journal(msg) => EngineError::WalError(msg),
            other => EngineError::Store(other.to_string()),
        }
    }
}
