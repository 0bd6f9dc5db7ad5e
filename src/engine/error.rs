use ulid::Ulid;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    /// An active hold or confirmed booking already covers part of the range.
    Conflict(Ulid),
    /// The hold lapsed before it could be renewed or promoted.
    Expired(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The court still has active holds or confirmed bookings.
    CourtBusy(Ulid),
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict(id) => write!(f, "slot already taken by: {id}"),
            EngineError::Expired(id) => write!(f, "hold expired: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CourtBusy(id) => {
                write!(f, "cannot delete court {id}: it has active holds or bookings")
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
