use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing input.
    Validation(String),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    NotFound(Ulid),
    /// Overlaps the active reservation with this id.
    Conflict(Ulid),
    BucketNotEmpty(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Client mistakes, as opposed to store failures.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot change reservation status from {from} to {to}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "time slot overlaps existing reservation: {id}")
            }
            EngineError::BucketNotEmpty(id) => {
                write!(f, "cannot delete {id}: it still contains items")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
