use ulid::Ulid;

use crate::lifecycle::TransitionError;
use crate::model::Window;
use crate::payment::PaymentError;
use crate::validation::ValidationError;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Validation(ValidationError),
    /// Lost the race for a window; names the reservation that holds it.
    Conflict {
        reservation: Ulid,
        window: Window,
    },
    InvalidTransition {
        id: Ulid,
        error: TransitionError,
    },
    /// Capture or hold failed. The window stays blocked; the renter may retry.
    Payment {
        id: Ulid,
        error: PaymentError,
    },
    HasBlockingReservations(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(e) => write!(f, "invalid input: {e}"),
            EngineError::Conflict { reservation, window } => write!(
                f,
                "dates {} to {} conflict with reservation {reservation}; choose new dates",
                window.start, window.end
            ),
            EngineError::InvalidTransition { id, error } => {
                write!(f, "reservation {id}: {error}")
            }
            EngineError::Payment { id, error } => {
                write!(f, "reservation {id}: {error}; dates are still held, retry payment")
            }
            EngineError::HasBlockingReservations(id) => {
                write!(f, "cannot delist vehicle {id}: it has active reservations")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}
