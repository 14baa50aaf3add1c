use std::fmt;

use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::money::Money;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    Declined(String),
    Unavailable(String),
    /// A capture was started and its outcome never recorded; only a capture retry may
    /// touch the reservation.
    CaptureInFlight,
}

impl fmt::Display for PaymentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentError::Declined(reason) => write!(f, "payment declined: {reason}"),
            PaymentError::Unavailable(reason) => write!(f, "payment provider unavailable: {reason}"),
            PaymentError::CaptureInFlight => write!(f, "a capture is in flight; retry the payment"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// Payment collaborator. Holds are reversible authorizations; capture is the
/// irreversible charge.
///
/// Every call is keyed by reservation id. The engine records its intent before a
/// release or capture and the outcome after; when a crash or a failed write loses
/// the outcome, the call is repeated for the same id and must be a no-op the second
/// time.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn authorize_hold(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError>;

    async fn release_hold(&self, reservation_id: Ulid) -> Result<(), PaymentError>;

    async fn capture(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError>;
}

/// Accepts everything and only logs. Used when the server runs without a payment
/// provider in front of it; charge execution happens downstream.
#[derive(Debug, Default)]
pub struct LoggingGateway;

#[async_trait]
impl PaymentGateway for LoggingGateway {
    async fn authorize_hold(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError> {
        info!(%reservation_id, %amount, "hold authorized");
        Ok(())
    }

    async fn release_hold(&self, reservation_id: Ulid) -> Result<(), PaymentError> {
        info!(%reservation_id, "hold released");
        Ok(())
    }

    async fn capture(&self, reservation_id: Ulid, amount: Money) -> Result<(), PaymentError> {
        info!(%reservation_id, %amount, "payment captured");
        Ok(())
    }
}
