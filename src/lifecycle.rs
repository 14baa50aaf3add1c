use std::fmt;

use serde::{Deserialize, Serialize};

use crate::limits::OWNER_DECISION_WINDOW_MS;
use crate::model::{ConfirmationMode, HoldState, Ms, Party};

/// Reservation status. `Confirmed`, `Rejected`, `Expired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Renter is still editing; nothing binding.
    Draft,
    /// Validated and persisted; blocking from this point on.
    Submitted,
    /// Manual mode: funds held, owner must decide by `deadline`.
    AwaitingOwner { deadline: Ms },
    /// Waiting for capture. `failed_at` is the first failed capture attempt, if any.
    PendingPayment { failed_at: Option<Ms> },
    Confirmed,
    Rejected,
    Expired,
    Cancelled { by: Party },
}

impl Status {
    pub fn label(&self) -> &'static str {
        match self {
            Status::Draft => "draft",
            Status::Submitted => "submitted",
            Status::AwaitingOwner { .. } => "awaiting-owner",
            Status::PendingPayment { failed_at: None } => "pending-payment",
            Status::PendingPayment { failed_at: Some(_) } => "payment-failed",
            Status::Confirmed => "confirmed",
            Status::Rejected => "rejected",
            Status::Expired => "expired",
            Status::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Confirmed | Status::Rejected | Status::Expired | Status::Cancelled { .. }
        )
    }

    /// Whether this status claims its window at `now`.
    ///
    /// An awaiting-owner reservation past its deadline, or a failed payment past its grace
    /// period, no longer blocks even if the sweep has not persisted the transition yet.
    pub fn blocks(&self, now: Ms, payment_grace: Ms) -> bool {
        match self {
            Status::Submitted | Status::Confirmed => true,
            Status::AwaitingOwner { deadline } => now <= *deadline,
            Status::PendingPayment { failed_at: None } => true,
            Status::PendingPayment { failed_at: Some(t) } => now <= t.saturating_add(payment_grace),
            Status::Draft | Status::Rejected | Status::Expired | Status::Cancelled { .. } => false,
        }
    }

    /// Time-driven action that is due at `now`, if any.
    pub fn due_action(&self, now: Ms, payment_grace: Ms) -> Option<Action> {
        match self {
            Status::AwaitingOwner { deadline } if now > *deadline => Some(Action::Expire),
            Status::PendingPayment { failed_at: Some(t) } if now > t.saturating_add(payment_grace) => {
                Some(Action::Abandon)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Submit,
    Route(ConfirmationMode),
    Accept,
    Reject,
    Expire,
    PaymentCaptured,
    PaymentFailed,
    Cancel(Party),
    Abandon,
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Route(_) => "route",
            Action::Accept => "accept",
            Action::Reject => "reject",
            Action::Expire => "expire",
            Action::PaymentCaptured => "capture",
            Action::PaymentFailed => "fail payment",
            Action::Cancel(_) => "cancel",
            Action::Abandon => "abandon",
        }
    }
}

/// Owner's answer to a manual-mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "accept" | "accepted" => Some(Decision::Accept),
            "reject" | "rejected" => Some(Decision::Reject),
            _ => None,
        }
    }

    pub fn action(self) -> Action {
        match self {
            Decision::Accept => Action::Accept,
            Decision::Reject => Action::Reject,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionError {
    NotAllowed { from: Status, action: Action },
    DeadlinePassed { deadline: Ms },
    NotYetDue,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::NotAllowed { from, action } => {
                write!(f, "cannot {} a reservation that is {}", action.label(), from.label())
            }
            TransitionError::DeadlinePassed { deadline } => {
                write!(f, "owner decision deadline {deadline} has passed")
            }
            TransitionError::NotYetDue => write!(f, "transition is not due yet"),
        }
    }
}

impl std::error::Error for TransitionError {}

/// The only function that changes a reservation's status.
pub fn transition(
    status: Status,
    action: Action,
    now: Ms,
    payment_grace: Ms,
) -> Result<Status, TransitionError> {
    use Status::*;

    let not_allowed = TransitionError::NotAllowed { from: status, action };
    match (status, action) {
        (Draft, Action::Submit) => Ok(Submitted),

        (Submitted, Action::Route(ConfirmationMode::Instant)) => Ok(PendingPayment { failed_at: None }),
        (Submitted, Action::Route(ConfirmationMode::Manual)) => Ok(AwaitingOwner {
            deadline: now + OWNER_DECISION_WINDOW_MS,
        }),

        (AwaitingOwner { deadline }, Action::Accept) => {
            if now > deadline {
                return Err(TransitionError::DeadlinePassed { deadline });
            }
            Ok(PendingPayment { failed_at: None })
        }
        (AwaitingOwner { deadline }, Action::Reject) => {
            if now > deadline {
                return Err(TransitionError::DeadlinePassed { deadline });
            }
            Ok(Rejected)
        }
        (AwaitingOwner { deadline }, Action::Expire) => {
            if now > deadline { Ok(Expired) } else { Err(TransitionError::NotYetDue) }
        }
        (AwaitingOwner { deadline }, Action::Cancel(by)) => {
            if now > deadline {
                return Err(TransitionError::DeadlinePassed { deadline });
            }
            Ok(Cancelled { by })
        }

        (PendingPayment { .. }, Action::PaymentCaptured) => Ok(Confirmed),
        (PendingPayment { failed_at }, Action::PaymentFailed) => Ok(PendingPayment {
            failed_at: failed_at.or(Some(now)),
        }),
        (PendingPayment { failed_at: Some(t) }, Action::Abandon) => {
            if now > t.saturating_add(payment_grace) {
                Ok(Cancelled { by: Party::System })
            } else {
                Err(TransitionError::NotYetDue)
            }
        }
        (PendingPayment { .. }, Action::Cancel(by)) => Ok(Cancelled { by }),

        (Confirmed, Action::Cancel(by)) => Ok(Cancelled { by }),

        _ => Err(not_allowed),
    }
}

/// Fund side effect a transition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldEffect {
    Nothing,
    Authorize,
    Release,
}

impl HoldEffect {
    /// Hold recorded together with the transition. A release is recorded as pending;
    /// its outcome is written once the gateway answers.
    pub fn apply(self, hold: HoldState) -> HoldState {
        match self {
            HoldEffect::Nothing => hold,
            HoldEffect::Authorize => HoldState::Authorized,
            HoldEffect::Release => HoldState::Releasing,
        }
    }
}

/// Manual-mode routing authorizes a hold; any exit that frees the window releases an
/// authorized hold. A hold that was already released or captured is left alone.
pub fn hold_effect(next: Status, hold: HoldState) -> HoldEffect {
    match (next, hold) {
        (Status::AwaitingOwner { .. }, HoldState::None) => HoldEffect::Authorize,
        (Status::Rejected | Status::Expired | Status::Cancelled { .. }, HoldState::Authorized) => {
            HoldEffect::Release
        }
        _ => HoldEffect::Nothing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{DEFAULT_PAYMENT_GRACE_MS as GRACE, MS_PER_HOUR as H};

    const T0: Ms = 1_715_000_000_000;

    fn routed(mode: ConfirmationMode) -> Status {
        let s = transition(Status::Draft, Action::Submit, T0, GRACE).unwrap();
        transition(s, Action::Route(mode), T0, GRACE).unwrap()
    }

    #[test]
    fn instant_goes_straight_to_pending_payment() {
        assert_eq!(routed(ConfirmationMode::Instant), Status::PendingPayment { failed_at: None });
    }

    #[test]
    fn manual_waits_three_hours_for_owner() {
        assert_eq!(
            routed(ConfirmationMode::Manual),
            Status::AwaitingOwner { deadline: T0 + 3 * H }
        );
    }

    #[test]
    fn accept_then_capture_confirms() {
        let s = routed(ConfirmationMode::Manual);
        let s = transition(s, Action::Accept, T0 + H, GRACE).unwrap();
        assert_eq!(s, Status::PendingPayment { failed_at: None });
        let s = transition(s, Action::PaymentCaptured, T0 + H, GRACE).unwrap();
        assert_eq!(s, Status::Confirmed);
    }

    #[test]
    fn accept_at_exact_deadline_allowed() {
        let s = routed(ConfirmationMode::Manual);
        assert!(transition(s, Action::Accept, T0 + 3 * H, GRACE).is_ok());
    }

    #[test]
    fn decision_after_deadline_refused() {
        let s = routed(ConfirmationMode::Manual);
        let err = transition(s, Action::Accept, T0 + 3 * H + 1, GRACE).unwrap_err();
        assert_eq!(err, TransitionError::DeadlinePassed { deadline: T0 + 3 * H });
        assert!(transition(s, Action::Reject, T0 + 3 * H + 1, GRACE).is_err());
    }

    #[test]
    fn expire_only_after_deadline() {
        let s = routed(ConfirmationMode::Manual);
        assert_eq!(transition(s, Action::Expire, T0 + 3 * H, GRACE), Err(TransitionError::NotYetDue));
        assert_eq!(transition(s, Action::Expire, T0 + 3 * H + 1, GRACE), Ok(Status::Expired));
    }

    #[test]
    fn terminal_states_are_immutable() {
        let actions = [
            Action::Submit,
            Action::Accept,
            Action::Reject,
            Action::Expire,
            Action::PaymentCaptured,
            Action::PaymentFailed,
            Action::Abandon,
        ];
        for terminal in [Status::Rejected, Status::Expired, Status::Cancelled { by: Party::Owner }] {
            assert!(terminal.is_terminal());
            for action in actions {
                assert!(transition(terminal, action, T0, GRACE).is_err(), "{terminal:?} {action:?}");
            }
            assert!(transition(terminal, Action::Cancel(Party::Renter), T0, GRACE).is_err());
        }
        // Confirmed is terminal for the lifecycle; only explicit cancellation leaves it.
        assert!(transition(Status::Confirmed, Action::Expire, T0, GRACE).is_err());
        assert!(transition(Status::Confirmed, Action::PaymentCaptured, T0, GRACE).is_err());
    }

    #[test]
    fn payment_failure_keeps_first_failure_time() {
        let s = routed(ConfirmationMode::Instant);
        let s = transition(s, Action::PaymentFailed, T0 + 10, GRACE).unwrap();
        let s = transition(s, Action::PaymentFailed, T0 + 20, GRACE).unwrap();
        assert_eq!(s, Status::PendingPayment { failed_at: Some(T0 + 10) });
        assert_eq!(s.label(), "payment-failed");
        assert_eq!(transition(s, Action::PaymentCaptured, T0 + 30, GRACE), Ok(Status::Confirmed));
    }

    #[test]
    fn abandonment_after_grace() {
        let s = Status::PendingPayment { failed_at: Some(T0) };
        assert_eq!(transition(s, Action::Abandon, T0 + GRACE, GRACE), Err(TransitionError::NotYetDue));
        assert_eq!(
            transition(s, Action::Abandon, T0 + GRACE + 1, GRACE),
            Ok(Status::Cancelled { by: Party::System })
        );
        let healthy = Status::PendingPayment { failed_at: None };
        assert!(transition(healthy, Action::Abandon, T0 + 10 * GRACE, GRACE).is_err());
    }

    #[test]
    fn blocking_set() {
        let awaiting = Status::AwaitingOwner { deadline: T0 };
        assert!(awaiting.blocks(T0, GRACE));
        assert!(!awaiting.blocks(T0 + 1, GRACE));
        assert!(Status::PendingPayment { failed_at: None }.blocks(T0, GRACE));
        let failed = Status::PendingPayment { failed_at: Some(T0) };
        assert!(failed.blocks(T0 + GRACE, GRACE));
        assert!(!failed.blocks(T0 + GRACE + 1, GRACE));
        assert!(Status::Confirmed.blocks(T0, GRACE));
        assert!(!Status::Rejected.blocks(T0, GRACE));
        assert!(!Status::Expired.blocks(T0, GRACE));
        assert!(!Status::Cancelled { by: Party::Renter }.blocks(T0, GRACE));
    }

    #[test]
    fn due_actions() {
        let awaiting = Status::AwaitingOwner { deadline: T0 };
        assert_eq!(awaiting.due_action(T0, GRACE), None);
        assert_eq!(awaiting.due_action(T0 + 1, GRACE), Some(Action::Expire));
        let failed = Status::PendingPayment { failed_at: Some(T0) };
        assert_eq!(failed.due_action(T0 + GRACE + 1, GRACE), Some(Action::Abandon));
        assert_eq!(Status::Confirmed.due_action(i64::MAX, GRACE), None);
    }

    #[test]
    fn hold_effects() {
        let awaiting = Status::AwaitingOwner { deadline: T0 };
        assert_eq!(hold_effect(awaiting, HoldState::None), HoldEffect::Authorize);
        assert_eq!(hold_effect(Status::Expired, HoldState::Authorized), HoldEffect::Release);
        assert_eq!(hold_effect(Status::Expired, HoldState::Released), HoldEffect::Nothing);
        assert_eq!(hold_effect(Status::Rejected, HoldState::Releasing), HoldEffect::Nothing);
        assert_eq!(HoldEffect::Release.apply(HoldState::Authorized), HoldState::Releasing);
        assert_eq!(HoldEffect::Nothing.apply(HoldState::Capturing), HoldState::Capturing);
        assert_eq!(
            hold_effect(Status::Cancelled { by: Party::Owner }, HoldState::Captured),
            HoldEffect::Nothing
        );
        assert_eq!(
            hold_effect(Status::PendingPayment { failed_at: None }, HoldState::None),
            HoldEffect::Nothing
        );
    }
}
