use crate::model::*;
use crate::validation::ValidationError;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Reject zero-length and inverted windows. Fields are public, so a window built
/// without `Window::new` gets checked here.
pub fn validate_window(window: &Window) -> Result<(), ValidationError> {
    if window.start >= window.end {
        return Err(ValidationError::EmptyWindow {
            start: window.start,
            end: window.end,
        });
    }
    Ok(())
}

/// Overlap Detector: does `candidate` intersect any of `existing`?
///
/// Half-open test, so a candidate starting the day another window ends is free.
/// An empty or inverted candidate is a validation error, never "no overlap".
pub fn has_overlap(candidate: &Window, existing: &[Window]) -> Result<bool, ValidationError> {
    validate_window(candidate)?;
    Ok(existing
        .iter()
        .any(|w| w.start < candidate.end && w.end > candidate.start))
}

/// Authoritative check under the vehicle's write lock: the first blocking
/// reservation intersecting `window` is a conflict.
pub(crate) fn check_no_conflict(
    vs: &VehicleState,
    window: &Window,
    now: Ms,
    payment_grace: Ms,
) -> Result<(), EngineError> {
    validate_window(window)?;
    for r in vs.overlapping(window) {
        if r.status.blocks(now, payment_grace) {
            return Err(EngineError::Conflict {
                reservation: r.id,
                window: r.window,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Status;
    use crate::limits::DEFAULT_PAYMENT_GRACE_MS as GRACE;
    use crate::model::fixtures::*;

    #[test]
    fn touching_endpoints_do_not_overlap() {
        let candidate = window("2024-05-10", "2024-05-12");
        let existing = [window("2024-05-12", "2024-05-15")];
        assert_eq!(has_overlap(&candidate, &existing), Ok(false));
    }

    #[test]
    fn one_shared_day_overlaps() {
        let candidate = window("2024-05-10", "2024-05-13");
        let existing = [window("2024-05-12", "2024-05-15")];
        assert_eq!(has_overlap(&candidate, &existing), Ok(true));
    }

    #[test]
    fn containment_overlaps_both_ways() {
        let outer = window("2024-05-01", "2024-05-31");
        let inner = window("2024-05-10", "2024-05-11");
        assert_eq!(has_overlap(&outer, &[inner]), Ok(true));
        assert_eq!(has_overlap(&inner, &[outer]), Ok(true));
    }

    #[test]
    fn empty_existing_never_overlaps() {
        assert_eq!(has_overlap(&window("2024-05-10", "2024-05-11"), &[]), Ok(false));
    }

    #[test]
    fn inverted_candidate_is_validation_error() {
        let inverted = Window {
            start: date("2024-05-12"),
            end: date("2024-05-10"),
        };
        assert!(matches!(
            has_overlap(&inverted, &[]),
            Err(ValidationError::EmptyWindow { .. })
        ));
        let empty = Window {
            start: date("2024-05-12"),
            end: date("2024-05-12"),
        };
        assert!(has_overlap(&empty, &[window("2024-05-01", "2024-05-30")]).is_err());
    }

    #[test]
    fn check_ignores_non_blocking_statuses() {
        let mut vs = VehicleState::new(vehicle(ConfirmationMode::Manual));
        let vid = vs.id();
        let w = window("2024-05-10", "2024-05-13");
        vs.insert_reservation(reservation(vid, w, Status::Rejected));
        vs.insert_reservation(reservation(vid, w, Status::Expired));
        vs.insert_reservation(reservation(vid, w, Status::Cancelled { by: Party::Owner }));
        assert!(check_no_conflict(&vs, &w, 0, GRACE).is_ok());
    }

    #[test]
    fn check_names_the_clashing_reservation() {
        let mut vs = VehicleState::new(vehicle(ConfirmationMode::Instant));
        let vid = vs.id();
        let existing = reservation(vid, window("2024-05-12", "2024-05-15"), Status::Confirmed);
        let existing_id = existing.id;
        vs.insert_reservation(existing);
        match check_no_conflict(&vs, &window("2024-05-10", "2024-05-13"), 0, GRACE) {
            Err(EngineError::Conflict { reservation, window: w }) => {
                assert_eq!(reservation, existing_id);
                assert_eq!(w, window("2024-05-12", "2024-05-15"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn check_skips_awaiting_owner_past_deadline() {
        let mut vs = VehicleState::new(vehicle(ConfirmationMode::Manual));
        let vid = vs.id();
        let w = window("2024-05-10", "2024-05-13");
        vs.insert_reservation(reservation(vid, w, Status::AwaitingOwner { deadline: 1_000 }));
        assert!(check_no_conflict(&vs, &w, 1_000, GRACE).is_err());
        assert!(check_no_conflict(&vs, &w, 1_001, GRACE).is_ok());
    }
}
