//! Renter-facing booking steps: trip, traveler, review.
//!
//! Every operation takes the current flow by reference and returns the next
//! one, so a candidate reservation can always be rebuilt from its inputs. The
//! checks here are advisory; `Engine::submit_reservation` repeats them
//! authoritatively under the vehicle lock.

use std::fmt;

use ulid::Ulid;

use crate::engine::has_overlap;
use crate::model::*;
use crate::pricing::{delivery_fee, price, PriceBreakdown};
use crate::validation::{validate_contact, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Trip,
    Traveler,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    Validation(ValidationError),
    /// The chosen dates intersect a blocked window.
    DatesUnavailable(Window),
    /// The step's own fields are not filled in yet.
    Incomplete(Step),
    /// `candidate` was asked for before reaching review.
    NotAtReview(Step),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::Validation(e) => write!(f, "{e}"),
            FlowError::DatesUnavailable(w) => {
                write!(f, "{} to {} is not available; choose other dates", w.start, w.end)
            }
            FlowError::Incomplete(step) => write!(f, "{step:?} step is incomplete"),
            FlowError::NotAtReview(step) => write!(f, "cannot submit from the {step:?} step"),
        }
    }
}

impl std::error::Error for FlowError {}

impl From<ValidationError> for FlowError {
    fn from(e: ValidationError) -> Self {
        FlowError::Validation(e)
    }
}

/// Dates and places picked in the first step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trip {
    pub pickup_at: Ms,
    pub return_at: Ms,
    pub pickup_location: Ulid,
    pub dropoff_location: Ulid,
    pub window: Window,
    pub quote: PriceBreakdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingFlow {
    pub vehicle: Vehicle,
    pub step: Step,
    pub trip: Option<Trip>,
    pub renter: Option<RenterContact>,
    pub terms_accepted: bool,
}

impl BookingFlow {
    pub fn start(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            step: Step::Trip,
            trip: None,
            renter: None,
            terms_accepted: false,
        }
    }

    /// Choose dates and locations against the current blocked set.
    /// A new trip withdraws any earlier terms acceptance since the price may differ.
    pub fn select_trip(
        &self,
        pickup_at: Ms,
        return_at: Ms,
        pickup: &Location,
        dropoff: &Location,
        blocked: &[Window],
    ) -> Result<Self, FlowError> {
        let window = Window::from_timestamps(pickup_at, return_at)?;
        if has_overlap(&window, blocked)? {
            return Err(FlowError::DatesUnavailable(window));
        }
        let quote = price(&window, &self.vehicle, delivery_fee(pickup, dropoff)?)?;
        Ok(Self {
            trip: Some(Trip {
                pickup_at,
                return_at,
                pickup_location: pickup.id,
                dropoff_location: dropoff.id,
                window,
                quote,
            }),
            terms_accepted: false,
            ..self.clone()
        })
    }

    /// Re-check the chosen trip after the blocked set changed underneath it.
    pub fn revalidate(&self, blocked: &[Window]) -> Result<(), FlowError> {
        let trip = self.trip.as_ref().ok_or(FlowError::Incomplete(Step::Trip))?;
        if has_overlap(&trip.window, blocked)? {
            return Err(FlowError::DatesUnavailable(trip.window));
        }
        Ok(())
    }

    pub fn set_traveler(&self, renter: RenterContact) -> Result<Self, FlowError> {
        validate_contact(&renter)?;
        Ok(Self {
            renter: Some(renter),
            ..self.clone()
        })
    }

    pub fn accept_terms(&self, accepted: bool) -> Self {
        Self {
            terms_accepted: accepted,
            ..self.clone()
        }
    }

    /// Move forward once the current step's fields are valid.
    pub fn advance(&self) -> Result<Self, FlowError> {
        let next = match self.step {
            Step::Trip if self.trip.is_some() => Step::Traveler,
            Step::Traveler if self.renter.is_some() => Step::Review,
            Step::Review => Step::Review,
            step => return Err(FlowError::Incomplete(step)),
        };
        Ok(Self {
            step: next,
            ..self.clone()
        })
    }

    /// Going back keeps everything entered so far.
    pub fn back(&self) -> Self {
        let prev = match self.step {
            Step::Trip | Step::Traveler => Step::Trip,
            Step::Review => Step::Traveler,
        };
        Self {
            step: prev,
            ..self.clone()
        }
    }

    /// The request handed to submission. Only reachable from review with terms accepted.
    pub fn candidate(&self, id: Ulid) -> Result<ReservationRequest, FlowError> {
        if self.step != Step::Review {
            return Err(FlowError::NotAtReview(self.step));
        }
        if !self.terms_accepted {
            return Err(ValidationError::TermsNotAccepted.into());
        }
        let trip = self.trip.as_ref().ok_or(FlowError::Incomplete(Step::Trip))?;
        let renter = self.renter.clone().ok_or(FlowError::Incomplete(Step::Traveler))?;
        Ok(ReservationRequest {
            id,
            vehicle_id: self.vehicle.id,
            pickup_at: trip.pickup_at,
            return_at: trip.return_at,
            pickup_location: trip.pickup_location,
            dropoff_location: trip.dropoff_location,
            renter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::money::Money;

    fn loc(fee: i64, kind: LocationKind) -> Location {
        Location {
            id: Ulid::new(),
            name: "Menara".into(),
            kind,
            delivery_fee: Money::from_major(fee),
        }
    }

    fn renter() -> RenterContact {
        RenterContact { phone: "+212 612-345-678".into(), age: 25 }
    }

    fn at_review() -> BookingFlow {
        let city = loc(0, LocationKind::City);
        BookingFlow::start(vehicle(ConfirmationMode::Manual))
            .select_trip(at("2024-05-10", 10), at("2024-05-13", 10), &city, &city, &[])
            .unwrap()
            .advance()
            .unwrap()
            .set_traveler(renter())
            .unwrap()
            .advance()
            .unwrap()
    }

    #[test]
    fn happy_path_builds_candidate() {
        let flow = at_review().accept_terms(true);
        assert_eq!(flow.step, Step::Review);
        let trip = flow.trip.clone().unwrap();
        assert_eq!(trip.window, window("2024-05-10", "2024-05-13"));
        assert_eq!(trip.quote.total, Money::from_major(1500));

        let id = Ulid::new();
        let req = flow.candidate(id).unwrap();
        assert_eq!(req.id, id);
        assert_eq!(req.vehicle_id, flow.vehicle.id);
        assert_eq!(req.renter, renter());
    }

    #[test]
    fn trip_prices_both_delivery_fees() {
        let airport = loc(150, LocationKind::Airport);
        let city = loc(50, LocationKind::City);
        let flow = BookingFlow::start(vehicle(ConfirmationMode::Instant))
            .select_trip(at("2024-05-10", 10), at("2024-05-12", 10), &airport, &city, &[])
            .unwrap();
        let quote = flow.trip.unwrap().quote;
        assert_eq!(quote.delivery_fee, Money::from_major(200));
        assert_eq!(quote.total, Money::from_major(1200));
    }

    #[test]
    fn blocked_dates_refused_and_input_kept() {
        let city = loc(0, LocationKind::City);
        let flow = BookingFlow::start(vehicle(ConfirmationMode::Instant));
        let blocked = [window("2024-05-11", "2024-05-14")];
        let err = flow
            .select_trip(at("2024-05-10", 10), at("2024-05-12", 10), &city, &city, &blocked)
            .unwrap_err();
        assert_eq!(err, FlowError::DatesUnavailable(window("2024-05-10", "2024-05-12")));
        assert!(flow.trip.is_none());

        // Returning the day a blocked window starts is fine.
        let ok = flow
            .select_trip(at("2024-05-09", 10), at("2024-05-11", 10), &city, &city, &blocked)
            .unwrap();
        assert!(ok.trip.is_some());
    }

    #[test]
    fn inverted_dates_are_validation_errors() {
        let city = loc(0, LocationKind::City);
        let err = BookingFlow::start(vehicle(ConfirmationMode::Instant))
            .select_trip(at("2024-05-12", 10), at("2024-05-10", 10), &city, &city, &[])
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(ValidationError::EmptyWindow { .. })));
    }

    #[test]
    fn cannot_skip_steps() {
        let flow = BookingFlow::start(vehicle(ConfirmationMode::Instant));
        assert_eq!(flow.advance().unwrap_err(), FlowError::Incomplete(Step::Trip));
        assert_eq!(flow.candidate(Ulid::new()).unwrap_err(), FlowError::NotAtReview(Step::Trip));
    }

    #[test]
    fn underage_traveler_rejected() {
        let flow = BookingFlow::start(vehicle(ConfirmationMode::Instant));
        let err = flow
            .set_traveler(RenterContact { phone: "0612345678".into(), age: 17 })
            .unwrap_err();
        assert_eq!(err, FlowError::Validation(ValidationError::Underage { age: 17 }));
    }

    #[test]
    fn terms_required_to_submit() {
        let err = at_review().candidate(Ulid::new()).unwrap_err();
        assert_eq!(err, FlowError::Validation(ValidationError::TermsNotAccepted));
    }

    #[test]
    fn reselecting_trip_withdraws_terms() {
        let city = loc(0, LocationKind::City);
        let flow = at_review()
            .accept_terms(true)
            .select_trip(at("2024-06-01", 10), at("2024-06-03", 10), &city, &city, &[])
            .unwrap();
        assert!(!flow.terms_accepted);
        assert_eq!(flow.step, Step::Review);
    }

    #[test]
    fn back_keeps_entries() {
        let flow = at_review().back();
        assert_eq!(flow.step, Step::Traveler);
        assert!(flow.renter.is_some());
        assert!(flow.back().trip.is_some());
    }

    #[test]
    fn revalidate_catches_new_blocks() {
        let flow = at_review();
        assert!(flow.revalidate(&[]).is_ok());
        assert_eq!(
            flow.revalidate(&[window("2024-05-12", "2024-05-20")]),
            Err(FlowError::DatesUnavailable(window("2024-05-10", "2024-05-13")))
        );
    }
}
