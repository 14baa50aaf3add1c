use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::lifecycle::Status;
use crate::limits::*;
use crate::money::Money;
use crate::pricing::PriceBreakdown;
use crate::validation::ValidationError;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

/// UTC calendar day containing `ms`.
pub fn day_of(ms: Ms) -> Result<NaiveDate, ValidationError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(ValidationError::TimestampOutOfRange(ms));
    }
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .ok_or(ValidationError::TimestampOutOfRange(ms))
}

/// Half-open calendar-day interval `[start, end)`.
///
/// A return on day N and a pickup on day N never conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Window {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptyWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// Normalize pickup/return instants to calendar days. Time of day is dropped.
    pub fn from_timestamps(pickup_at: Ms, return_at: Ms) -> Result<Self, ValidationError> {
        Self::new(day_of(pickup_at)?, day_of(return_at)?)
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationMode {
    Instant,
    Manual,
}

impl ConfirmationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationMode::Instant => "instant",
            ConfirmationMode::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "instant" => Some(ConfirmationMode::Instant),
            "manual" => Some(ConfirmationMode::Manual),
            _ => None,
        }
    }
}

/// Read-only input to the engine; owned by the vehicle's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub name: Option<String>,
    pub rate_per_day: Money,
    /// Collected at handover; never part of the payable total.
    pub deposit: Money,
    pub min_rental_days: u32,
    pub confirmation: ConfirmationMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationKind {
    Airport,
    City,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Airport => "airport",
            LocationKind::City => "city",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "airport" => Some(LocationKind::Airport),
            "city" => Some(LocationKind::City),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Ulid,
    pub name: String,
    pub kind: LocationKind,
    pub delivery_fee: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenterContact {
    pub phone: String,
    pub age: u32,
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    Renter,
    Owner,
    System,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Renter => "renter",
            Party::Owner => "owner",
            Party::System => "system",
        }
    }

    /// Only renters and owners cancel explicitly; `System` is reserved for abandonment.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "renter" => Some(Party::Renter),
            "owner" => Some(Party::Owner),
            _ => None,
        }
    }
}

/// Fund authorization state. A hold is released or captured at most once.
///
/// `Releasing` and `Capturing` are written before the gateway is called and
/// replaced once its answer is recorded; a reservation left in either state after
/// a crash has its call repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldState {
    None,
    Authorized,
    Releasing,
    Released,
    Capturing,
    Captured,
}

impl HoldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldState::None => "none",
            HoldState::Authorized => "authorized",
            HoldState::Releasing => "releasing",
            HoldState::Released => "released",
            HoldState::Capturing => "capturing",
            HoldState::Captured => "captured",
        }
    }
}

/// Candidate assembled by the booking flow and handed to submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub pickup_at: Ms,
    pub return_at: Ms,
    pub pickup_location: Ulid,
    pub dropoff_location: Ulid,
    pub renter: RenterContact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub window: Window,
    pub pickup_at: Ms,
    pub return_at: Ms,
    pub pickup_location: Ulid,
    pub dropoff_location: Ulid,
    pub renter: RenterContact,
    pub confirmation: ConfirmationMode,
    pub status: Status,
    pub hold: HoldState,
    /// Priced at submission; later rate changes never touch it.
    pub price: PriceBreakdown,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn owner_decision_deadline(&self) -> Option<Ms> {
        match self.status {
            Status::AwaitingOwner { deadline } => Some(deadline),
            _ => None,
        }
    }
}

/// One vehicle and every reservation ever submitted against it.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// Sorted by `window.start`.
    pub reservations: Vec<Reservation>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.vehicle.id
    }

    /// Insert maintaining sort order by window start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.window.start, |r| r.window.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations whose window intersects `query`, regardless of status.
    /// Everything at index >= the partition point starts at or after `query.end`.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end > query.start)
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleListed {
        vehicle: Vehicle,
    },
    VehicleUpdated {
        vehicle: Vehicle,
    },
    VehicleDelisted {
        id: Ulid,
    },
    LocationAdded {
        location: Location,
    },
    LocationRemoved {
        id: Ulid,
    },
    ReservationSubmitted {
        reservation: Reservation,
    },
    ReservationTransitioned {
        id: Ulid,
        vehicle_id: Ulid,
        status: Status,
        hold: HoldState,
        at: Ms,
    },
}

impl Event {
    /// Vehicle the event belongs to, if any.
    pub fn vehicle_id(&self) -> Option<Ulid> {
        match self {
            Event::VehicleListed { vehicle } | Event::VehicleUpdated { vehicle } => Some(vehicle.id),
            Event::VehicleDelisted { id } => Some(*id),
            Event::ReservationSubmitted { reservation } => Some(reservation.vehicle_id),
            Event::ReservationTransitioned { vehicle_id, .. } => Some(*vehicle_id),
            Event::LocationAdded { .. } | Event::LocationRemoved { .. } => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    pub fn window(start: &str, end: &str) -> Window {
        Window::new(date(start), date(end)).unwrap()
    }

    /// Milliseconds at `hour`:00 UTC on the given date.
    pub fn at(day: &str, hour: u32) -> Ms {
        date(day)
            .and_hms_opt(hour, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    pub fn vehicle(confirmation: ConfirmationMode) -> Vehicle {
        Vehicle {
            id: Ulid::new(),
            name: Some("Dacia Logan".into()),
            rate_per_day: Money::from_major(500),
            deposit: Money::from_major(3000),
            min_rental_days: 1,
            confirmation,
        }
    }

    pub fn reservation(vehicle_id: Ulid, w: Window, status: Status) -> Reservation {
        Reservation {
            id: Ulid::new(),
            vehicle_id,
            window: w,
            pickup_at: 0,
            return_at: 0,
            pickup_location: Ulid::new(),
            dropoff_location: Ulid::new(),
            renter: RenterContact { phone: "0612345678".into(), age: 30 },
            confirmation: ConfirmationMode::Instant,
            status,
            hold: HoldState::None,
            price: PriceBreakdown::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}
