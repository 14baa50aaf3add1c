use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::pricing::{delivery_fee, price, PriceBreakdown};
use crate::validation::ValidationError;

use super::availability::{blocking_reservation_windows, free_windows};
use super::{Engine, EngineError};

impl Engine {
    pub(super) fn price_trip(
        &self,
        vehicle: &Vehicle,
        window: &Window,
        pickup_location: Ulid,
        dropoff_location: Ulid,
    ) -> Result<PriceBreakdown, EngineError> {
        let pickup = self
            .get_location(&pickup_location)
            .ok_or(ValidationError::UnknownLocation(pickup_location))?;
        let dropoff = self
            .get_location(&dropoff_location)
            .ok_or(ValidationError::UnknownLocation(dropoff_location))?;
        Ok(price(window, vehicle, delivery_fee(&pickup, &dropoff)?)?)
    }

    /// Price a prospective trip without reserving anything.
    pub async fn quote(
        &self,
        vehicle_id: Ulid,
        pickup_at: Ms,
        return_at: Ms,
        pickup_location: Ulid,
        dropoff_location: Ulid,
    ) -> Result<PriceBreakdown, EngineError> {
        let window = Window::from_timestamps(pickup_at, return_at)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        self.price_trip(&guard.vehicle, &window, pickup_location, dropoff_location)
    }

    /// Read a reservation, persisting any expiry that has come due and finishing any
    /// outstanding hold release first.
    pub async fn get_reservation(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let vehicle_id = self
            .get_vehicle_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        {
            let guard = vs.read().await;
            let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
            if !self.has_work(r, now) {
                return Ok(r.clone());
            }
        }
        self.evaluate_expiry(id, now).await
    }

    /// All reservations of a vehicle in window order, with due expiries settled.
    pub async fn list_reservations(
        &self,
        vehicle_id: Ulid,
        now: Ms,
    ) -> Result<Vec<Reservation>, EngineError> {
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let due: Vec<Ulid> = {
            let guard = vs.read().await;
            let due: Vec<Ulid> = guard
                .reservations
                .iter()
                .filter(|r| self.has_work(r, now))
                .map(|r| r.id)
                .collect();
            if due.is_empty() {
                return Ok(guard.reservations.clone());
            }
            due
        };

        let mut guard = vs.write().await;
        for id in due {
            if let Err(e) = self.settle_due(&mut guard, id, now).await {
                tracing::warn!(%id, "lazy expiry failed: {e}");
            }
        }
        Ok(guard.reservations.clone())
    }

    /// The Availability Index read model: one window per blocking reservation.
    pub async fn list_blocking_windows(
        &self,
        vehicle_id: Ulid,
        now: Ms,
    ) -> Result<Vec<Window>, EngineError> {
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(blocking_reservation_windows(&guard, now, self.payment_grace))
    }

    /// Free sub-windows of `[start, end)`, optionally only those of at least `min_days`.
    pub async fn available_windows(
        &self,
        vehicle_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        min_days: Option<i64>,
        now: Ms,
    ) -> Result<Vec<Window>, EngineError> {
        let query = Window::new(start, end)?;
        if query.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(free_windows(&guard, &query, min_days, now, self.payment_grace))
    }

    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        let states: Vec<_> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut vehicles = Vec::with_capacity(states.len());
        for vs in states {
            vehicles.push(vs.read().await.vehicle.clone());
        }
        vehicles.sort_by_key(|v| v.id);
        vehicles
    }

    pub fn list_locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> = self.locations.iter().map(|e| e.value().clone()).collect();
        locations.sort_by_key(|l| l.id);
        locations
    }
}
