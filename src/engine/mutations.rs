use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::lifecycle::{hold_effect, transition, Action, Decision, HoldEffect, Status};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::payment::PaymentError;
use crate::validation::{validate_contact, validate_location, validate_vehicle};

use super::conflict::check_no_conflict;
use super::{apply_to_vehicle, Engine, EngineError, WalCommand};

impl Engine {
    // ── Listings ─────────────────────────────────────────

    pub async fn list_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if self.vehicles.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        validate_vehicle(&vehicle)?;
        let id = vehicle.id;
        if self.vehicles.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleListed { vehicle: vehicle.clone() };
        self.wal_append(&event).await?;
        self.vehicles.insert(id, Arc::new(RwLock::new(VehicleState::new(vehicle))));
        self.notify.send(id, &event);
        info!(vehicle_id = %id, "vehicle listed");
        Ok(())
    }

    /// Replace a vehicle's terms. Stored reservations keep the price and mode they
    /// were submitted under.
    pub async fn update_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        validate_vehicle(&vehicle)?;
        let id = vehicle.id;
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = vs.write().await;
        let event = Event::VehicleUpdated { vehicle };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Refused while any reservation still blocks a window on the vehicle.
    pub async fn delist_vehicle(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = vs.write().await;
        if guard
            .reservations
            .iter()
            .any(|r| r.status.blocks(now, self.payment_grace))
        {
            return Err(EngineError::HasBlockingReservations(id));
        }

        let event = Event::VehicleDelisted { id };
        self.wal_append(&event).await?;
        for r in &guard.reservations {
            self.reservation_to_vehicle.remove(&r.id);
        }
        drop(guard);
        self.vehicles.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(vehicle_id = %id, "vehicle delisted");
        Ok(())
    }

    pub async fn add_location(&self, location: Location) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if self.locations.len() >= MAX_LOCATIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many locations"));
        }
        validate_location(&location)?;
        if self.locations.contains_key(&location.id) {
            return Err(EngineError::AlreadyExists(location.id));
        }
        let event = Event::LocationAdded { location: location.clone() };
        self.wal_append(&event).await?;
        self.locations.insert(location.id, location);
        Ok(())
    }

    /// Existing reservations were priced at submission and are unaffected.
    pub async fn remove_location(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.locations.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::LocationRemoved { id };
        self.wal_append(&event).await?;
        self.locations.remove(&id);
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────

    /// Race-safe creation: validate, price, check for conflicts and persist under the
    /// vehicle's write lock. The stored status is already routed by the vehicle's
    /// confirmation mode, so the reservation is blocking from the moment it exists.
    pub async fn submit_reservation(
        &self,
        request: ReservationRequest,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        validate_contact(&request.renter)?;
        let window = Window::from_timestamps(request.pickup_at, request.return_at)?;
        let id = request.id;

        let vs = self
            .get_vehicle(&request.vehicle_id)
            .ok_or(EngineError::NotFound(request.vehicle_id))?;
        let mut guard = vs.write().await;
        if self.reservation_to_vehicle.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let blocking = guard
            .reservations
            .iter()
            .filter(|r| r.status.blocks(now, self.payment_grace))
            .count();
        if blocking >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }

        let price = self.price_trip(
            &guard.vehicle,
            &window,
            request.pickup_location,
            request.dropoff_location,
        )?;

        if let Err(e) = check_no_conflict(&guard, &window, now, self.payment_grace) {
            if let EngineError::Conflict { reservation, .. } = &e {
                metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
                info!(%id, vehicle_id = %request.vehicle_id, clashing = %reservation, "submission lost race");
            }
            return Err(e);
        }

        let mode = guard.vehicle.confirmation;
        let status = transition(Status::Draft, Action::Submit, now, self.payment_grace)
            .and_then(|s| transition(s, Action::Route(mode), now, self.payment_grace))
            .map_err(|error| EngineError::InvalidTransition { id, error })?;

        let mut hold = HoldState::None;
        if hold_effect(status, hold) == HoldEffect::Authorize {
            self.payments
                .authorize_hold(id, price.total)
                .await
                .map_err(|error| EngineError::Payment { id, error })?;
            hold = HoldState::Authorized;
        }

        let reservation = Reservation {
            id,
            vehicle_id: request.vehicle_id,
            window,
            pickup_at: request.pickup_at,
            return_at: request.return_at,
            pickup_location: request.pickup_location,
            dropoff_location: request.dropoff_location,
            renter: request.renter,
            confirmation: mode,
            status,
            hold,
            price,
            created_at: now,
            updated_at: now,
        };

        let event = Event::ReservationSubmitted { reservation: reservation.clone() };
        if let Err(e) = self.persist_and_apply(request.vehicle_id, &mut guard, &event).await {
            if hold == HoldState::Authorized
                && let Err(release_err) = self.payments.release_hold(id).await {
                    warn!(%id, "hold release after failed submission: {release_err}");
                }
            return Err(e);
        }

        metrics::counter!(observability::RESERVATIONS_SUBMITTED_TOTAL, "mode" => mode.as_str())
            .increment(1);
        info!(%id, vehicle_id = %request.vehicle_id, status = status.label(), "reservation submitted");
        Ok(reservation)
    }

    /// Owner accepts or rejects a manual-mode request. A reservation whose deadline
    /// has already passed is expired first, so the decision is refused.
    pub async fn owner_decide(
        &self,
        id: Ulid,
        decision: Decision,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        self.settle_due(&mut guard, id, now).await?;
        self.apply_action(&mut guard, id, decision.action(), now).await
    }

    /// Capture the reservation's total. On failure the reservation is marked
    /// payment-failed, keeps its window, and the error is returned so the renter
    /// can retry.
    ///
    /// The capture is recorded as in flight before the gateway is called. A capture
    /// whose outcome was lost is repeated by the next call.
    pub async fn capture_payment(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        self.settle_due(&mut guard, id, now).await?;

        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        let (current, amount, hold) = (r.status, r.price.total, r.hold);
        let authorized = match r.confirmation {
            ConfirmationMode::Manual => HoldState::Authorized,
            ConfirmationMode::Instant => HoldState::None,
        };
        let confirmed = transition(current, Action::PaymentCaptured, now, self.payment_grace)
            .map_err(|error| EngineError::InvalidTransition { id, error })?;

        if hold != HoldState::Capturing {
            let vehicle_id = guard.id();
            let intent = Event::ReservationTransitioned {
                id,
                vehicle_id,
                status: current,
                hold: HoldState::Capturing,
                at: now,
            };
            self.persist_and_apply(vehicle_id, &mut guard, &intent).await?;
        }

        match self.payments.capture(id, amount).await {
            Ok(()) => {
                self.record_outcome(&mut guard, id, confirmed, HoldState::Captured, now)
                    .await
            }
            Err(error) => {
                metrics::counter!(observability::PAYMENT_FAILURES_TOTAL).increment(1);
                warn!(%id, "capture failed: {error}");
                let failed = transition(current, Action::PaymentFailed, now, self.payment_grace)
                    .map_err(|error| EngineError::InvalidTransition { id, error })?;
                self.record_outcome(&mut guard, id, failed, authorized, now).await?;
                Err(EngineError::Payment { id, error })
            }
        }
    }

    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        by: Party,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        self.settle_due(&mut guard, id, now).await?;
        let was_confirmed = guard
            .reservation(&id)
            .is_some_and(|r| r.status == Status::Confirmed);
        let r = self.apply_action(&mut guard, id, Action::Cancel(by), now).await?;
        if was_confirmed {
            info!(%id, by = by.as_str(), total = %r.price.total, "confirmed reservation cancelled; refund left to policy");
        }
        Ok(r)
    }

    /// Apply the time-driven transition due at `now`, if any, and return the
    /// reservation. Evaluating it again is a no-op.
    pub async fn evaluate_expiry(&self, id: Ulid, now: Ms) -> Result<Reservation, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        self.settle_due(&mut guard, id, now).await?;
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Reservations with an expiry or abandonment due at `now`, or a hold release
    /// still outstanding: (reservation id, vehicle id).
    pub fn collect_due(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut due = Vec::new();
        for entry in self.vehicles.iter() {
            let vs = entry.value().clone();
            if let Ok(guard) = vs.try_read() {
                for r in &guard.reservations {
                    if self.has_work(r, now) {
                        due.push((r.id, guard.id()));
                    }
                }
            }
        }
        due
    }

    /// Settle every due reservation. Returns how many changed status or finished
    /// releasing their hold.
    pub async fn sweep_due(&self, now: Ms) -> usize {
        let mut settled = 0;
        for (id, vehicle_id) in self.collect_due(now) {
            let Some(vs) = self.get_vehicle(&vehicle_id) else { continue };
            let mut guard = vs.write().await;
            match self.settle_due(&mut guard, id, now).await {
                Ok(true) => settled += 1,
                Ok(false) => tracing::debug!(%id, "already settled"),
                Err(e) => warn!(%id, "sweep failed, will retry: {e}"),
            }
        }
        settled
    }

    // ── Internals ────────────────────────────────────────

    /// An in-flight capture holds off expiry and abandonment until it is resolved.
    pub(super) fn has_work(&self, r: &Reservation, now: Ms) -> bool {
        match r.hold {
            HoldState::Releasing => true,
            HoldState::Capturing => false,
            _ => r.status.due_action(now, self.payment_grace).is_some(),
        }
    }

    /// Persist the due expiry or abandonment for `id`, or finish an outstanding hold
    /// release. Returns whether anything changed.
    pub(super) async fn settle_due(
        &self,
        vs: &mut VehicleState,
        id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let r = vs.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if !self.has_work(r, now) {
            return Ok(false);
        }
        if r.hold == HoldState::Releasing {
            let r = self.finish_release(vs, id, now).await?;
            return Ok(r.hold == HoldState::Released);
        }
        let Some(action) = r.status.due_action(now, self.payment_grace) else {
            return Ok(false);
        };
        let r = self.apply_action(vs, id, action, now).await?;
        if action == Action::Expire {
            metrics::counter!(observability::EXPIRIES_TOTAL).increment(1);
            info!(%id, vehicle_id = %r.vehicle_id, "owner decision deadline passed; reservation expired");
        } else {
            info!(%id, vehicle_id = %r.vehicle_id, "failed payment abandoned");
        }
        Ok(true)
    }

    /// Run `action` through the lifecycle, persist, perform the fund side effect.
    ///
    /// A release is persisted as pending with the transition, then sent to the
    /// gateway. A failed release leaves the transition in place and the hold pending
    /// for the sweep.
    pub(super) async fn apply_action(
        &self,
        vs: &mut VehicleState,
        id: Ulid,
        action: Action,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let r = vs.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if r.hold == HoldState::Capturing {
            return Err(EngineError::Payment { id, error: PaymentError::CaptureInFlight });
        }
        let next = transition(r.status, action, now, self.payment_grace)
            .map_err(|error| EngineError::InvalidTransition { id, error })?;
        let effect = hold_effect(next, r.hold);
        let (hold, amount) = (effect.apply(r.hold), r.price.total);

        match effect {
            HoldEffect::Release => {
                self.commit_transition(vs, id, next, hold, now).await?;
                self.finish_release(vs, id, now).await
            }
            HoldEffect::Authorize => {
                self.payments
                    .authorize_hold(id, amount)
                    .await
                    .map_err(|error| EngineError::Payment { id, error })?;
                let committed = self.commit_transition(vs, id, next, hold, now).await;
                if committed.is_err()
                    && let Err(release_err) = self.payments.release_hold(id).await
                {
                    warn!(%id, "hold release after failed transition: {release_err}");
                }
                committed
            }
            HoldEffect::Nothing => self.commit_transition(vs, id, next, hold, now).await,
        }
    }

    /// Send the pending release for `id` to the gateway. On failure the hold stays
    /// `Releasing` and the reservation is returned unchanged.
    async fn finish_release(
        &self,
        vs: &mut VehicleState,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let status = vs.reservation(&id).ok_or(EngineError::NotFound(id))?.status;
        match self.payments.release_hold(id).await {
            Ok(()) => {
                metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
                self.record_outcome(vs, id, status, HoldState::Released, now).await
            }
            Err(error) => {
                warn!(%id, "hold release failed, sweep will retry: {error}");
                vs.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
            }
        }
    }

    /// Record what the gateway already did. The call cannot be taken back, so a
    /// failed WAL write still updates memory; replay then finds the pending intent
    /// and repeats the call.
    async fn record_outcome(
        &self,
        vs: &mut VehicleState,
        id: Ulid,
        status: Status,
        hold: HoldState,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        match self.commit_transition(vs, id, status, hold, now).await {
            Err(EngineError::WalError(e)) => {
                warn!(%id, hold = hold.as_str(), "gateway outcome not persisted: {e}");
                let vehicle_id = vs.id();
                let event = Event::ReservationTransitioned { id, vehicle_id, status, hold, at: now };
                apply_to_vehicle(vs, &event, &self.reservation_to_vehicle);
                self.notify.send(vehicle_id, &event);
                vs.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
            }
            other => other,
        }
    }

    async fn commit_transition(
        &self,
        vs: &mut VehicleState,
        id: Ulid,
        status: Status,
        hold: HoldState,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let vehicle_id = vs.id();
        let event = Event::ReservationTransitioned { id, vehicle_id, status, hold, at: now };
        self.persist_and_apply(vehicle_id, vs, &event).await?;
        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => status.label()).increment(1);
        info!(%id, %vehicle_id, status = status.label(), terminal = status.is_terminal(), hold = hold.as_str(), "reservation transitioned");
        vs.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Catalog changes wait for the swap; their WAL lines would otherwise be dropped
        // with the old file.
        let _catalog = self.catalog.read().await;
        let mut events: Vec<Event> = self
            .locations
            .iter()
            .map(|e| Event::LocationAdded { location: e.value().clone() })
            .collect();

        // Read guards stay held until the swap so no transition lands in the old file only.
        let states: Vec<_> = self.vehicles.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(states.len());
        for vs in states {
            let guard = vs.read_owned().await;
            events.push(Event::VehicleListed { vehicle: guard.vehicle.clone() });
            for r in &guard.reservations {
                events.push(Event::ReservationSubmitted { reservation: r.clone() });
            }
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

