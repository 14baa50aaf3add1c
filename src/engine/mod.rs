mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{blocked_windows, blocking_reservation_windows, free_windows, merge_overlapping, subtract_intervals};
pub use conflict::{has_overlap, validate_window};
pub(crate) use conflict::now_ms;
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::payment::PaymentGateway;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Authoritative per-tenant booking engine.
///
/// Each vehicle sits behind its own `RwLock`; the conflict check and the insert of
/// a new reservation happen under one write guard, so of two racing submissions
/// for the same window exactly one wins.
pub struct Engine {
    pub vehicles: DashMap<Ulid, SharedVehicleState>,
    pub locations: DashMap<Ulid, Location>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) payments: Arc<dyn PaymentGateway>,
    /// How long a failed capture keeps its window before abandonment.
    pub payment_grace: Ms,
    /// Reverse lookup: reservation id → vehicle id
    pub(super) reservation_to_vehicle: DashMap<Ulid, Ulid>,
    /// Held for write by listing, delisting and location changes, for read by
    /// compaction. Taken before any vehicle lock.
    pub(super) catalog: RwLock<()>,
    #[cfg(test)]
    pub(super) wal_fault: WalFault,
}

/// Fails WAL appends on demand.
#[cfg(test)]
#[derive(Debug, Default)]
pub(super) struct WalFault {
    seen: std::sync::atomic::AtomicU64,
    /// 1-based index of the first append to fail; 0 never fails.
    fail_from: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl WalFault {
    /// Let `ok` more appends through, then fail every one after them.
    pub(super) fn fail_after(&self, ok: u64) {
        use std::sync::atomic::Ordering::SeqCst;
        self.fail_from.store(self.seen.load(SeqCst) + ok + 1, SeqCst);
    }

    pub(super) fn clear(&self) {
        self.fail_from.store(0, std::sync::atomic::Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), EngineError> {
        use std::sync::atomic::Ordering::SeqCst;
        let n = self.seen.fetch_add(1, SeqCst) + 1;
        let from = self.fail_from.load(SeqCst);
        if from != 0 && n >= from {
            return Err(EngineError::WalError("injected write failure".into()));
        }
        Ok(())
    }
}

/// Apply an event directly to a VehicleState (no locking; caller holds the lock).
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, reservation_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::VehicleUpdated { vehicle } => {
            vs.vehicle = vehicle.clone();
        }
        Event::ReservationSubmitted { reservation } => {
            reservation_map.insert(reservation.id, reservation.vehicle_id);
            vs.insert_reservation(reservation.clone());
        }
        Event::ReservationTransitioned { id, status, hold, at, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.status = *status;
                r.hold = *hold;
                r.updated_at = *at;
            }
        }
        // Listing, delisting and locations are handled at the DashMap level
        Event::VehicleListed { .. }
        | Event::VehicleDelisted { .. }
        | Event::LocationAdded { .. }
        | Event::LocationRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        payments: Arc<dyn PaymentGateway>,
        payment_grace: Ms,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            vehicles: DashMap::new(),
            locations: DashMap::new(),
            wal_tx,
            notify,
            payments,
            payment_grace,
            reservation_to_vehicle: DashMap::new(),
            catalog: RwLock::new(()),
            #[cfg(test)]
            wal_fault: WalFault::default(),
        };

        // Rebuild into plain maps first; nothing else can observe the engine yet.
        let mut replayed: HashMap<Ulid, VehicleState> = HashMap::new();
        for event in &events {
            match event {
                Event::VehicleListed { vehicle } => {
                    replayed.insert(vehicle.id, VehicleState::new(vehicle.clone()));
                }
                Event::VehicleDelisted { id } => {
                    if let Some(vs) = replayed.remove(id) {
                        for r in &vs.reservations {
                            engine.reservation_to_vehicle.remove(&r.id);
                        }
                    }
                }
                Event::LocationAdded { location } => {
                    engine.locations.insert(location.id, location.clone());
                }
                Event::LocationRemoved { id } => {
                    engine.locations.remove(id);
                }
                other => {
                    if let Some(vehicle_id) = other.vehicle_id()
                        && let Some(vs) = replayed.get_mut(&vehicle_id) {
                            apply_to_vehicle(vs, other, &engine.reservation_to_vehicle);
                        }
                }
            }
        }
        for (id, vs) in replayed {
            engine.vehicles.insert(id, Arc::new(RwLock::new(vs)));
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        self.wal_fault.check()?;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub fn get_vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_vehicle.get(reservation_id).map(|e| *e.value())
    }

    pub fn get_location(&self, id: &Ulid) -> Option<Location> {
        self.locations.get(id).map(|e| e.value().clone())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        vehicle_id: Ulid,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(vs, event, &self.reservation_to_vehicle);
        self.notify.send(vehicle_id, event);
        Ok(())
    }

    /// Lookup reservation → vehicle, get vehicle, acquire write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let vehicle_id = self
            .get_vehicle_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        Ok(vs.write_owned().await)
    }
}
