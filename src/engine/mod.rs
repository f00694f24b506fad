mod availability;
mod catalog;
mod conflict;
mod error;
mod mutations;
mod queries;
mod reorder;
mod store;

pub use availability::{availability, fits, merge_overlapping, DayAvailability, SlotGrid};
pub use error::EngineError;
pub use mutations::{parse_date, validate_email, NewReservation, ReservationPatch};
pub use catalog::{HoursInput, MoveRequest, NewBlock, NewCategory, NewEmployee, NewService, ReorderFamily};
pub use reorder::{is_dense, plan_move, plan_removal, OrderedItem};
pub use store::Catalog;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationDispatcher;
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        // Flush what we have before compacting or reporting counts.
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch is rejected, so none of it may reach the log.
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The booking store: reservations sharded by resource-day, plus the catalog.
///
/// Every mutation takes `write_gate` for reading before any other lock, then
/// appends to the WAL, then applies in memory. Compaction takes the gate for
/// writing so its snapshot includes everything already in the log.
pub struct Engine {
    pub(super) days: DashMap<ResourceKey, SharedDaySchedule>,
    /// Reservation id → the resource-day currently holding it.
    pub(super) reservation_index: DashMap<Ulid, ResourceKey>,
    pub(super) catalog: RwLock<Catalog>,
    pub(super) write_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notifier: Arc<NotificationDispatcher>,
}

/// Apply a reservation event to an already-locked schedule.
fn apply_to_day(day: &mut DaySchedule, event: &Event, index: &DashMap<Ulid, ResourceKey>) {
    match event {
        Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation, .. } => {
            day.remove(reservation.id);
            index.insert(reservation.id, day.key);
            day.insert(reservation.clone());
        }
        Event::ReservationDeleted { id, .. } => {
            day.remove(*id);
            index.remove(id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Arc<NotificationDispatcher>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut catalog = Catalog::default();
        let engine_days: DashMap<ResourceKey, SharedDaySchedule> = DashMap::new();
        let index = DashMap::new();

        // Replay into plain maps; locks are added once at the end.
        let mut days: HashMap<ResourceKey, DaySchedule> = HashMap::new();
        for event in &events {
            match event {
                Event::ReservationCreated { reservation } => {
                    let key = reservation.resource_key();
                    let day = days.entry(key).or_insert_with(|| DaySchedule::new(key));
                    apply_to_day(day, event, &index);
                }
                Event::ReservationUpdated {
                    previous_key,
                    reservation,
                } => {
                    if let Some(prev) = days.get_mut(previous_key) {
                        prev.remove(reservation.id);
                    }
                    let key = reservation.resource_key();
                    let day = days.entry(key).or_insert_with(|| DaySchedule::new(key));
                    apply_to_day(day, event, &index);
                }
                Event::ReservationDeleted { key, .. } => {
                    if let Some(day) = days.get_mut(key) {
                        apply_to_day(day, event, &index);
                    }
                }
                catalog_event => catalog.apply(catalog_event),
            }
        }
        for (key, day) in days {
            engine_days.insert(key, Arc::new(RwLock::new(day)));
        }
        info!(
            path = %wal_path.display(),
            events = events.len(),
            reservations = index.len(),
            "engine state restored"
        );

        Ok(Self {
            days: engine_days,
            reservation_index: index,
            catalog: RwLock::new(catalog),
            write_gate: RwLock::new(()),
            wal_tx,
            notifier,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append then apply to a locked schedule.
    pub(super) async fn persist_and_apply(&self, day: &mut DaySchedule, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.reservation_index);
        Ok(())
    }

    /// WAL-append then apply to the locked catalog.
    pub(super) async fn persist_catalog(&self, catalog: &mut Catalog, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        catalog.apply(&event);
        Ok(())
    }

    pub(super) fn day_schedule(&self, key: ResourceKey) -> SharedDaySchedule {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key))))
            .clone()
    }

    pub(super) fn existing_day(&self, key: &ResourceKey) -> Option<SharedDaySchedule> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Every resource-day on `date`, optionally narrowed to one employee
    /// (`Some(None)` selects unassigned reservations).
    pub(super) fn days_on(&self, date: chrono::NaiveDate, employee: Option<Option<Ulid>>) -> Vec<SharedDaySchedule> {
        let mut out: Vec<(ResourceKey, SharedDaySchedule)> = self
            .days
            .iter()
            .filter(|e| e.key().date == date && employee.is_none_or(|emp| e.key().employee_id == emp))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out.into_iter().map(|(_, d)| d).collect()
    }

    pub fn reservation_key(&self, id: &Ulid) -> Option<ResourceKey> {
        self.reservation_index.get(id).map(|e| *e.value())
    }

    /// Lookup reservation → resource-day, acquire its write lock, and return
    /// the record as it stands under that lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<(OwnedRwLockWriteGuard<DaySchedule>, Reservation), EngineError> {
        // A miss under the lock means the record moved or was deleted before
        // we got in. Either way the index already reflects it.
        loop {
            let Some(key) = self.reservation_key(id) else { break };
            let Some(day) = self.existing_day(&key) else { break };
            let guard = day.write_owned().await;
            if let Some(current) = guard.get(id).cloned() {
                return Ok((guard, current));
            }
            if self.reservation_key(id) == Some(key) {
                break;
            }
        }
        Err(EngineError::NotFound(*id))
    }
}
