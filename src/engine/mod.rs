mod calendar;
mod error;
mod mutations;
mod queries;
mod tx;

pub use calendar::{DayCalendar, DayKey};
pub use error::EngineError;
pub use tx::EngineTx;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DayCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Appended {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
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
                            // Answer after the batch so the count includes it
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    tracing::error!("WAL flush to {} failed: {e}", wal.path().display());
                }
                respond_batch(batch, &result);

                if let Some(cmd) = deferred {
                    handle_non_append(&wal, cmd);
                }
            }
            other => handle_non_append(&wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller in the batch is told it failed, so none of it may stay in the log
        if let Err(e) = wal.discard_pending() {
            tracing::error!(
                "WAL rollback on {} failed, refusing further appends: {e}",
                wal.path().display()
            );
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Appended { response } => {
            let _ = response.send(wal.appended());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// In-memory booking store made durable by the WAL.
///
/// Reservations live in one [`DayCalendar`] per (machine, date), each behind its
/// own lock, so bookings for different machines or dates never contend.
pub struct Engine {
    pub(super) machines: DashMap<Ulid, Machine>,
    pub(super) days: DashMap<DayKey, SharedDay>,
    pub(super) bookings: DashMap<Ulid, BookingSummary>,
    /// Farmer → booking ids in commit order.
    pub(super) by_farmer: DashMap<Ulid, Vec<Ulid>>,
    pub(super) invoices: DashMap<Ulid, Invoice>,
    /// Serializes machine registration so duplicate ids can't race past the check.
    pub(super) registry_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Write locks over every day a commit touches, taken in sorted key order.
pub(super) struct DayGuards {
    index: HashMap<DayKey, usize>,
    guards: Vec<OwnedRwLockWriteGuard<DayCalendar>>,
}

impl DayGuards {
    pub(super) fn get(&self, key: &DayKey) -> Option<&DayCalendar> {
        self.index.get(key).map(|&i| &*self.guards[i])
    }

    pub(super) fn get_mut(&mut self, key: &DayKey) -> Option<&mut DayCalendar> {
        let i = *self.index.get(key)?;
        Some(&mut *self.guards[i])
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            machines: DashMap::new(),
            days: DashMap::new(),
            bookings: DashMap::new(),
            by_farmer: DashMap::new(),
            invoices: DashMap::new(),
            registry_lock: Mutex::new(()),
            wal_tx,
        };

        // We're the sole owner of every day lock during replay, so try_write
        // always succeeds. Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::MachineAdded { .. } => engine.apply_machine(event),
                Event::TxCommitted {
                    bookings,
                    reservations,
                    invoices,
                } => {
                    let keys = day_keys(bookings, reservations);
                    let mut guards = engine.try_lock_days(&keys)?;
                    engine
                        .apply_commit(bookings, reservations, invoices, &mut guards)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                }
            }
        }

        info!(
            "replayed {} WAL events: {} machines, {} bookings",
            events.len(),
            engine.machines.len(),
            engine.booking_count()
        );
        Ok(engine)
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

    /// Number of events this engine has appended to the WAL since it was opened.
    pub async fn wal_appended(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Appended { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub(super) fn get_day(&self, key: &DayKey) -> Option<SharedDay> {
        self.days.get(key).map(|e| e.value().clone())
    }

    fn day_or_create(&self, key: DayKey) -> SharedDay {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayCalendar::new(key))))
            .value()
            .clone()
    }

    /// Acquire write locks in sorted order to prevent deadlocks.
    /// `keys` must be sorted and deduplicated.
    pub(super) async fn lock_days(&self, keys: &[DayKey]) -> DayGuards {
        let mut guards = DayGuards {
            index: HashMap::with_capacity(keys.len()),
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let day = self.day_or_create(*key);
            guards.index.insert(*key, guards.guards.len());
            guards.guards.push(day.write_owned().await);
        }
        guards
    }

    fn try_lock_days(&self, keys: &[DayKey]) -> io::Result<DayGuards> {
        let mut guards = DayGuards {
            index: HashMap::with_capacity(keys.len()),
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let day = self.day_or_create(*key);
            let guard = day
                .try_write_owned()
                .map_err(|_| io::Error::other("replay: day calendar already locked"))?;
            guards.index.insert(*key, guards.guards.len());
            guards.guards.push(guard);
        }
        Ok(guards)
    }

    pub(super) fn apply_machine(&self, event: &Event) {
        if let Event::MachineAdded {
            id,
            name,
            description,
            base_hourly_charge,
            owner_id,
        } = event
        {
            self.machines.insert(
                *id,
                Machine {
                    id: *id,
                    name: name.clone(),
                    description: description.clone(),
                    base_hourly_charge: *base_hourly_charge,
                    owner_id: *owner_id,
                },
            );
        }
    }

    /// Occupy the reserved slots and index the bookings and invoices.
    /// The caller holds the write lock of every touched day in `guards` and has
    /// already validated the commit, so reservations never collide here.
    pub(super) fn apply_commit(
        &self,
        bookings: &[Booking],
        reservations: &[SlotReservation],
        invoices: &[Invoice],
        guards: &mut DayGuards,
    ) -> Result<(), EngineError> {
        for booking in bookings {
            let mine: Vec<&SlotReservation> = reservations
                .iter()
                .filter(|r| r.booking_id == booking.id)
                .collect();
            let first = mine
                .first()
                .ok_or(EngineError::Integrity("booking without reservations"))?;
            let invoice = invoices
                .iter()
                .find(|i| i.booking_id == booking.id)
                .ok_or(EngineError::Integrity("booking without invoice"))?;

            let day = guards
                .get_mut(&(booking.machine_id, first.date))
                .ok_or(EngineError::Integrity("day calendar not locked"))?;
            for r in &mine {
                day.occupy(r.slot, booking.id)?;
            }

            self.bookings.insert(
                booking.id,
                BookingSummary {
                    booking_id: booking.id,
                    machine_id: booking.machine_id,
                    farmer_id: booking.farmer_id,
                    date: first.date,
                    slots: mine.iter().map(|r| r.slot).collect(),
                    invoice_id: invoice.id,
                    total_cost: invoice.amount,
                },
            );
            self.invoices.insert(invoice.id, *invoice);
            self.by_farmer
                .entry(booking.farmer_id)
                .or_default()
                .push(booking.id);
        }
        Ok(())
    }
}

/// Sorted, deduplicated day keys touched by a set of reservations.
pub(super) fn day_keys(bookings: &[Booking], reservations: &[SlotReservation]) -> Vec<DayKey> {
    let machine_of: HashMap<Ulid, Ulid> = bookings.iter().map(|b| (b.id, b.machine_id)).collect();
    let mut keys: Vec<DayKey> = reservations
        .iter()
        .filter_map(|r| machine_of.get(&r.booking_id).map(|m| (*m, r.date)))
        .collect();
    keys.sort();
    keys.dedup();
    keys
}
