use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{day_keys, DayGuards, Engine, EngineError};

/// Rows written by a transaction that is not yet committed. Nothing here is
/// visible to anyone else.
#[derive(Debug, Default)]
pub(super) struct Staged {
    pub bookings: Vec<Booking>,
    pub reservations: Vec<SlotReservation>,
    pub invoices: Vec<Invoice>,
}

/// A read-committed transaction against the engine.
///
/// Writes are staged privately. `reserve_slot` rejects slots that are already
/// committed or staged, and `commit` re-checks every reservation under the
/// day write locks before anything becomes visible. Dropping the transaction
/// discards it.
pub struct EngineTx {
    engine: Arc<Engine>,
    staged: Staged,
}

impl EngineTx {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            staged: Staged::default(),
        }
    }

    fn staged_booking(&self, booking_id: Ulid) -> Result<&Booking, EngineError> {
        self.staged
            .bookings
            .iter()
            .find(|b| b.id == booking_id)
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Whether this transaction already reserved the slot for that machine and date.
    fn staged_holds(&self, machine_id: Ulid, slot: SlotNumber, date: NaiveDate) -> bool {
        self.staged.reservations.iter().any(|r| {
            r.slot == slot
                && r.date == date
                && self
                    .staged_booking(r.booking_id)
                    .is_ok_and(|b| b.machine_id == machine_id)
        })
    }

    pub async fn is_slot_free(&self, machine_id: Ulid, slot: SlotNumber, date: NaiveDate) -> bool {
        !self.staged_holds(machine_id, slot, date)
            && self.engine.is_slot_free(machine_id, slot, date).await
    }

    pub fn create_booking(&mut self, machine_id: Ulid, farmer_id: Ulid) -> Ulid {
        let id = Ulid::new();
        self.staged.bookings.push(Booking {
            id,
            machine_id,
            farmer_id,
        });
        id
    }

    pub async fn reserve_slot(
        &mut self,
        booking_id: Ulid,
        slot: SlotNumber,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        let machine_id = self.staged_booking(booking_id)?.machine_id;
        if self
            .staged
            .reservations
            .iter()
            .any(|r| r.booking_id == booking_id && r.date != date)
        {
            return Err(EngineError::InvalidRequest("a booking covers a single date"));
        }
        if !self.is_slot_free(machine_id, slot, date).await {
            return Err(EngineError::SlotConflict {
                machine_id,
                date,
                slot,
            });
        }
        self.staged.reservations.push(SlotReservation {
            booking_id,
            slot,
            date,
        });
        Ok(())
    }

    pub fn base_charge(&self, machine_id: Ulid) -> Result<Amount, EngineError> {
        self.engine
            .get_machine(&machine_id)
            .map(|m| m.base_hourly_charge)
            .ok_or(EngineError::MachineNotFound(machine_id))
    }

    pub fn create_invoice(
        &mut self,
        booking_id: Ulid,
        date_generated: NaiveDate,
        amount: Amount,
    ) -> Result<Ulid, EngineError> {
        self.staged_booking(booking_id)?;
        if self.staged.invoices.iter().any(|i| i.booking_id == booking_id) {
            return Err(EngineError::AlreadyExists(booking_id));
        }
        let id = Ulid::new();
        self.staged.invoices.push(Invoice {
            id,
            booking_id,
            date_generated,
            amount,
        });
        Ok(id)
    }

    /// Make every staged row visible at once, or none of them.
    ///
    /// The commit runs on its own task: once started it finishes even if the
    /// caller is cancelled, so the WAL and memory never disagree.
    pub async fn commit(self) -> Result<(), EngineError> {
        if self.staged.bookings.is_empty() {
            return Ok(());
        }
        let engine = self.engine;
        let staged = self.staged;
        tokio::spawn(async move { engine.commit_staged(staged).await })
            .await
            .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }

    pub fn rollback(self) {
        tracing::debug!(
            "rolled back {} booking(s), {} reservation(s), {} invoice(s)",
            self.staged.bookings.len(),
            self.staged.reservations.len(),
            self.staged.invoices.len()
        );
    }
}

impl Engine {
    pub(super) async fn commit_staged(&self, staged: Staged) -> Result<(), EngineError> {
        let Staged {
            bookings,
            reservations,
            invoices,
        } = staged;

        let keys = day_keys(&bookings, &reservations);
        let mut guards = self.lock_days(&keys).await;
        self.check_commit(&bookings, &reservations, &invoices, &guards)?;

        let event = Event::TxCommitted {
            bookings,
            reservations,
            invoices,
        };
        self.wal_append(&event).await?;
        if let Event::TxCommitted {
            bookings,
            reservations,
            invoices,
        } = &event
        {
            self.apply_commit(bookings, reservations, invoices, &mut guards)?;
        }
        Ok(())
    }

    /// Constraints a commit must satisfy, checked under the day write locks:
    /// every booking names a known machine, has reservations on exactly one
    /// date and exactly one invoice, and no reserved slot is already held.
    fn check_commit(
        &self,
        bookings: &[Booking],
        reservations: &[SlotReservation],
        invoices: &[Invoice],
        guards: &DayGuards,
    ) -> Result<(), EngineError> {
        let mut claimed: HashMap<(Ulid, NaiveDate), SlotSet> = HashMap::new();

        for booking in bookings {
            if !self.machines.contains_key(&booking.machine_id) {
                return Err(EngineError::MachineNotFound(booking.machine_id));
            }
            let mut dates = reservations
                .iter()
                .filter(|r| r.booking_id == booking.id)
                .map(|r| r.date);
            let Some(date) = dates.next() else {
                return Err(EngineError::Integrity("booking without reservations"));
            };
            if dates.any(|d| d != date) {
                return Err(EngineError::Integrity("booking spans more than one date"));
            }
            match invoices.iter().filter(|i| i.booking_id == booking.id).count() {
                0 => return Err(EngineError::Integrity("booking without invoice")),
                1 => {}
                _ => return Err(EngineError::Integrity("booking with more than one invoice")),
            }
        }
        if invoices
            .iter()
            .any(|i| !bookings.iter().any(|b| b.id == i.booking_id))
        {
            return Err(EngineError::Integrity("invoice for unknown booking"));
        }

        for r in reservations {
            let booking = bookings
                .iter()
                .find(|b| b.id == r.booking_id)
                .ok_or(EngineError::Integrity("reservation for unknown booking"))?;
            let key = (booking.machine_id, r.date);
            let day = guards
                .get(&key)
                .ok_or(EngineError::Integrity("day calendar not locked"))?;
            let conflict = EngineError::SlotConflict {
                machine_id: booking.machine_id,
                date: r.date,
                slot: r.slot,
            };
            if !day.is_free(r.slot) {
                return Err(conflict);
            }
            if !claimed.entry(key).or_default().insert(r.slot) {
                return Err(conflict);
            }
        }
        Ok(())
    }
}
