use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::SLOTS_PER_DAY;
use crate::model::*;

use super::{Engine, EngineError};

/// Calendars are keyed by machine and date.
pub type DayKey = (Ulid, NaiveDate);

/// Committed reservations of one machine on one date: which booking holds each slot.
#[derive(Debug, Clone)]
pub struct DayCalendar {
    pub machine_id: Ulid,
    pub date: NaiveDate,
    holders: [Option<Ulid>; SLOTS_PER_DAY as usize],
}

impl DayCalendar {
    pub fn new((machine_id, date): DayKey) -> Self {
        Self {
            machine_id,
            date,
            holders: [None; SLOTS_PER_DAY as usize],
        }
    }

    /// Booking holding `slot`, if any.
    pub fn holder(&self, slot: SlotNumber) -> Option<Ulid> {
        self.holders[slot.get() as usize - 1]
    }

    pub fn is_free(&self, slot: SlotNumber) -> bool {
        self.holder(slot).is_none()
    }

    /// Mark `slot` as held by `booking_id`. The uniqueness check happens here:
    /// a slot that is already held is never overwritten.
    pub fn occupy(&mut self, slot: SlotNumber, booking_id: Ulid) -> Result<(), EngineError> {
        let cell = &mut self.holders[slot.get() as usize - 1];
        if cell.is_some() {
            return Err(EngineError::SlotConflict {
                machine_id: self.machine_id,
                date: self.date,
                slot,
            });
        }
        *cell = Some(booking_id);
        Ok(())
    }

    pub fn booked(&self) -> SlotSet {
        SlotNumber::all().filter(|s| !self.is_free(*s)).collect()
    }
}

impl Engine {
    /// Slot numbers with a committed reservation for `(machine_id, date)`.
    pub async fn booked_slots(&self, machine_id: Ulid, date: NaiveDate) -> SlotSet {
        match self.get_day(&(machine_id, date)) {
            Some(day) => day.read().await.booked(),
            None => SlotSet::empty(),
        }
    }

    /// True iff no committed reservation exists for the exact tuple.
    pub async fn is_slot_free(&self, machine_id: Ulid, slot: SlotNumber, date: NaiveDate) -> bool {
        match self.get_day(&(machine_id, date)) {
            Some(day) => day.read().await.is_free(slot),
            None => true,
        }
    }
}
