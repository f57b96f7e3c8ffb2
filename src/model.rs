use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::SLOTS_PER_DAY;

/// Integer currency units. No fractional amounts exist anywhere in the system.
pub type Amount = u64;

/// One fixed one-hour window of a calendar day, numbered `1..=24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotNumber(u8);

impl SlotNumber {
    /// Returns `None` outside `1..=24`.
    pub fn new(n: u8) -> Option<Self> {
        (1..=SLOTS_PER_DAY).contains(&n).then_some(Self(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Every slot of a day, ascending.
    pub fn all() -> impl Iterator<Item = SlotNumber> {
        (1..=SLOTS_PER_DAY).map(SlotNumber)
    }

    fn bit(self) -> u32 {
        1 << (self.0 - 1)
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for SlotNumber {
    type Error = i64;

    fn try_from(n: i64) -> Result<Self, i64> {
        u8::try_from(n).ok().and_then(SlotNumber::new).ok_or(n)
    }
}

const FULL_DAY_MASK: u32 = (1 << SLOTS_PER_DAY) - 1;

/// Set of slot numbers of one day, one bit per slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSet(u32);

impl SlotSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn full_day() -> Self {
        Self(FULL_DAY_MASK)
    }

    /// Returns false if the slot was already present.
    pub fn insert(&mut self, slot: SlotNumber) -> bool {
        let fresh = !self.contains(slot);
        self.0 |= slot.bit();
        fresh
    }

    pub fn contains(&self, slot: SlotNumber) -> bool {
        self.0 & slot.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Slots of the day not in `self`.
    pub fn complement(&self) -> Self {
        Self(!self.0 & FULL_DAY_MASK)
    }

    pub fn intersection(&self, other: &SlotSet) -> Self {
        Self(self.0 & other.0)
    }

    pub fn union(&self, other: &SlotSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Ascending iteration.
    pub fn iter(&self) -> impl Iterator<Item = SlotNumber> + '_ {
        SlotNumber::all().filter(|s| self.contains(*s))
    }
}

impl FromIterator<SlotNumber> for SlotSet {
    fn from_iter<I: IntoIterator<Item = SlotNumber>>(iter: I) -> Self {
        let mut set = SlotSet::empty();
        for slot in iter {
            set.insert(slot);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Ulid,
    pub name: String,
    pub description: String,
    /// Price of one slot.
    pub base_hourly_charge: Amount,
    pub owner_id: Ulid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub machine_id: Ulid,
    pub farmer_id: Ulid,
}

/// Exclusive occupation of one slot of one machine on one date.
/// The machine is the one of the owning booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReservation {
    pub booking_id: Ulid,
    pub slot: SlotNumber,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub date_generated: NaiveDate,
    pub amount: Amount,
}

/// WAL record format. A committed transaction is a single record, so replay
/// sees either all of its rows or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MachineAdded {
        id: Ulid,
        name: String,
        description: String,
        base_hourly_charge: Amount,
        owner_id: Ulid,
    },
    TxCommitted {
        bookings: Vec<Booking>,
        reservations: Vec<SlotReservation>,
        invoices: Vec<Invoice>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A committed booking together with its reserved slots and invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSummary {
    pub booking_id: Ulid,
    pub machine_id: Ulid,
    pub farmer_id: Ulid,
    pub date: NaiveDate,
    pub slots: Vec<SlotNumber>,
    pub invoice_id: Ulid,
    pub total_cost: Amount,
}

/// What a successful booking hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking_id: Ulid,
    pub invoice_id: Ulid,
    pub machine_id: Ulid,
    pub date: NaiveDate,
    /// Slot numbers in the order they were requested.
    pub slots_booked: Vec<SlotNumber>,
    pub total_cost: Amount,
}
