//! The storage interface the booking core is written against.
//!
//! A [`SlotStore`] answers committed-state reads and opens transactions; a
//! [`StoreTx`] carries the writes of one booking. Implementations must enforce
//! uniqueness of (machine, slot, date) at write time: the pre-check in
//! [`StoreTx::is_slot_free`] is only a hint.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, EngineTx};
use crate::model::*;

#[async_trait]
pub trait SlotStore: Send + Sync {
    type Tx: StoreTx;

    async fn begin(&self) -> Result<Self::Tx, EngineError>;

    /// Slot numbers with a committed reservation for the machine and date.
    async fn booked_slots(&self, machine_id: Ulid, date: NaiveDate) -> Result<SlotSet, EngineError>;

    async fn list_bookings_by_farmer(&self, farmer_id: Ulid) -> Result<Vec<BookingSummary>, EngineError>;
}

#[async_trait]
pub trait StoreTx: Send {
    /// `Ok(true)` only when the slot is known to be free. A failed lookup is an
    /// error, never "free".
    async fn is_slot_free(
        &mut self,
        machine_id: Ulid,
        slot: SlotNumber,
        date: NaiveDate,
    ) -> Result<bool, EngineError>;

    async fn create_booking(&mut self, machine_id: Ulid, farmer_id: Ulid) -> Result<Ulid, EngineError>;

    /// Fails with `SlotConflict` when the slot is already reserved.
    async fn reserve_slot(
        &mut self,
        booking_id: Ulid,
        slot: SlotNumber,
        date: NaiveDate,
    ) -> Result<(), EngineError>;

    /// Fails with `MachineNotFound` for an unknown machine.
    async fn base_charge(&mut self, machine_id: Ulid) -> Result<Amount, EngineError>;

    async fn create_invoice(
        &mut self,
        booking_id: Ulid,
        date_generated: NaiveDate,
        amount: Amount,
    ) -> Result<Ulid, EngineError>;

    async fn commit(self) -> Result<(), EngineError>;

    async fn rollback(self);
}

#[async_trait]
impl SlotStore for Arc<Engine> {
    type Tx = EngineTx;

    async fn begin(&self) -> Result<EngineTx, EngineError> {
        Ok(EngineTx::new(self.clone()))
    }

    async fn booked_slots(&self, machine_id: Ulid, date: NaiveDate) -> Result<SlotSet, EngineError> {
        Ok(Engine::booked_slots(self, machine_id, date).await)
    }

    async fn list_bookings_by_farmer(&self, farmer_id: Ulid) -> Result<Vec<BookingSummary>, EngineError> {
        Ok(Engine::list_bookings_by_farmer(self, farmer_id))
    }
}

#[async_trait]
impl StoreTx for EngineTx {
    async fn is_slot_free(
        &mut self,
        machine_id: Ulid,
        slot: SlotNumber,
        date: NaiveDate,
    ) -> Result<bool, EngineError> {
        Ok(EngineTx::is_slot_free(self, machine_id, slot, date).await)
    }

    async fn create_booking(&mut self, machine_id: Ulid, farmer_id: Ulid) -> Result<Ulid, EngineError> {
        Ok(EngineTx::create_booking(self, machine_id, farmer_id))
    }

    async fn reserve_slot(
        &mut self,
        booking_id: Ulid,
        slot: SlotNumber,
        date: NaiveDate,
    ) -> Result<(), EngineError> {
        EngineTx::reserve_slot(self, booking_id, slot, date).await
    }

    async fn base_charge(&mut self, machine_id: Ulid) -> Result<Amount, EngineError> {
        EngineTx::base_charge(self, machine_id)
    }

    async fn create_invoice(
        &mut self,
        booking_id: Ulid,
        date_generated: NaiveDate,
        amount: Amount,
    ) -> Result<Ulid, EngineError> {
        EngineTx::create_invoice(self, booking_id, date_generated, amount)
    }

    async fn commit(self) -> Result<(), EngineError> {
        EngineTx::commit(self).await
    }

    async fn rollback(self) {
        EngineTx::rollback(self)
    }
}
