mod availability;
mod pricing;

pub use availability::free_slots;
pub use pricing::charge;

use std::time::Instant;

use chrono::NaiveDate;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;
use crate::observability;
use crate::store::{SlotStore, StoreTx};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub machine_id: Ulid,
    pub farmer_id: Ulid,
    pub date: NaiveDate,
    pub slots: Vec<SlotNumber>,
}

/// Books machine slots and answers availability, on top of any [`SlotStore`].
pub struct BookingService<S> {
    store: S,
}

impl<S: SlotStore> BookingService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reserve every requested slot, price the booking and write its invoice,
    /// all in one transaction. On any error the transaction is rolled back and
    /// nothing of this call is left behind.
    pub async fn book(&self, request: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let start = Instant::now();
        let result = self.book_inner(&request).await;

        let outcome = match &result {
            Ok(receipt) => {
                info!(
                    "booked machine {} on {} slots {:?} for farmer {}: invoice {} total {}",
                    receipt.machine_id,
                    receipt.date,
                    request.slots.iter().map(|s| s.get()).collect::<Vec<_>>(),
                    request.farmer_id,
                    receipt.invoice_id,
                    receipt.total_cost
                );
                metrics::counter!(observability::SLOTS_RESERVED_TOTAL)
                    .increment(receipt.slots_booked.len() as u64);
                "booked"
            }
            Err(e) if e.is_conflict() => {
                warn!("booking rejected for farmer {}: {e}", request.farmer_id);
                "conflict"
            }
            Err(e @ EngineError::MachineNotFound(_)) => {
                warn!("booking rejected for farmer {}: {e}", request.farmer_id);
                "machine_not_found"
            }
            Err(e @ EngineError::InvalidRequest(_)) => {
                warn!("booking rejected for farmer {}: {e}", request.farmer_id);
                "invalid"
            }
            Err(e) => {
                error!("booking failed for farmer {}: {e}", request.farmer_id);
                "failed"
            }
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::BOOKING_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        result
    }

    async fn book_inner(&self, request: &BookingRequest) -> Result<BookingReceipt, EngineError> {
        validate_slots(&request.slots)?;

        let mut tx = self.store.begin().await?;
        match reserve_and_invoice(&mut tx, request).await {
            Ok(receipt) => {
                tx.commit().await?;
                Ok(receipt)
            }
            Err(e) => {
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Free slots of the machine on `date`, ascending.
    pub async fn available_slots(&self, machine_id: Ulid, date: NaiveDate) -> Result<Vec<SlotNumber>, EngineError> {
        let booked = self.store.booked_slots(machine_id, date).await?;
        Ok(free_slots(booked))
    }

    pub async fn booked_slots(&self, machine_id: Ulid, date: NaiveDate) -> Result<Vec<SlotNumber>, EngineError> {
        let booked = self.store.booked_slots(machine_id, date).await?;
        Ok(booked.iter().collect())
    }

    pub async fn all_bookings(&self, farmer_id: Ulid) -> Result<Vec<BookingSummary>, EngineError> {
        self.store.list_bookings_by_farmer(farmer_id).await
    }
}

fn validate_slots(slots: &[SlotNumber]) -> Result<(), EngineError> {
    if slots.is_empty() {
        return Err(EngineError::InvalidRequest("no slots requested"));
    }
    let mut seen = SlotSet::empty();
    for &slot in slots {
        if !seen.insert(slot) {
            return Err(EngineError::InvalidRequest("slot requested twice"));
        }
    }
    Ok(())
}

/// Steps of a booking inside an open transaction. The pre-check fails fast;
/// `reserve_slot` and the commit are what actually enforce uniqueness.
async fn reserve_and_invoice<T: StoreTx>(tx: &mut T, request: &BookingRequest) -> Result<BookingReceipt, EngineError> {
    let BookingRequest {
        machine_id,
        farmer_id,
        date,
        ref slots,
    } = *request;

    for &slot in slots {
        if !tx.is_slot_free(machine_id, slot, date).await? {
            return Err(EngineError::SlotConflict {
                machine_id,
                date,
                slot,
            });
        }
    }

    let booking_id = tx.create_booking(machine_id, farmer_id).await?;
    for &slot in slots {
        tx.reserve_slot(booking_id, slot, date).await?;
    }

    let base = tx.base_charge(machine_id).await?;
    let total_cost = charge(base, slots.len())?;
    let invoice_id = tx.create_invoice(booking_id, today(), total_cost).await?;

    Ok(BookingReceipt {
        booking_id,
        invoice_id,
        machine_id,
        date,
        slots_booked: slots.clone(),
        total_cost,
    })
}

/// Invoice dates are UTC calendar dates.
pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}
