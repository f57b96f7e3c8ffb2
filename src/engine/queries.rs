use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    pub fn get_machine(&self, id: &Ulid) -> Option<Machine> {
        self.machines.get(id).map(|e| e.value().clone())
    }

    /// All machines, ordered by id (registration order for generated ULIDs).
    pub fn list_machines(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.machines.iter().map(|e| e.value().clone()).collect();
        machines.sort_by_key(|m| m.id);
        machines
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<BookingSummary> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// A farmer's bookings in commit order. Unknown farmers have none.
    pub fn list_bookings_by_farmer(&self, farmer_id: Ulid) -> Vec<BookingSummary> {
        let ids = match self.by_farmer.get(&farmer_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get_booking(id)).collect()
    }

    pub fn get_invoice(&self, id: &Ulid) -> Option<Invoice> {
        self.invoices.get(id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }
}
