use crate::model::{SlotNumber, SlotSet};

/// Free slots of a day given the booked ones, ascending.
pub fn free_slots(booked: SlotSet) -> Vec<SlotNumber> {
    booked.complement().iter().collect()
}
