use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::SlotNumber;

#[derive(Debug)]
pub enum EngineError {
    MachineNotFound(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The slot is already reserved for this machine and date.
    SlotConflict {
        machine_id: Ulid,
        date: NaiveDate,
        slot: SlotNumber,
    },
    InvalidRequest(&'static str),
    /// A commit-time constraint failed.
    Integrity(&'static str),
    LimitExceeded(&'static str),
    Storage(String),
    WalError(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::SlotConflict { .. })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MachineNotFound(id) => write!(f, "machine not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotConflict {
                machine_id,
                date,
                slot,
            } => write!(
                f,
                "slot {slot} on {date} is already booked for machine {machine_id}"
            ),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Integrity(msg) => write!(f, "integrity violation: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage failure: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
