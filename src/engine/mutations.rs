use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Register a machine. Machines are immutable once added.
    pub async fn add_machine(&self, machine: Machine) -> Result<(), EngineError> {
        if machine.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("machine name too long"));
        }
        if machine.description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("machine description too long"));
        }

        let _registry = self.registry_lock.lock().await;
        if self.machines.len() >= MAX_MACHINES {
            return Err(EngineError::LimitExceeded("too many machines"));
        }
        if self.machines.contains_key(&machine.id) {
            return Err(EngineError::AlreadyExists(machine.id));
        }

        let Machine {
            id,
            name,
            description,
            base_hourly_charge,
            owner_id,
        } = machine;
        let event = Event::MachineAdded {
            id,
            name,
            description,
            base_hourly_charge,
            owner_id,
        };
        self.wal_append(&event).await?;
        self.apply_machine(&event);
        tracing::info!("machine {id} registered at {base_hourly_charge} per slot");
        Ok(())
    }
}
