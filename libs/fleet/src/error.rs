//! Error types for the fleet model.

use thiserror::Error;

use crate::MachineId;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty or whitespace.
    #[error("identifier cannot be empty")]
    Empty,

    /// The identifier contains a control character.
    #[error("identifier contains a control character: {0:?}")]
    ControlCharacter(String),
}

/// Errors returned by fleet state setters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// The machine is not part of this run.
    #[error("machine {0} is not tracked in this run")]
    UnknownMachine(MachineId),

    /// A reboot was already recorded for the machine.
    #[error("machine {0} is already marked rebooted")]
    AlreadyRebooted(MachineId),

    /// The machine was already released to users.
    #[error("machine {0} is already marked ready")]
    AlreadyReady(MachineId),

    /// Readiness requires an accepted reboot first.
    #[error("machine {0} cannot be marked ready before it is rebooted")]
    NotRebooted(MachineId),

    /// The same machine appeared twice in the discovered list.
    #[error("machine {0} appears more than once in the discovered set")]
    Duplicate(MachineId),
}

impl FleetError {
    /// Returns the machine the error refers to.
    pub fn machine(&self) -> &MachineId {
        match self {
            FleetError::UnknownMachine(id)
            | FleetError::AlreadyRebooted(id)
            | FleetError::AlreadyReady(id)
            | FleetError::NotRebooted(id)
            | FleetError::Duplicate(id) => id,
        }
    }
}
