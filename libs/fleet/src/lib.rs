//! Fleet state model for drain-and-reboot runs.
//!
//! A run operates on a fixed set of session-hosting machines discovered by
//! tag. This crate owns the per-machine bookkeeping the phase controller
//! relies on:
//!
//! - **Identifiers**: broker-assigned machine and session names.
//! - **Records**: session occupancy, maintenance flag, reboot and
//!   readiness markers for one machine.
//! - **Fleet state**: the ordered registry of records, mutated only through
//!   explicit setters that enforce the one-way transitions.
//!
//! # Invariants
//!
//! - `ready ⇒ rebooted` for every record at every observation point
//! - `rebooted` and `ready` flip from false to true at most once
//! - Enumeration order is discovery order

mod error;
mod id;
mod record;
mod state;

pub use error::{FleetError, IdError};
pub use id::{MachineId, SessionId};
pub use record::{MachinePhase, MachineRecord, SessionCount};
pub use state::FleetState;
