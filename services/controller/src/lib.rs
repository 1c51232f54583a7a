//! hostcycle controller library.
//!
//! Drains and reboots a tagged fleet of session-hosting machines through a
//! remote broker with bounded user-facing downtime.
//!
//! ## Architecture
//!
//! - **Broker**: the `BrokerApi` seam, an HTTP client and an in-process mock
//! - **Clients**: status, control and notification wrappers that never fail
//!   the loop
//! - **Controller**: the two-phase drain-and-reboot state machine
//! - **Coordinator**: lock, discovery, controller, release, summary
//!
//! ## Modules
//!
//! - `config`: CLI, file and default settings
//! - `lock`: one run per tag
//! - `timer`: cancellable pauses

pub mod broker;
pub mod clients;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod timer;

// Re-export commonly used types
pub use broker::{BrokerApi, BrokerClient, MockBroker};
pub use controller::{ControllerOptions, PhaseController, PhaseTimings, RunOutcome};
pub use coordinator::{RunCoordinator, RunReport, RunSettings};
pub use error::RunError;
