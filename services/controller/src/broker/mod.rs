//! Remote broker interface.
//!
//! The broker owns machine maintenance mode, session inventory and power
//! actions. Everything the controller needs from it goes through
//! [`BrokerApi`]:
//! - Discovering machines by tag
//! - Counting and enumerating sessions
//! - Reading registration state
//! - Toggling maintenance mode and issuing restarts
//! - Sending messages to user sessions
//!
//! [`BrokerClient`] speaks the broker's JSON API over HTTP. [`MockBroker`] is
//! an in-process implementation for tests.

mod http;
mod mock;

use async_trait::async_trait;
use hostcycle_fleet::{MachineId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::BrokerClient;
pub use mock::{BrokerCall, MockBroker};

/// Broker call errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Request could not be sent or the response could not be read.
    #[error("broker transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Broker answered with a non-success status.
    #[error("broker returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Base URL cannot carry API paths.
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),

    /// Broker refused the request.
    #[error("broker rejected request: {0}")]
    Rejected(String),
}

/// A machine as returned by tag discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredMachine {
    pub id: MachineId,
    #[serde(default)]
    pub in_maintenance: bool,
}

/// Registration state reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Registered,
    Unregistered,
    Initializing,
    AgentError,
    #[serde(other)]
    Unknown,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// Session state reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Disconnected,
    #[serde(other)]
    Other,
}

/// A user session on a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    #[serde(default)]
    pub user: Option<String>,
    pub state: SessionState,
}

/// Two-part message shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub title: String,
    pub body: String,
}

/// Broker operations used by a run.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// List machines carrying `tag`.
    async fn list_machines(&self, tag: &str) -> Result<Vec<DiscoveredMachine>, BrokerError>;

    /// Count sessions on a machine, optionally only active ones.
    async fn session_count(
        &self,
        machine: &MachineId,
        active_only: bool,
    ) -> Result<u32, BrokerError>;

    /// Read the machine's registration state.
    async fn registration_state(
        &self,
        machine: &MachineId,
    ) -> Result<RegistrationState, BrokerError>;

    /// Turn maintenance mode on or off.
    async fn set_maintenance(&self, machine: &MachineId, enabled: bool)
        -> Result<(), BrokerError>;

    /// Ask the broker to restart a machine. Success means accepted, not done.
    async fn restart(&self, machine: &MachineId) -> Result<(), BrokerError>;

    /// Enumerate sessions on a machine.
    async fn list_sessions(
        &self,
        machine: &MachineId,
        active_only: bool,
    ) -> Result<Vec<SessionInfo>, BrokerError>;

    /// Deliver a message to one session.
    async fn send_message(
        &self,
        session: &SessionId,
        message: &UserMessage,
    ) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_state_unknown_values() {
        let state: RegistrationState = serde_json::from_str("\"registered\"").unwrap();
        assert!(state.is_registered());

        let state: RegistrationState = serde_json::from_str("\"soft_registered\"").unwrap();
        assert_eq!(state, RegistrationState::Unknown);
        assert!(!state.is_registered());
    }

    #[test]
    fn test_discovered_machine_default_maintenance() {
        let m: DiscoveredMachine = serde_json::from_str(r#"{"id": "vda-01"}"#).unwrap();
        assert_eq!(m.id.as_str(), "vda-01");
        assert!(!m.in_maintenance);
    }
}
