//! Status and control clients.
//!
//! Thin wrappers over [`BrokerApi`] that turn every failure into a log entry
//! plus a conservative answer, so no broker error ever unwinds the phase
//! loop.

use std::sync::Arc;

use hostcycle_fleet::{MachineId, SessionCount};
use tracing::{debug, warn};

use crate::broker::BrokerApi;

/// Reads session occupancy and registration.
#[derive(Clone)]
pub struct StatusClient {
    broker: Arc<dyn BrokerApi>,
    active_only: bool,
}

impl StatusClient {
    pub fn new(broker: Arc<dyn BrokerApi>, active_only: bool) -> Self {
        Self {
            broker,
            active_only,
        }
    }

    /// Session count, or `Unknown` when the broker query failed.
    pub async fn session_count(&self, machine: &MachineId) -> SessionCount {
        match self.broker.session_count(machine, self.active_only).await {
            Ok(count) => {
                debug!(machine = %machine, count, active_only = self.active_only, "Session count");
                SessionCount::Count(count)
            }
            Err(e) => {
                warn!(machine = %machine, error = %e, "Failed to query session count");
                SessionCount::Unknown
            }
        }
    }

    /// Whether the machine reports as registered. Failures read as `false`.
    pub async fn is_registered(&self, machine: &MachineId) -> bool {
        match self.broker.registration_state(machine).await {
            Ok(state) => {
                debug!(machine = %machine, state = ?state, "Registration state");
                state.is_registered()
            }
            Err(e) => {
                warn!(machine = %machine, error = %e, "Failed to query registration state");
                false
            }
        }
    }
}

/// Issues maintenance-mode changes and restarts.
#[derive(Clone)]
pub struct ControlClient {
    broker: Arc<dyn BrokerApi>,
}

impl ControlClient {
    pub fn new(broker: Arc<dyn BrokerApi>) -> Self {
        Self { broker }
    }

    /// Request maintenance mode on or off. No internal retries.
    pub async fn set_maintenance_mode(&self, machine: &MachineId, enabled: bool) -> bool {
        match self.broker.set_maintenance(machine, enabled).await {
            Ok(()) => {
                debug!(machine = %machine, enabled, "Maintenance mode updated");
                true
            }
            Err(e) => {
                warn!(machine = %machine, enabled, error = %e, "Failed to set maintenance mode");
                false
            }
        }
    }

    /// Request a restart. `true` means the broker accepted it.
    pub async fn reboot(&self, machine: &MachineId) -> bool {
        match self.broker.restart(machine).await {
            Ok(()) => true,
            Err(e) => {
                warn!(machine = %machine, error = %e, "Restart request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBroker;

    fn id(s: &str) -> MachineId {
        MachineId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_status_failures_are_conservative() {
        let broker = Arc::new(
            MockBroker::new()
                .with_machine("a", false, &[4])
                .fail_sessions("a")
                .fail_registration("a"),
        );
        let status = StatusClient::new(broker, true);

        assert_eq!(status.session_count(&id("a")).await, SessionCount::Unknown);
        assert!(!status.is_registered(&id("a")).await);
    }

    #[tokio::test]
    async fn test_control_reports_acceptance() {
        let broker = Arc::new(
            MockBroker::new()
                .with_machine("a", false, &[0])
                .with_machine("b", false, &[0])
                .fail_restart("b")
                .fail_maintenance("b"),
        );
        let control = ControlClient::new(broker.clone());

        assert!(control.set_maintenance_mode(&id("a"), true).await);
        assert!(control.reboot(&id("a")).await);
        assert!(!control.set_maintenance_mode(&id("b"), true).await);
        assert!(!control.reboot(&id("b")).await);
        assert_eq!(broker.control_calls(), 4);
    }
}
