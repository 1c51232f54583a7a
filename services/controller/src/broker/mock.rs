//! In-process broker for tests and local experiments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hostcycle_fleet::{MachineId, SessionId};
use tracing::debug;

use super::{
    BrokerApi, BrokerError, DiscoveredMachine, RegistrationState, SessionInfo, SessionState,
    UserMessage,
};

/// A broker call recorded by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    ListMachines(String),
    /// Machine and the `active_only` flag.
    SessionCount(MachineId, bool),
    RegistrationState(MachineId),
    SetMaintenance(MachineId, bool),
    Restart(MachineId),
    ListSessions(MachineId),
    SendMessage(SessionId),
}

#[derive(Debug, Default)]
struct MockState {
    machines: Vec<DiscoveredMachine>,
    /// Scripted counts; the last value repeats once the script runs out.
    sessions: HashMap<MachineId, VecDeque<u32>>,
    restarted: HashSet<MachineId>,
    never_registers: HashSet<MachineId>,
    fail_discovery: bool,
    fail_sessions: HashSet<MachineId>,
    fail_maintenance: HashSet<MachineId>,
    fail_restart: HashSet<MachineId>,
    fail_registration: HashSet<MachineId>,
    fail_list_sessions: HashSet<MachineId>,
    fail_messages: bool,
    calls: Vec<BrokerCall>,
}

/// Scriptable broker.
///
/// Machines report their scripted session counts, register as soon as a
/// restart was accepted (unless told otherwise), and accept every request
/// that was not explicitly configured to fail.
#[derive(Debug, Default)]
pub struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a machine to discovery with a session script.
    pub fn with_machine(self, id: &str, in_maintenance: bool, sessions: &[u32]) -> Self {
        self.configure(id, |s, id| {
            s.machines.push(DiscoveredMachine {
                id: id.clone(),
                in_maintenance,
            });
            s.sessions.insert(id, sessions.iter().copied().collect());
        })
    }

    pub fn never_registers(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.never_registers.insert(id);
        })
    }

    pub fn fail_discovery(self) -> Self {
        self.lock().fail_discovery = true;
        self
    }

    pub fn fail_sessions(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.fail_sessions.insert(id);
        })
    }

    pub fn fail_maintenance(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.fail_maintenance.insert(id);
        })
    }

    pub fn fail_restart(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.fail_restart.insert(id);
        })
    }

    pub fn fail_registration(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.fail_registration.insert(id);
        })
    }

    pub fn fail_list_sessions(self, id: &str) -> Self {
        self.configure(id, |s, id| {
            s.fail_list_sessions.insert(id);
        })
    }

    pub fn fail_messages(self) -> Self {
        self.lock().fail_messages = true;
        self
    }

    /// Make a previously failing restart succeed from now on.
    pub fn heal_restart(&self, id: &str) {
        if let Ok(id) = MachineId::parse(id) {
            self.lock().fail_restart.remove(&id);
        }
    }

    fn configure<F>(self, id: &str, apply: F) -> Self
    where
        F: FnOnce(&mut MockState, MachineId),
    {
        if let Ok(id) = MachineId::parse(id) {
            apply(&mut self.lock(), id);
        }
        self
    }

    /// All calls in the order they were made.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.lock().calls.clone()
    }

    pub fn restarts_for(&self, id: &str) -> usize {
        self.count_calls(|c| matches!(c, BrokerCall::Restart(m) if m.as_str() == id))
    }

    /// Maintenance values requested for a machine, in order.
    pub fn maintenance_calls_for(&self, id: &str) -> Vec<bool> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::SetMaintenance(m, enabled) if m.as_str() == id => Some(*enabled),
                _ => None,
            })
            .collect()
    }

    pub fn session_polls_for(&self, id: &str) -> usize {
        self.count_calls(|c| matches!(c, BrokerCall::SessionCount(m, _) if m.as_str() == id))
    }

    /// `active_only` flags of every session count query, in order.
    pub fn session_poll_flags(&self) -> Vec<bool> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                BrokerCall::SessionCount(_, active_only) => Some(*active_only),
                _ => None,
            })
            .collect()
    }

    pub fn messages_sent(&self) -> usize {
        self.count_calls(|c| matches!(c, BrokerCall::SendMessage(_)))
    }

    /// Number of state-changing calls (maintenance and power).
    pub fn control_calls(&self) -> usize {
        self.count_calls(|c| matches!(c, BrokerCall::SetMaintenance(..) | BrokerCall::Restart(_)))
    }

    fn count_calls<F>(&self, pred: F) -> usize
    where
        F: Fn(&BrokerCall) -> bool,
    {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    fn current_sessions(state: &MockState, machine: &MachineId) -> u32 {
        state
            .sessions
            .get(machine)
            .and_then(|script| script.front().copied())
            .unwrap_or(0)
    }
}

fn rejected(op: &str, target: impl std::fmt::Display) -> BrokerError {
    BrokerError::Rejected(format!("mock {op} failure for {target}"))
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn list_machines(&self, tag: &str) -> Result<Vec<DiscoveredMachine>, BrokerError> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::ListMachines(tag.to_string()));
        if state.fail_discovery {
            return Err(rejected("discovery", tag));
        }
        Ok(state.machines.clone())
    }

    async fn session_count(
        &self,
        machine: &MachineId,
        active_only: bool,
    ) -> Result<u32, BrokerError> {
        let mut state = self.lock();
        state
            .calls
            .push(BrokerCall::SessionCount(machine.clone(), active_only));
        if state.fail_sessions.contains(machine) {
            return Err(rejected("session count", machine));
        }
        let script = state.sessions.entry(machine.clone()).or_default();
        let count = if script.len() > 1 {
            script.pop_front().unwrap_or(0)
        } else {
            script.front().copied().unwrap_or(0)
        };
        debug!(machine = %machine, count, active_only, "[MOCK] Session count");
        Ok(count)
    }

    async fn registration_state(
        &self,
        machine: &MachineId,
    ) -> Result<RegistrationState, BrokerError> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::RegistrationState(machine.clone()));
        if state.fail_registration.contains(machine) {
            return Err(rejected("registration", machine));
        }
        if state.restarted.contains(machine) && !state.never_registers.contains(machine) {
            Ok(RegistrationState::Registered)
        } else {
            Ok(RegistrationState::Unregistered)
        }
    }

    async fn set_maintenance(
        &self,
        machine: &MachineId,
        enabled: bool,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state
            .calls
            .push(BrokerCall::SetMaintenance(machine.clone(), enabled));
        if state.fail_maintenance.contains(machine) {
            return Err(rejected("maintenance", machine));
        }
        if let Some(m) = state.machines.iter_mut().find(|m| &m.id == machine) {
            m.in_maintenance = enabled;
        }
        Ok(())
    }

    async fn restart(&self, machine: &MachineId) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::Restart(machine.clone()));
        if state.fail_restart.contains(machine) {
            return Err(rejected("restart", machine));
        }
        debug!(machine = %machine, "[MOCK] Restart accepted");
        state.restarted.insert(machine.clone());
        Ok(())
    }

    async fn list_sessions(
        &self,
        machine: &MachineId,
        _active_only: bool,
    ) -> Result<Vec<SessionInfo>, BrokerError> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::ListSessions(machine.clone()));
        if state.fail_list_sessions.contains(machine) {
            return Err(rejected("session listing", machine));
        }
        let count = Self::current_sessions(&state, machine);
        (0..count)
            .map(|n| {
                SessionId::parse(&format!("{machine}#{n}"))
                    .map(|id| SessionInfo {
                        id,
                        user: Some(format!("user{n}")),
                        state: SessionState::Active,
                    })
                    .map_err(|e| BrokerError::Rejected(e.to_string()))
            })
            .collect()
    }

    async fn send_message(
        &self,
        session: &SessionId,
        _message: &UserMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.calls.push(BrokerCall::SendMessage(session.clone()));
        if state.fail_messages {
            return Err(rejected("message", session));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MachineId {
        MachineId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_session_script_sticks_on_last_value() {
        let broker = MockBroker::new().with_machine("a", false, &[3, 1, 0]);
        let a = id("a");

        assert_eq!(broker.session_count(&a, false).await.unwrap(), 3);
        assert_eq!(broker.session_count(&a, false).await.unwrap(), 1);
        assert_eq!(broker.session_count(&a, false).await.unwrap(), 0);
        assert_eq!(broker.session_count(&a, false).await.unwrap(), 0);
        assert_eq!(broker.session_polls_for("a"), 4);
        assert_eq!(broker.session_poll_flags(), vec![false; 4]);
    }

    #[tokio::test]
    async fn test_registration_follows_restart() {
        let broker = MockBroker::new()
            .with_machine("a", false, &[0])
            .with_machine("b", false, &[0])
            .never_registers("b");

        assert!(!broker.registration_state(&id("a")).await.unwrap().is_registered());
        broker.restart(&id("a")).await.unwrap();
        broker.restart(&id("b")).await.unwrap();
        assert!(broker.registration_state(&id("a")).await.unwrap().is_registered());
        assert!(!broker.registration_state(&id("b")).await.unwrap().is_registered());
    }

    #[tokio::test]
    async fn test_failures_are_recorded() {
        let broker = MockBroker::new()
            .with_machine("a", false, &[2])
            .fail_restart("a");

        assert!(broker.restart(&id("a")).await.is_err());
        assert_eq!(broker.restarts_for("a"), 1);

        broker.heal_restart("a");
        assert!(broker.restart(&id("a")).await.is_ok());
        assert_eq!(broker.restarts_for("a"), 2);
    }

    #[tokio::test]
    async fn test_sessions_listed_from_current_count() {
        let broker = MockBroker::new().with_machine("a", false, &[2, 0]);
        let sessions = broker.list_sessions(&id("a"), true).await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id.as_str(), "a#0");
    }
}
