//! Per-machine bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed session occupancy of a machine.
///
/// `Unknown` means the machine has not been successfully polled yet. A failed
/// poll never produces a value; the previous observation is kept instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SessionCount {
    #[default]
    Unknown,
    Count(u32),
}

impl SessionCount {
    /// Returns true if the machine was observed with no sessions.
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Count(0))
    }

    /// Returns true if the machine still needs polling: never observed or
    /// last seen with sessions.
    pub fn needs_poll(&self) -> bool {
        !self.is_drained()
    }

    /// Returns the count if known.
    pub fn known(&self) -> Option<u32> {
        match self {
            Self::Unknown => None,
            Self::Count(n) => Some(*n),
        }
    }
}

impl fmt::Display for SessionCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionCount::Unknown => write!(f, "unknown"),
            SessionCount::Count(n) => write!(f, "{n}"),
        }
    }
}

/// Snapshot of one machine's state within a run.
///
/// Records are handed out by value; mutation happens only through
/// [`crate::FleetState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MachineRecord {
    pub(crate) sessions: SessionCount,
    pub(crate) in_maintenance: bool,
    pub(crate) rebooted: bool,
    pub(crate) ready: bool,
}

impl MachineRecord {
    pub(crate) fn new(in_maintenance: bool) -> Self {
        Self {
            in_maintenance,
            ..Self::default()
        }
    }

    /// Last observed session count. Only meaningful before reboot.
    pub fn sessions(&self) -> SessionCount {
        self.sessions
    }

    /// Last known maintenance flag. This is a cache of broker state.
    pub fn in_maintenance(&self) -> bool {
        self.in_maintenance
    }

    /// Whether the broker accepted a restart for this machine.
    pub fn rebooted(&self) -> bool {
        self.rebooted
    }

    /// Whether the machine was released back to users after reboot.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Derived lifecycle phase.
    pub fn phase(&self) -> MachinePhase {
        if self.ready {
            MachinePhase::Ready
        } else if self.rebooted {
            MachinePhase::Rebooted
        } else if self.in_maintenance || self.sessions != SessionCount::Unknown {
            MachinePhase::Draining
        } else {
            MachinePhase::Unchecked
        }
    }
}

/// Lifecycle phase of a machine, derived from its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachinePhase {
    /// Not yet protected or polled.
    Unchecked,
    /// In maintenance and/or being polled for sessions.
    Draining,
    /// Restart accepted, waiting for registration.
    Rebooted,
    /// Registered and out of maintenance.
    Ready,
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachinePhase::Unchecked => write!(f, "unchecked"),
            MachinePhase::Draining => write!(f, "draining"),
            MachinePhase::Rebooted => write!(f, "rebooted"),
            MachinePhase::Ready => write!(f, "ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn record(sessions: SessionCount, maint: bool, rebooted: bool, ready: bool) -> MachineRecord {
        MachineRecord {
            sessions,
            in_maintenance: maint,
            rebooted,
            ready,
        }
    }

    #[rstest]
    #[case(SessionCount::Unknown, false, false, false, MachinePhase::Unchecked)]
    #[case(SessionCount::Unknown, true, false, false, MachinePhase::Draining)]
    #[case(SessionCount::Count(3), false, false, false, MachinePhase::Draining)]
    #[case(SessionCount::Count(0), true, true, false, MachinePhase::Rebooted)]
    #[case(SessionCount::Count(0), false, true, true, MachinePhase::Ready)]
    fn test_phase_derivation(
        #[case] sessions: SessionCount,
        #[case] maint: bool,
        #[case] rebooted: bool,
        #[case] ready: bool,
        #[case] expected: MachinePhase,
    ) {
        assert_eq!(record(sessions, maint, rebooted, ready).phase(), expected);
    }

    #[test]
    fn test_session_count_polling() {
        assert!(SessionCount::Unknown.needs_poll());
        assert!(SessionCount::Count(2).needs_poll());
        assert!(!SessionCount::Count(0).needs_poll());
        assert!(SessionCount::Count(0).is_drained());
        assert_eq!(SessionCount::Count(4).known(), Some(4));
        assert_eq!(SessionCount::Unknown.known(), None);
    }

    #[test]
    fn test_session_count_display() {
        assert_eq!(SessionCount::Unknown.to_string(), "unknown");
        assert_eq!(SessionCount::Count(7).to_string(), "7");
    }
}
