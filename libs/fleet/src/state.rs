//! The fleet state tracker.

use std::collections::HashMap;

use crate::{FleetError, MachineId, MachinePhase, MachineRecord, SessionCount};

/// Ordered registry of machine records for one run.
///
/// Populated once from the discovered machine list. Afterwards records change
/// only through the setters below; reads return copies.
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    order: Vec<MachineId>,
    records: HashMap<MachineId, MachineRecord>,
}

impl FleetState {
    /// Build the tracker from `(machine, in_maintenance)` pairs in discovery
    /// order.
    pub fn from_discovered<I>(machines: I) -> Result<Self, FleetError>
    where
        I: IntoIterator<Item = (MachineId, bool)>,
    {
        let mut state = Self::default();
        for (id, in_maintenance) in machines {
            if state.records.contains_key(&id) {
                return Err(FleetError::Duplicate(id));
            }
            state
                .records
                .insert(id.clone(), MachineRecord::new(in_maintenance));
            state.order.push(id);
        }
        Ok(state)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &MachineId) -> Option<MachineRecord> {
        self.records.get(id).copied()
    }

    /// Records in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&MachineId, MachineRecord)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| (id, *r)))
    }

    /// Machines matching `pred`, in discovery order.
    pub fn select<F>(&self, pred: F) -> Vec<MachineId>
    where
        F: Fn(&MachineRecord) -> bool,
    {
        self.iter()
            .filter(|(_, r)| pred(r))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Machines currently in `phase`.
    pub fn in_phase(&self, phase: MachinePhase) -> Vec<MachineId> {
        self.select(|r| r.phase() == phase)
    }

    pub fn all_ready(&self) -> bool {
        self.records.values().all(|r| r.ready)
    }

    pub fn rebooted_count(&self) -> usize {
        self.records.values().filter(|r| r.rebooted).count()
    }

    pub fn ready_count(&self) -> usize {
        self.records.values().filter(|r| r.ready).count()
    }

    /// Record an observed session count.
    pub fn set_session_count(&mut self, id: &MachineId, count: u32) -> Result<(), FleetError> {
        self.record_mut(id)?.sessions = SessionCount::Count(count);
        Ok(())
    }

    /// Record the maintenance flag the broker accepted.
    pub fn set_maintenance(&mut self, id: &MachineId, enabled: bool) -> Result<(), FleetError> {
        self.record_mut(id)?.in_maintenance = enabled;
        Ok(())
    }

    /// Record an accepted restart. Fails if one was already recorded.
    pub fn mark_rebooted(&mut self, id: &MachineId) -> Result<(), FleetError> {
        let record = self.record_mut(id)?;
        if record.rebooted {
            return Err(FleetError::AlreadyRebooted(id.clone()));
        }
        record.rebooted = true;
        Ok(())
    }

    /// Record that a rebooted machine is back in service.
    pub fn mark_ready(&mut self, id: &MachineId) -> Result<(), FleetError> {
        let record = self.record_mut(id)?;
        if !record.rebooted {
            return Err(FleetError::NotRebooted(id.clone()));
        }
        if record.ready {
            return Err(FleetError::AlreadyReady(id.clone()));
        }
        record.ready = true;
        Ok(())
    }

    fn record_mut(&mut self, id: &MachineId) -> Result<&mut MachineRecord, FleetError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| FleetError::UnknownMachine(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MachineId {
        MachineId::parse(s).unwrap()
    }

    fn fleet() -> FleetState {
        FleetState::from_discovered(vec![
            (id("vda-03"), false),
            (id("vda-01"), true),
            (id("vda-02"), false),
        ])
        .unwrap()
    }

    #[test]
    fn test_discovery_order_preserved() {
        let state = fleet();
        let ids: Vec<_> = state.iter().map(|(id, _)| id.as_str().to_string()).collect();
        assert_eq!(ids, vec!["vda-03", "vda-01", "vda-02"]);
        assert_eq!(state.len(), 3);
        assert!(state.get(&id("vda-01")).unwrap().in_maintenance());
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = FleetState::from_discovered(vec![(id("a"), false), (id("a"), true)]).unwrap_err();
        assert_eq!(err, FleetError::Duplicate(id("a")));
    }

    #[test]
    fn test_ready_requires_reboot() {
        let mut state = fleet();
        let m = id("vda-02");

        assert_eq!(state.mark_ready(&m), Err(FleetError::NotRebooted(m.clone())));

        state.mark_rebooted(&m).unwrap();
        state.mark_ready(&m).unwrap();
        let record = state.get(&m).unwrap();
        assert!(record.rebooted() && record.ready());
        assert_eq!(record.phase(), MachinePhase::Ready);
    }

    #[test]
    fn test_transitions_are_one_way() {
        let mut state = fleet();
        let m = id("vda-03");

        state.mark_rebooted(&m).unwrap();
        assert_eq!(
            state.mark_rebooted(&m),
            Err(FleetError::AlreadyRebooted(m.clone()))
        );

        state.mark_ready(&m).unwrap();
        assert_eq!(state.mark_ready(&m), Err(FleetError::AlreadyReady(m.clone())));
        assert_eq!(state.rebooted_count(), 1);
        assert_eq!(state.ready_count(), 1);
    }

    #[test]
    fn test_unknown_machine() {
        let mut state = fleet();
        let ghost = id("ghost");
        assert_eq!(
            state.set_session_count(&ghost, 0),
            Err(FleetError::UnknownMachine(ghost.clone()))
        );
        assert!(state.get(&ghost).is_none());
    }

    #[test]
    fn test_snapshots_do_not_alias() {
        let mut state = fleet();
        let m = id("vda-01");
        let before = state.get(&m).unwrap();

        state.set_session_count(&m, 4).unwrap();

        assert_eq!(before.sessions(), SessionCount::Unknown);
        assert_eq!(state.get(&m).unwrap().sessions(), SessionCount::Count(4));
    }

    #[test]
    fn test_select_and_phases() {
        let mut state = fleet();
        state.set_session_count(&id("vda-03"), 0).unwrap();
        state.mark_rebooted(&id("vda-03")).unwrap();

        assert_eq!(state.in_phase(MachinePhase::Rebooted), vec![id("vda-03")]);
        assert_eq!(state.in_phase(MachinePhase::Draining), vec![id("vda-01")]);
        assert_eq!(state.in_phase(MachinePhase::Unchecked), vec![id("vda-02")]);
        assert_eq!(state.select(|r| !r.rebooted()).len(), 2);
        assert!(!state.all_ready());
    }

    #[test]
    fn test_empty_fleet_is_all_ready() {
        let state = FleetState::from_discovered(Vec::new()).unwrap();
        assert!(state.is_empty());
        assert!(state.all_ready());
    }
}
