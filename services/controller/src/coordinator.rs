//! Run coordinator.
//!
//! Owns one run end to end: takes the tag lock, discovers machines, hands
//! them to the phase controller and releases the lock whatever happened in
//! between.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hostcycle_fleet::{FleetState, MachineId};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::broker::BrokerApi;
use crate::clients::{ControlClient, StatusClient};
use crate::controller::{
    ControllerOptions, ControllerReport, MachineSummary, PhaseController, RunOutcome,
};
use crate::error::{exit_code, RunError};
use crate::lock::RunLockStore;
use crate::notify::NotificationClient;
use crate::timer::Pause;

/// Per-run settings the coordinator passes down.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub controller: ControllerOptions,
    pub active_only: bool,
    pub message_file: PathBuf,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub tag: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_secs: u64,
    pub phase1_secs: u64,
    pub phase1_iterations: u32,
    pub phase2_secs: Option<u64>,
    pub phase2_iterations: u32,
    pub machines_total: usize,
    pub rebooted: usize,
    pub ready: usize,
    pub notified: usize,
    /// Machines forced out of maintenance without confirmed registration.
    pub stranded: Vec<MachineId>,
    pub machines: Vec<MachineSummary>,
}

impl RunReport {
    fn new(
        tag: &str,
        started_at: DateTime<Utc>,
        started: Instant,
        report: ControllerReport,
    ) -> Self {
        Self {
            tag: tag.to_string(),
            outcome: report.outcome,
            started_at,
            finished_at: Utc::now(),
            total_secs: started.elapsed().as_secs(),
            phase1_secs: report.phase1_elapsed.as_secs(),
            phase1_iterations: report.phase1_iterations,
            phase2_secs: report.phase2_elapsed.map(|d| d.as_secs()),
            phase2_iterations: report.phase2_iterations,
            machines_total: report.machines.len(),
            rebooted: report.rebooted(),
            ready: report.ready(),
            notified: report.notified,
            stranded: report.stranded,
            machines: report.machines,
        }
    }

    /// Exit code for the process.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::NoMachines | RunOutcome::Completed | RunOutcome::CompletedInFallback => {
                exit_code::SUCCESS
            }
            RunOutcome::Anomaly => exit_code::ANOMALY,
            RunOutcome::Cancelled => exit_code::CANCELLED,
        }
    }

    fn log_summary(&self) {
        match self.outcome {
            RunOutcome::Anomaly => error!(
                critical = true,
                tag = %self.tag,
                outcome = ?self.outcome,
                machines = self.machines_total,
                ready = self.ready,
                stranded = self.stranded.len(),
                total_secs = self.total_secs,
                "Run finished with machines needing manual follow-up"
            ),
            RunOutcome::Cancelled => warn!(
                tag = %self.tag,
                machines = self.machines_total,
                ready = self.ready,
                total_secs = self.total_secs,
                "Run cancelled"
            ),
            _ => info!(
                tag = %self.tag,
                outcome = ?self.outcome,
                machines = self.machines_total,
                rebooted = self.rebooted,
                ready = self.ready,
                notified = self.notified,
                phase1_secs = self.phase1_secs,
                phase2_secs = ?self.phase2_secs,
                total_secs = self.total_secs,
                "Run finished"
            ),
        }
    }
}

/// Coordinates a single drain-and-reboot run.
pub struct RunCoordinator {
    broker: Arc<dyn BrokerApi>,
    locks: Arc<dyn RunLockStore>,
    settings: RunSettings,
    pause: Pause,
}

impl RunCoordinator {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        locks: Arc<dyn RunLockStore>,
        settings: RunSettings,
        pause: Pause,
    ) -> Self {
        Self {
            broker,
            locks,
            settings,
            pause,
        }
    }

    /// Run the fleet carrying `tag` through drain and reboot.
    ///
    /// Fails only when the lock is held, the lock store breaks, or discovery
    /// fails. Everything else is reported through [`RunReport::outcome`].
    pub async fn run(&self, tag: &str) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let started_at = Utc::now();

        if !self.locks.acquire(tag)? {
            return Err(RunError::LockHeld(tag.to_string()));
        }
        info!(tag, "Run lock acquired");

        let result = self.run_locked(tag, started, started_at).await;

        if let Err(e) = self.locks.release(tag) {
            error!(tag, error = %e, "Failed to release run lock; remove it manually");
        } else {
            info!(tag, "Run lock released");
        }

        result
    }

    async fn run_locked(
        &self,
        tag: &str,
        started: Instant,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport, RunError> {
        let discovered = self
            .broker
            .list_machines(tag)
            .await
            .map_err(|source| RunError::Discovery {
                tag: tag.to_string(),
                source,
            })?;

        if discovered.is_empty() {
            info!(tag, "No machines carry this tag");
        } else {
            info!(tag, machines = discovered.len(), "Machines discovered");
        }

        let fleet = FleetState::from_discovered(
            discovered
                .into_iter()
                .map(|machine| (machine.id, machine.in_maintenance)),
        )?;

        let controller = PhaseController::new(
            fleet,
            StatusClient::new(Arc::clone(&self.broker), self.settings.active_only),
            ControlClient::new(Arc::clone(&self.broker)),
            NotificationClient::new(
                Arc::clone(&self.broker),
                self.settings.message_file.clone(),
                self.settings.controller.concurrency,
            ),
            self.settings.controller,
            self.pause.clone(),
        );

        let report = RunReport::new(tag, started_at, started, controller.run().await);
        report.log_summary();
        Ok(report)
    }
}
