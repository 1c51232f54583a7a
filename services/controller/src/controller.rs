//! Phased drain-and-reboot controller.
//!
//! The controller walks a fleet through two bounded phases:
//!
//! - **Phase 1 (drain)**: keep every pending machine in maintenance, notify
//!   users once, poll sessions on machines that are not yet drained, restart
//!   the ones that reached zero, then release machines that registered
//!   again. Repeats on the poll interval until everything is ready or the
//!   phase budget runs out.
//! - **Phase 2 (fallback)**: restart every machine that is still not
//!   rebooted regardless of sessions, then keep releasing registered
//!   machines until everything is ready or the second budget runs out.
//!
//! If both budgets run out, every machine that is still not ready is forced
//! out of maintenance once so users are not locked out, and the run is
//! reported as an anomaly.
//!
//! Within an iteration the order is always maintenance, session polling,
//! restarts, registration. Each step is a batch over all machines; the
//! tracker is updated in discovery order after the whole batch returns.

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use hostcycle_fleet::{FleetError, FleetState, MachineId, MachinePhase, MachineRecord};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::clients::{ControlClient, StatusClient};
use crate::notify::NotificationClient;
use crate::timer::{Pause, PauseOutcome};

/// Time left in the drain phase that is kept back when shrinking the last wait.
pub const BOUNDARY_MARGIN: Duration = Duration::from_secs(10);

/// Shortest wait between drain iterations.
pub const MIN_WAIT: Duration = Duration::from_secs(1);

/// Phase budgets and wait intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimings {
    pub phase1_budget: Duration,
    pub poll_interval: Duration,
    pub registration_grace: Duration,
    pub phase2_budget: Duration,
}

impl PhaseTimings {
    /// Build timings from minute values.
    pub fn from_minutes(phase1: u64, poll: u64, grace: u64, phase2: u64) -> Self {
        let minutes = |m: u64| Duration::from_secs(m.saturating_mul(60));
        Self {
            phase1_budget: minutes(phase1),
            poll_interval: minutes(poll),
            registration_grace: minutes(grace),
            phase2_budget: minutes(phase2),
        }
    }
}

/// Wait before the next drain iteration.
///
/// Uses the poll interval while it fits into the remaining budget. Otherwise
/// shrinks to the remaining budget minus [`BOUNDARY_MARGIN`], never below
/// [`MIN_WAIT`], so one more iteration runs right before the boundary.
pub fn next_wait(poll_interval: Duration, remaining: Duration) -> Duration {
    if poll_interval <= remaining {
        poll_interval
    } else {
        remaining.saturating_sub(BOUNDARY_MARGIN).max(MIN_WAIT)
    }
}

/// Controller behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub timings: PhaseTimings,
    pub notify_users: bool,
    /// Maximum in-flight broker calls within one batch.
    pub concurrency: usize,
}

/// How the controller finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Nothing to do.
    NoMachines,
    /// Every machine was ready within the drain phase.
    Completed,
    /// The fallback phase was needed but every machine ended ready.
    CompletedInFallback,
    /// Both budgets ran out with machines still not ready.
    Anomaly,
    /// Shutdown was signaled during a pause.
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::NoMachines | Self::Completed | Self::CompletedInFallback
        )
    }
}

/// Final per-machine view.
#[derive(Debug, Clone, Serialize)]
pub struct MachineSummary {
    pub machine: MachineId,
    #[serde(flatten)]
    pub record: MachineRecord,
    pub phase: MachinePhase,
}

/// What the controller did.
#[derive(Debug, Clone)]
pub struct ControllerReport {
    pub outcome: RunOutcome,
    pub phase1_elapsed: Duration,
    pub phase1_iterations: u32,
    pub phase2_elapsed: Option<Duration>,
    pub phase2_iterations: u32,
    pub notified: usize,
    /// Machines forced out of maintenance after both budgets ran out.
    pub stranded: Vec<MachineId>,
    pub machines: Vec<MachineSummary>,
}

impl ControllerReport {
    pub fn rebooted(&self) -> usize {
        self.machines.iter().filter(|m| m.record.rebooted()).count()
    }

    pub fn ready(&self) -> usize {
        self.machines.iter().filter(|m| m.record.ready()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseEnd {
    Converged,
    BudgetExhausted,
    Cancelled,
}

/// The drain-and-reboot state machine for one run.
pub struct PhaseController {
    fleet: FleetState,
    status: StatusClient,
    control: ControlClient,
    notifier: NotificationClient,
    options: ControllerOptions,
    pause: Pause,
    notified: usize,
}

impl PhaseController {
    pub fn new(
        fleet: FleetState,
        status: StatusClient,
        control: ControlClient,
        notifier: NotificationClient,
        options: ControllerOptions,
        pause: Pause,
    ) -> Self {
        Self {
            fleet,
            status,
            control,
            notifier,
            options,
            pause,
            notified: 0,
        }
    }

    /// Drive the fleet through both phases and the terminal fallback.
    pub async fn run(mut self) -> ControllerReport {
        if self.fleet.is_empty() {
            info!("No machines to process");
            return self.report(
                RunOutcome::NoMachines,
                Duration::ZERO,
                0,
                None,
                0,
                Vec::new(),
            );
        }

        info!(
            machines = self.fleet.len(),
            phase1_budget_secs = self.options.timings.phase1_budget.as_secs(),
            phase2_budget_secs = self.options.timings.phase2_budget.as_secs(),
            "Starting drain phase"
        );

        let started = Instant::now();
        let (end, p1_iterations) = self.drain_phase().await;
        let p1_elapsed = started.elapsed();

        match end {
            PhaseEnd::Converged => {
                info!(
                    elapsed_secs = p1_elapsed.as_secs(),
                    iterations = p1_iterations,
                    "All machines ready after drain phase"
                );
                return self.report(
                    RunOutcome::Completed,
                    p1_elapsed,
                    p1_iterations,
                    None,
                    0,
                    Vec::new(),
                );
            }
            PhaseEnd::Cancelled => {
                self.log_cancelled();
                return self.report(
                    RunOutcome::Cancelled,
                    p1_elapsed,
                    p1_iterations,
                    None,
                    0,
                    Vec::new(),
                );
            }
            PhaseEnd::BudgetExhausted => {}
        }

        warn!(
            pending = self.fleet.len() - self.fleet.ready_count(),
            not_rebooted = self.fleet.len() - self.fleet.rebooted_count(),
            "Drain budget exhausted, starting fallback phase"
        );

        let started = Instant::now();
        let (end, p2_iterations) = self.fallback_phase().await;
        let p2_elapsed = started.elapsed();

        match end {
            PhaseEnd::Converged => {
                info!(
                    elapsed_secs = p2_elapsed.as_secs(),
                    iterations = p2_iterations,
                    "All machines ready after fallback phase"
                );
                self.report(
                    RunOutcome::CompletedInFallback,
                    p1_elapsed,
                    p1_iterations,
                    Some(p2_elapsed),
                    p2_iterations,
                    Vec::new(),
                )
            }
            PhaseEnd::Cancelled => {
                self.log_cancelled();
                self.report(
                    RunOutcome::Cancelled,
                    p1_elapsed,
                    p1_iterations,
                    Some(p2_elapsed),
                    p2_iterations,
                    Vec::new(),
                )
            }
            PhaseEnd::BudgetExhausted => {
                let stranded = self.force_release().await;
                self.report(
                    RunOutcome::Anomaly,
                    p1_elapsed,
                    p1_iterations,
                    Some(p2_elapsed),
                    p2_iterations,
                    stranded,
                )
            }
        }
    }

    async fn drain_phase(&mut self) -> (PhaseEnd, u32) {
        let timings = self.options.timings;
        let started = Instant::now();
        let mut iteration = 0u32;

        loop {
            iteration += 1;
            debug!(phase = 1, iteration, "Drain iteration");

            self.enter_maintenance().await;

            if iteration == 1 && self.options.notify_users {
                self.notified = self.notifier.notify_active_sessions(&self.fleet).await;
            }

            self.refresh_sessions().await;
            self.reboot_drained().await;

            if self.pause.wait(timings.registration_grace).await == PauseOutcome::Cancelled {
                return (PhaseEnd::Cancelled, iteration);
            }

            self.release_registered().await;
            self.log_progress(1, iteration);

            if self.fleet.all_ready() {
                return (PhaseEnd::Converged, iteration);
            }

            let elapsed = started.elapsed();
            if elapsed >= timings.phase1_budget {
                return (PhaseEnd::BudgetExhausted, iteration);
            }

            let wait = next_wait(timings.poll_interval, timings.phase1_budget - elapsed);
            debug!(
                wait_secs = wait.as_secs(),
                remaining_secs = (timings.phase1_budget - elapsed).as_secs(),
                "Waiting before next drain iteration"
            );
            if self.pause.wait(wait).await == PauseOutcome::Cancelled {
                return (PhaseEnd::Cancelled, iteration);
            }

            if started.elapsed() >= timings.phase1_budget {
                return (PhaseEnd::BudgetExhausted, iteration);
            }
        }
    }

    async fn fallback_phase(&mut self) -> (PhaseEnd, u32) {
        let timings = self.options.timings;
        let started = Instant::now();
        let mut iteration = 0u32;

        loop {
            iteration += 1;
            debug!(phase = 2, iteration, "Fallback iteration");

            let targets = self.fleet.select(|r| !r.ready() && !r.rebooted());
            self.reboot(targets).await;

            if self.pause.wait(timings.registration_grace).await == PauseOutcome::Cancelled {
                return (PhaseEnd::Cancelled, iteration);
            }

            self.release_registered().await;
            self.log_progress(2, iteration);

            if self.fleet.all_ready() {
                return (PhaseEnd::Converged, iteration);
            }

            if started.elapsed() >= timings.phase2_budget {
                return (PhaseEnd::BudgetExhausted, iteration);
            }
        }
    }

    /// Put pending machines into maintenance, skipping those already there.
    async fn enter_maintenance(&mut self) {
        let targets = self.fleet.select(|r| !r.ready() && !r.in_maintenance());
        if targets.is_empty() {
            return;
        }

        let control = &self.control;
        let results = self
            .batch(targets, |machine| async move {
                let ok = control.set_maintenance_mode(&machine, true).await;
                (machine, ok)
            })
            .await;

        let mut enabled = 0;
        for (machine, ok) in results {
            if ok {
                track(self.fleet.set_maintenance(&machine, true));
                enabled += 1;
            }
        }
        info!(enabled, "Maintenance mode enabled");
    }

    /// Poll sessions on machines that are not known to be drained.
    async fn refresh_sessions(&mut self) {
        let targets = self
            .fleet
            .select(|r| !r.rebooted() && r.sessions().needs_poll());
        if targets.is_empty() {
            return;
        }

        let status = &self.status;
        let results = self
            .batch(targets, |machine| async move {
                let count = status.session_count(&machine).await;
                (machine, count)
            })
            .await;

        for (machine, count) in results {
            if let Some(n) = count.known() {
                track(self.fleet.set_session_count(&machine, n));
            }
        }
    }

    async fn reboot_drained(&mut self) {
        let targets = self
            .fleet
            .select(|r| !r.rebooted() && r.sessions().is_drained());
        self.reboot(targets).await;
    }

    async fn reboot(&mut self, targets: Vec<MachineId>) {
        if targets.is_empty() {
            return;
        }

        let control = &self.control;
        let results = self
            .batch(targets, |machine| async move {
                let ok = control.reboot(&machine).await;
                (machine, ok)
            })
            .await;

        for (machine, ok) in results {
            if ok {
                info!(machine = %machine, "Restart accepted");
                track(self.fleet.mark_rebooted(&machine));
            }
        }
    }

    /// Take registered machines out of maintenance and mark them ready.
    async fn release_registered(&mut self) {
        let waiting = self.fleet.select(|r| r.rebooted() && !r.ready());
        if waiting.is_empty() {
            return;
        }

        let status = &self.status;
        let registered: Vec<MachineId> = self
            .batch(waiting, |machine| async move {
                let registered = status.is_registered(&machine).await;
                (machine, registered)
            })
            .await
            .into_iter()
            .filter_map(|(machine, registered)| registered.then_some(machine))
            .collect();
        if registered.is_empty() {
            return;
        }

        let control = &self.control;
        let results = self
            .batch(registered, |machine| async move {
                let ok = control.set_maintenance_mode(&machine, false).await;
                (machine, ok)
            })
            .await;

        for (machine, ok) in results {
            if ok {
                track(self.fleet.set_maintenance(&machine, false));
                track(self.fleet.mark_ready(&machine));
                info!(machine = %machine, "Machine registered and released to users");
            }
        }
    }

    /// Force maintenance off on every machine that is not ready.
    async fn force_release(&mut self) -> Vec<MachineId> {
        let stranded = self.fleet.select(|r| !r.ready());
        let names: Vec<&str> = stranded.iter().map(MachineId::as_str).collect();

        error!(
            critical = true,
            machines = ?names,
            "Both phase budgets exhausted with machines not ready; forcing maintenance off"
        );

        let control = &self.control;
        let results = self
            .batch(stranded.clone(), |machine| async move {
                let ok = control.set_maintenance_mode(&machine, false).await;
                (machine, ok)
            })
            .await;

        for (machine, ok) in results {
            let record = self.fleet.get(&machine).unwrap_or_default();
            if ok {
                track(self.fleet.set_maintenance(&machine, false));
            }
            error!(
                critical = true,
                machine = %machine,
                rebooted = record.rebooted(),
                maintenance_off = ok,
                "Machine needs manual follow-up"
            );
        }

        stranded
    }

    /// Run `op` for every machine with bounded concurrency, keeping input
    /// order in the results.
    async fn batch<T, F, Fut>(&self, machines: Vec<MachineId>, op: F) -> Vec<(MachineId, T)>
    where
        F: FnMut(MachineId) -> Fut,
        Fut: Future<Output = (MachineId, T)>,
    {
        stream::iter(machines)
            .map(op)
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await
    }

    fn log_progress(&self, phase: u8, iteration: u32) {
        let waiting = self.fleet.in_phase(MachinePhase::Rebooted);
        info!(
            phase,
            iteration,
            machines = self.fleet.len(),
            unchecked = self.fleet.in_phase(MachinePhase::Unchecked).len(),
            draining = self.fleet.in_phase(MachinePhase::Draining).len(),
            rebooted = self.fleet.rebooted_count(),
            ready = self.fleet.ready_count(),
            "Iteration complete"
        );
        if !waiting.is_empty() {
            let names: Vec<&str> = waiting.iter().map(MachineId::as_str).collect();
            debug!(machines = ?names, "Waiting for registration");
        }
    }

    fn log_cancelled(&self) {
        let in_maintenance: Vec<&str> = self
            .fleet
            .iter()
            .filter(|(_, r)| r.in_maintenance())
            .map(|(id, _)| id.as_str())
            .collect();
        warn!(
            machines_in_maintenance = ?in_maintenance,
            "Run cancelled; machines left in maintenance need manual release"
        );
    }

    fn report(
        &self,
        outcome: RunOutcome,
        phase1_elapsed: Duration,
        phase1_iterations: u32,
        phase2_elapsed: Option<Duration>,
        phase2_iterations: u32,
        stranded: Vec<MachineId>,
    ) -> ControllerReport {
        let machines = self
            .fleet
            .iter()
            .map(|(id, record)| MachineSummary {
                machine: id.clone(),
                record,
                phase: record.phase(),
            })
            .collect();

        ControllerReport {
            outcome,
            phase1_elapsed,
            phase1_iterations,
            phase2_elapsed,
            phase2_iterations,
            notified: self.notified,
            stranded,
            machines,
        }
    }
}

fn track(result: Result<(), FleetError>) {
    if let Err(e) = result {
        warn!(machine = %e.machine(), error = %e, "Ignoring inconsistent state update");
    }
}
