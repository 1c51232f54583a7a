//! Cancellable pauses between controller steps.
//!
//! Every timed wait in a run goes through [`Pause`] so the whole loop can be
//! stopped from outside by flipping the shutdown signal.

use std::time::Duration;

use tokio::sync::watch;

/// How a pause ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Elapsed,
    Cancelled,
}

/// Sleep raced against a shutdown signal.
#[derive(Debug, Clone)]
pub struct Pause {
    shutdown: watch::Receiver<bool>,
}

impl Pause {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// A pause nobody can cancel.
    pub fn uncancellable() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { shutdown: rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait for `duration` unless shutdown is signaled first.
    pub async fn wait(&mut self, duration: Duration) -> PauseOutcome {
        if self.is_cancelled() {
            return PauseOutcome::Cancelled;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return PauseOutcome::Elapsed,
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nothing can cancel us any more.
                        (&mut sleep).await;
                        return PauseOutcome::Elapsed;
                    }
                    if *self.shutdown.borrow() {
                        return PauseOutcome::Cancelled;
                    }
                }
            }
        }
    }
}
