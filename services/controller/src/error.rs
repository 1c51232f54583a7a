//! Run-level errors and their presentation.

use colored::Colorize;
use hostcycle_fleet::FleetError;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::lock::LockError;

/// Conditions that abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Another run for the same tag holds the lock.
    #[error("a run for tag '{0}' is already in progress")]
    LockHeld(String),

    #[error("run lock error: {0}")]
    Lock(#[from] LockError),

    /// Machines could not be listed; there is nothing to operate on.
    #[error("machine discovery failed for tag '{tag}': {source}")]
    Discovery {
        tag: String,
        #[source]
        source: BrokerError,
    },

    #[error("discovery returned an invalid machine set: {0}")]
    InvalidFleet(#[from] FleetError),
}

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const ANOMALY: i32 = 2;
    pub const LOCK_HELD: i32 = 3;
    pub const CANCELLED: i32 = 4;
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::LockHeld(_) => exit_code::LOCK_HELD,
            _ => exit_code::FAILURE,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(run_err) = err.downcast_ref::<RunError>() {
        match run_err {
            RunError::LockHeld(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: If no run is active, the previous one was killed. Remove the lock file and retry."
                        .yellow()
                );
            }
            RunError::Discovery { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Check the broker URL, credentials and tag.".yellow()
                );
            }
            _ => {}
        }
    } else if err.downcast_ref::<ConfigError>().is_some() {
        eprintln!("\n{}", "Hint: Run with --help to see all options.".yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            RunError::LockHeld("wave".to_string()).exit_code(),
            exit_code::LOCK_HELD
        );
        let err = RunError::Discovery {
            tag: "wave".to_string(),
            source: BrokerError::Rejected("down".to_string()),
        };
        assert_eq!(err.exit_code(), exit_code::FAILURE);
        assert!(err.to_string().contains("wave"));
    }
}
