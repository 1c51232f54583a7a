//! One-time user notification.
//!
//! The message comes from a plain-text template: blank lines and lines
//! starting with `#` are ignored, the first remaining line is the title and
//! the rest form the body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use hostcycle_fleet::{FleetState, MachineId};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerApi, UserMessage};

/// Template loading errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("notification template {path:?} not found")]
    Missing { path: PathBuf },

    #[error("failed to read notification template {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notification template needs a title and a body line, found {lines} usable line(s)")]
    Malformed { lines: usize },
}

/// Parse template text into a message.
pub fn parse_template(text: &str) -> Result<UserMessage, TemplateError> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();

    match lines.split_first() {
        Some((title, body)) if !body.is_empty() => Ok(UserMessage {
            title: (*title).to_string(),
            body: body.join("\n"),
        }),
        _ => Err(TemplateError::Malformed { lines: lines.len() }),
    }
}

/// Load and parse a template file.
pub fn load_template(path: &Path) -> Result<UserMessage, TemplateError> {
    let text = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            TemplateError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            TemplateError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    parse_template(&text)
}

/// Sends the maintenance notice to users with active sessions.
#[derive(Clone)]
pub struct NotificationClient {
    broker: Arc<dyn BrokerApi>,
    template: PathBuf,
    concurrency: usize,
}

impl NotificationClient {
    pub fn new(broker: Arc<dyn BrokerApi>, template: PathBuf, concurrency: usize) -> Self {
        Self {
            broker,
            template,
            concurrency: concurrency.max(1),
        }
    }

    /// Notify every active session on machines that have not been rebooted.
    ///
    /// Returns the number of messages the broker accepted. Template problems
    /// and broker failures never propagate.
    pub async fn notify_active_sessions(&self, fleet: &FleetState) -> usize {
        let message = match load_template(&self.template) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Skipping user notification");
                return 0;
            }
        };

        let machines = fleet.select(|r| !r.rebooted());
        let message = &message;
        let notified: usize = stream::iter(machines)
            .map(|machine| async move { self.notify_machine(&machine, message).await })
            .buffer_unordered(self.concurrency)
            .fold(0, |acc, n| async move { acc + n })
            .await;

        info!(notified, title = %message.title, "User notification sent");
        notified
    }

    async fn notify_machine(&self, machine: &MachineId, message: &UserMessage) -> usize {
        let sessions = match self.broker.list_sessions(machine, true).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(machine = %machine, error = %e, "Failed to list sessions, skipping machine");
                return 0;
            }
        };

        let mut sent = 0;
        for session in sessions {
            match self.broker.send_message(&session.id, message).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(
                        machine = %machine,
                        session = %session.id,
                        user = session.user.as_deref().unwrap_or("-"),
                        error = %e,
                        "Message not delivered"
                    );
                }
            }
        }
        sent
    }
}
