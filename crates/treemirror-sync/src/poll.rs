//! Client-side completion polling.
//!
//! The write-side signal can be lost (the drain never ran, a TTL lapsed), so
//! the client gives up after `max_polls` unsuccessful ticks and hands the user
//! the override control instead of polling forever.

use crate::endpoints::{CompletionReport, StatusReport};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::{debug, warn};
use treemirror_core::config::PollConfig;
use treemirror_core::signals::{FailureKind, KeyMigration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling {
        ticks: u32,
    },
    Completed {
        key_migrated: Option<KeyMigration>,
    },
    Failed {
        reason: Option<FailureKind>,
        message: Option<String>,
    },
    TimedOut,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendered {
    pub message: String,
    pub show_override: bool,
}

#[derive(Debug, Clone)]
pub struct PollingClient {
    state: PollState,
    max_polls: u32,
}

impl PollingClient {
    pub fn new(max_polls: u32) -> Self {
        Self {
            state: PollState::Idle,
            max_polls: max_polls.max(1),
        }
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(config.max_polls)
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    pub fn max_polls(&self) -> u32 {
        self.max_polls
    }

    /// Begin polling if the status says an attempt is underway. Only leaves `Idle`.
    pub fn start(&mut self, status: &StatusReport) -> &PollState {
        if self.state == PollState::Idle && status.poll {
            self.state = PollState::Polling { ticks: 0 };
        }
        &self.state
    }

    /// Apply one poll result. No effect outside `Polling`.
    pub fn tick(&mut self, report: &CompletionReport) -> &PollState {
        let PollState::Polling { ticks } = self.state else {
            return &self.state;
        };

        self.state = if report.sync_completed {
            PollState::Completed {
                key_migrated: report.key_migrated.clone(),
            }
        } else if report.sync_failed {
            PollState::Failed {
                reason: report.failure_reason,
                message: report.failure_message.clone(),
            }
        } else if ticks + 1 >= self.max_polls {
            PollState::TimedOut
        } else {
            PollState::Polling { ticks: ticks + 1 }
        };
        &self.state
    }

    pub fn render(&self) -> Rendered {
        match &self.state {
            PollState::Idle => Rendered {
                message: "No sync in progress.".into(),
                show_override: false,
            },
            PollState::Polling { ticks } => Rendered {
                message: format!("Syncing to mirror ({}/{})...", ticks + 1, self.max_polls),
                show_override: false,
            },
            PollState::Completed { key_migrated } => Rendered {
                message: match key_migrated {
                    Some(m) => format!(
                        "Mirror updated. Declared key changed from `{}` to `{}`; update any references.",
                        m.from, m.to
                    ),
                    None => "Mirror updated.".into(),
                },
                show_override: false,
            },
            PollState::Failed { reason, message } => {
                let reason = reason.map(|r| r.as_str()).unwrap_or("unknown");
                let detail = message
                    .as_deref()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default();
                Rendered {
                    message: format!(
                        "Mirror sync failed: {reason}{detail}. Enable override and save again to force the write."
                    ),
                    show_override: true,
                }
            }
            PollState::TimedOut => Rendered {
                message: "Timed out waiting for the mirror sync. Enable override and save again if the mirror is out of date.".into(),
                show_override: true,
            },
        }
    }
}

/// Where completion reports come from: an HTTP client, or the endpoint directly.
pub trait CompletionSource {
    type Error: Display;

    fn fetch(&mut self) -> Result<CompletionReport, Self::Error>;
}

impl<F, E> CompletionSource for F
where
    F: FnMut() -> Result<CompletionReport, E>,
    E: Display,
{
    type Error = E;

    fn fetch(&mut self) -> Result<CompletionReport, E> {
        self()
    }
}

/// Poll until a terminal state. A failed fetch counts as an unsuccessful tick,
/// so the bound holds even when the source is unreachable.
pub fn drive<'c, S: CompletionSource>(
    client: &'c mut PollingClient,
    source: &mut S,
    mut sleep: impl FnMut(),
) -> &'c PollState {
    while matches!(client.state(), PollState::Polling { .. }) {
        let report = source.fetch().unwrap_or_else(|err| {
            warn!(error = %err, "Completion poll failed");
            CompletionReport::default()
        });
        client.tick(&report);
        debug!(state = ?client.state(), "Completion poll tick");
        if !client.state().is_terminal() {
            sleep();
        }
    }
    client.state()
}
