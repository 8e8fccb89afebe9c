//! Connectivity probe
//!
//! A ping is a regular framed exchange with a trivial payload and a short
//! deadline. Its reply is never written to the reply cache.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::dispatch::{DispatchMode, Dispatcher, PollOutcome};
use crate::error::{BridgeError, BridgeResult};

/// Payload small enough not to spend meaningful assistant context
pub const PING_PAYLOAD: &str = "ping (reply with one word)";

/// Output fragments that mean the pane's shell could not run what it was
/// given, typically because the assistant lives in another OS environment.
const MISMATCH_SYMPTOMS: [&str; 4] = [
    "command not found",
    "No such file or directory",
    "is not recognized as an internal or external command",
    "cannot find the path",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PingOutcome {
    Alive { latency: Duration },
    Unreachable { reason: String },
}

impl PingOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, PingOutcome::Alive { .. })
    }
}

impl fmt::Display for PingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingOutcome::Alive { latency } => write!(f, "alive ({} ms)", latency.as_millis()),
            PingOutcome::Unreachable { reason } => write!(f, "unreachable: {}", reason),
        }
    }
}

/// Last snapshot line that looks like a shell failure
pub fn mismatch_symptom(snapshot: &str) -> Option<String> {
    snapshot
        .lines()
        .rev()
        .find(|line| {
            let lower = line.to_lowercase();
            MISMATCH_SYMPTOMS
                .iter()
                .any(|symptom| lower.contains(&symptom.to_lowercase()))
        })
        .map(|line| line.trim().to_string())
}

pub struct ConnectivityProber {
    dispatcher: Dispatcher,
}

impl ConnectivityProber {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Round-trip a trivial request through the backend's session, creating
    /// the session if there is none.
    pub async fn ping(&self, backend: &str, work_dir: &Path) -> BridgeResult<PingOutcome> {
        let started = Instant::now();
        let timeout = self.dispatcher.config().ping_timeout();

        let begun = self
            .dispatcher
            .begin(backend, work_dir, PING_PAYLOAD, DispatchMode::Sync)
            .await;
        let (session, mut task) = match begun {
            Ok(begun) => begun,
            Err(BridgeError::SessionBusy { task_id, .. }) => {
                // Sending now would interleave with the running task
                debug!("{} busy with {}, probing pane liveness only", backend, task_id);
                return match self.dispatcher.registry().resume(backend, work_dir).await {
                    Ok(_) => Ok(PingOutcome::Alive {
                        latency: started.elapsed(),
                    }),
                    Err(BridgeError::SessionNotFound { .. }) => Ok(PingOutcome::Unreachable {
                        reason: "session pane no longer exists".to_string(),
                    }),
                    Err(e) => Err(e),
                };
            }
            Err(e @ BridgeError::SendFailed { .. }) => {
                return Ok(PingOutcome::Unreachable {
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let key = session.key();
        let outcome = self.dispatcher.poll_reply(&session, &task.id, Some(timeout)).await;
        self.dispatcher.release(&key, &task.id);

        match outcome {
            PollOutcome::Reply(reply) => {
                task.complete(reply);
                let latency = started.elapsed();
                info!("{} answered ping in {} ms", backend, latency.as_millis());
                Ok(PingOutcome::Alive { latency })
            }
            PollOutcome::PaneGone(pane_id) => Ok(PingOutcome::Unreachable {
                reason: format!("pane {} vanished during the probe", pane_id),
            }),
            PollOutcome::Deadline { last_snapshot } => {
                if let Some(detail) = last_snapshot.as_deref().and_then(mismatch_symptom) {
                    return Err(BridgeError::EnvironmentMismatch {
                        backend: session.backend().to_string(),
                        detail,
                    });
                }
                Ok(PingOutcome::Unreachable {
                    reason: format!("no reply within {}s", timeout.as_secs()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mismatch_symptoms_are_detected() {
        let snapshot = "$ codex\nbash: codex: command not found\n$ ping\n";
        assert_eq!(
            mismatch_symptom(snapshot).as_deref(),
            Some("bash: codex: command not found")
        );

        let windows = "'gemini' is not recognized as an internal or external command,";
        assert!(mismatch_symptom(windows).is_some());
        assert!(mismatch_symptom("all good\n> ").is_none());
    }

    #[test]
    fn test_outcome_display() {
        let alive = PingOutcome::Alive {
            latency: Duration::from_millis(42),
        };
        assert_eq!(alive.to_string(), "alive (42 ms)");
        assert!(alive.is_alive());
    }
}
