//! Error taxonomy surfaced by the bridge to its callers

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mux::MuxError;

/// Errors produced by registry, dispatch and probe operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No usable multiplexer for the attempted operation. Never retried with a
    /// different multiplexer.
    #[error("no usable terminal multiplexer: {guidance}")]
    BackendUnavailable { guidance: String },

    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    /// Resume requested but no marker record or live pane exists
    #[error("no session found for {backend} in {}", work_dir.display())]
    SessionNotFound { backend: String, work_dir: PathBuf },

    #[error("failed to deliver text to {backend}: {reason}")]
    SendFailed { backend: String, reason: String },

    #[error("no reply from {backend} within {}s (task {task_id})", timeout.as_secs())]
    ReplyTimeout {
        backend: String,
        task_id: String,
        timeout: Duration,
    },

    /// Registry entry points at a pane that no longer exists. Recovered inside
    /// the registry; only visible to callers that inspect records directly.
    #[error("stale session for {backend}: pane {pane_id} no longer exists")]
    StaleSession { backend: String, pane_id: String },

    #[error("{backend} session is busy with task {task_id}")]
    SessionBusy { backend: String, task_id: String },

    #[error("environment mismatch for {backend}: {detail}")]
    EnvironmentMismatch { backend: String, detail: String },

    #[error("state store error: {0}")]
    Store(String),

    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl BridgeError {
    /// Map adapter failures that mean "the multiplexer is not there at all"
    /// onto `BackendUnavailable`; everything else stays a `Mux` error.
    pub fn from_mux(err: MuxError) -> Self {
        match err {
            MuxError::Unavailable { program, reason } => BridgeError::BackendUnavailable {
                guidance: format!(
                    "`{}` could not be started ({}). Install tmux, or run inside WezTerm or iTerm2, \
                     or select another multiplexer with --mux",
                    program, reason
                ),
            },
            other => BridgeError::Mux(other),
        }
    }

    /// Whether the condition is a timeout rather than a hard failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::ReplyTimeout { .. })
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Store(format!("invalid JSON: {}", err))
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_maps_to_backend_unavailable() {
        let err = BridgeError::from_mux(MuxError::Unavailable {
            program: "tmux".to_string(),
            reason: "not found".to_string(),
        });
        assert!(matches!(err, BridgeError::BackendUnavailable { .. }));
        assert!(err.to_string().contains("--mux"));
    }

    #[test]
    fn test_other_mux_errors_are_wrapped() {
        let err = BridgeError::from_mux(MuxError::PaneNotFound("%3".to_string()));
        assert!(matches!(err, BridgeError::Mux(MuxError::PaneNotFound(_))));
    }

    #[test]
    fn test_timeout_classification() {
        let err = BridgeError::ReplyTimeout {
            backend: "codex".to_string(),
            task_id: "1-abc".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("30s"));
    }
}
