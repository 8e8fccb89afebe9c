//! Task lifecycle

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Caller waits for the reply
    Sync,
    /// Caller gets the task id back immediately
    Async,
}

/// `queued -> sent -> awaiting-marker -> completed | timed-out`, or
/// `queued -> failed-to-send`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Queued,
    Sent,
    AwaitingMarker,
    Completed,
    TimedOut,
    FailedToSend,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::TimedOut | TaskState::FailedToSend
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Queued => "queued",
            TaskState::Sent => "sent",
            TaskState::AwaitingMarker => "awaiting-marker",
            TaskState::Completed => "completed",
            TaskState::TimedOut => "timed-out",
            TaskState::FailedToSend => "failed-to-send",
        };
        f.write_str(name)
    }
}

/// One message exchange with a session
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub backend: String,
    pub work_dir: PathBuf,
    pub pane_id: String,
    pub request: String,
    pub mode: DispatchMode,
    pub state: TaskState,
    /// Reply body, once the end marker was seen
    pub reply: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: String,
        backend: &str,
        work_dir: PathBuf,
        pane_id: &str,
        request: &str,
        mode: DispatchMode,
    ) -> Self {
        Self {
            id,
            backend: backend.to_string(),
            work_dir,
            pane_id: pane_id.to_string(),
            request: request.to_string(),
            mode,
            state: TaskState::Queued,
            reply: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: TaskState) {
        debug!("Task {} ({}): {} -> {}", self.id, self.backend, self.state, next);
        self.state = next;
        if next.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, reply: String) {
        self.reply = Some(reply);
        self.transition(TaskState::Completed);
    }

    pub fn fail(&mut self, state: TaskState, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(state);
    }
}

/// Caller's view of a task running on a background watcher.
///
/// Dropping the handle only drops the caller's interest; the watcher keeps
/// going and still writes the reply cache.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: String,
    rx: watch::Receiver<Task>,
}

impl TaskHandle {
    pub(crate) fn new(id: String, rx: watch::Receiver<Task>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> Task {
        self.rx.borrow().clone()
    }

    /// Wait until the task reaches a terminal state
    pub async fn wait(&mut self) -> Task {
        let finished = self
            .rx
            .wait_for(|task| task.state.is_terminal())
            .await
            .map(|task| task.clone());
        // Watcher gone; the last published state is all there is
        finished.unwrap_or_else(|_| self.rx.borrow().clone())
    }
}
