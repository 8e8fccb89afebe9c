//! Message dispatch protocol
//!
//! Sends a framed request into a session's pane and scrapes the pane output
//! until the matching end marker shows up. Each session carries at most one
//! in-flight task, enforced through a claim in the session store; no lock is
//! held while a multiplexer command runs.

pub mod events;
pub mod marker;
pub mod task;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CachedReply, ReplyCache};
use crate::config::DispatchConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::mux::MuxError;
use crate::notify::CompletionNotifier;
use crate::session::{Session, SessionKey, SessionRegistry};

pub use events::{DispatchEvent, EventChannel};
pub use task::{DispatchMode, Task, TaskHandle, TaskState};

/// What happens to a synchronous task's wait after its deadline passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Continuation {
    /// Keep polling on a background tokio task of this process
    #[default]
    InProcess,
    /// Leave the claim held; a separate watcher process takes over
    Handoff,
}

/// Result of one bounded wait for an end marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Reply(String),
    Deadline { last_snapshot: Option<String> },
    PaneGone(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    cache: Arc<dyn ReplyCache>,
    notifier: Arc<dyn CompletionNotifier>,
    events: Option<EventChannel>,
    config: DispatchConfig,
    continuation: Continuation,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cache: Arc<dyn ReplyCache>,
        notifier: Arc<dyn CompletionNotifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            notifier,
            events: None,
            config,
            continuation: Continuation::default(),
        }
    }

    pub fn with_events(mut self, events: EventChannel) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_continuation(mut self, continuation: Continuation) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.send_event(event) {
                debug!("Dropping dispatch event: {}", e);
            }
        }
    }

    fn canonical_key(&self, backend: &str, work_dir: &Path) -> BridgeResult<SessionKey> {
        let name = &self.registry.backends().get(backend)?.name;
        Ok(SessionKey::new(name.as_str(), work_dir))
    }

    pub(crate) fn release(&self, key: &SessionKey, task_id: &str) {
        if let Err(e) = self.registry.store().release(key, task_id) {
            warn!("Failed to release {} for task {}: {}", key.backend, task_id, e);
        }
    }

    /// Resolve the session, claim it, frame and deliver `message`
    pub(crate) async fn begin(
        &self,
        backend: &str,
        work_dir: &Path,
        message: &str,
        mode: DispatchMode,
    ) -> BridgeResult<(Session, Task)> {
        let session = self.registry.get_or_create(backend, work_dir).await?;
        let key = session.key();
        let task_id = marker::new_task_id(self.config.marker_entropy);

        self.registry
            .store()
            .claim(&key, &task_id, self.config.inflight_stale())?;

        let mut task = Task::new(
            task_id,
            session.backend(),
            work_dir.to_path_buf(),
            &session.record.pane_id,
            message,
            mode,
        );

        let framed = marker::frame_request(message, &task.id);
        if let Err(e) = self.deliver(&session, &framed).await {
            task.fail(TaskState::FailedToSend, e.to_string());
            self.emit(DispatchEvent::Failed {
                backend: task.backend.clone(),
                task_id: task.id.clone(),
                message: e.to_string(),
            });
            self.release(&key, &task.id);
            return Err(e);
        }

        task.transition(TaskState::Sent);
        self.emit(DispatchEvent::Sent {
            backend: task.backend.clone(),
            task_id: task.id.clone(),
        });
        task.transition(TaskState::AwaitingMarker);
        Ok((session, task))
    }

    /// `send_text` with a single retry
    async fn deliver(&self, session: &Session, text: &str) -> BridgeResult<()> {
        let handle = session.handle();
        let first = match session.adapter.send_text(&handle, text).await {
            Ok(()) => return Ok(()),
            Err(e @ MuxError::Unavailable { .. }) => return Err(BridgeError::from_mux(e)),
            Err(e) => e,
        };

        warn!("Send to {} failed ({}), retrying once", handle, first);
        tokio::time::sleep(self.config.send_retry_delay()).await;

        session
            .adapter
            .send_text(&handle, text)
            .await
            .map_err(|e| BridgeError::SendFailed {
                backend: session.backend().to_string(),
                reason: e.to_string(),
            })
    }

    /// Poll the pane until the reply for `task_id` is complete or `budget`
    /// runs out. Without a budget only a reply or a vanished pane ends the
    /// wait, and a `StillWaiting` event goes out every `progress_interval`.
    pub(crate) async fn poll_reply(
        &self,
        session: &Session,
        task_id: &str,
        budget: Option<Duration>,
    ) -> PollOutcome {
        let started = Instant::now();
        let deadline = budget.map(|budget| started + budget);
        let mut next_progress = started + self.config.progress_interval();
        let mut backoff = ExponentialBackoff {
            current_interval: self.config.poll_initial(),
            initial_interval: self.config.poll_initial(),
            randomization_factor: 0.0,
            multiplier: 1.5,
            max_interval: self.config.poll_max(),
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let handle = session.handle();
        let mut last_snapshot = None;

        loop {
            match session.adapter.capture_output(&handle).await {
                Ok(snapshot) => {
                    if let Some(reply) = marker::extract_reply(&snapshot, task_id) {
                        return PollOutcome::Reply(reply);
                    }
                    last_snapshot = Some(snapshot);
                }
                Err(MuxError::PaneNotFound(id)) => {
                    match session.adapter.pane_exists(&handle).await {
                        Ok(false) => return PollOutcome::PaneGone(id),
                        Ok(true) => debug!("Capture of {} failed but the pane is still listed", handle),
                        Err(e) => debug!("Capture of {} failed and liveness is unknown: {}", handle, e),
                    }
                }
                Err(e) => debug!("Capture of {} failed: {}", handle, e),
            }

            let now = Instant::now();
            let mut pause = backoff
                .next_backoff()
                .unwrap_or_else(|| self.config.poll_max());
            match deadline {
                Some(deadline) if now >= deadline => {
                    return PollOutcome::Deadline { last_snapshot };
                }
                Some(deadline) => pause = pause.min(deadline - now),
                None if now >= next_progress => {
                    let elapsed = now - started;
                    info!(
                        "Still waiting for {} ({}s, task {})",
                        session.backend(),
                        elapsed.as_secs(),
                        task_id
                    );
                    self.emit(DispatchEvent::StillWaiting {
                        backend: session.backend().to_string(),
                        task_id: task_id.to_string(),
                        elapsed,
                    });
                    next_progress += self.config.progress_interval();
                }
                None => {}
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Record which assistant conversation answered, so resumes reopen it
    async fn bind_conversation(&self, session: &Session, task: &Task) {
        if let Err(e) = self
            .registry
            .remember_conversation(session, task.started_at.into())
            .await
        {
            debug!("Could not bind {} to its conversation: {}", session.handle(), e);
        }
    }

    async fn complete(&self, session: &Session, task: &mut Task, reply: String, notify: bool) {
        if let Err(e) = self
            .cache
            .store(&session.key(), &CachedReply::new(&task.backend, &task.id, &reply))
        {
            warn!("Failed to cache reply for task {}: {}", task.id, e);
        }
        self.bind_conversation(session, task).await;
        if notify {
            self.notifier.reply_ready(&task.backend, &task.id, &reply);
        }
        task.complete(reply.clone());
        self.emit(DispatchEvent::Completed {
            backend: task.backend.clone(),
            task_id: task.id.clone(),
            reply,
        });
    }

    fn time_out(&self, task: &mut Task) {
        warn!("No reply from {} before the deadline (task {})", task.backend, task.id);
        task.fail(TaskState::TimedOut, "end marker not observed before the deadline");
        self.emit(DispatchEvent::TimedOut {
            backend: task.backend.clone(),
            task_id: task.id.clone(),
        });
    }

    fn pane_gone(&self, task: &mut Task, pane_id: &str) {
        warn!("Pane {} vanished while task {} was waiting", pane_id, task.id);
        task.fail(TaskState::TimedOut, format!("pane {} vanished", pane_id));
        self.emit(DispatchEvent::Failed {
            backend: task.backend.clone(),
            task_id: task.id.clone(),
            message: format!("pane {} vanished", pane_id),
        });
    }

    /// Keep watching a timed-out task so a late reply still reaches the cache
    async fn linger(&self, session: &Session, task: &mut Task, budget: Duration) -> bool {
        if budget.is_zero() {
            return false;
        }
        match self.poll_reply(session, &task.id, Some(budget)).await {
            PollOutcome::Reply(reply) => {
                info!("Late reply from {} for task {}", task.backend, task.id);
                if let Err(e) = self
                    .cache
                    .store(&session.key(), &CachedReply::new(&task.backend, &task.id, &reply))
                {
                    warn!("Failed to cache late reply for task {}: {}", task.id, e);
                }
                self.bind_conversation(session, task).await;
                self.notifier.reply_ready(&task.backend, &task.id, &reply);
                task.reply = Some(reply.clone());
                self.emit(DispatchEvent::LateReply {
                    backend: task.backend.clone(),
                    task_id: task.id.clone(),
                    reply,
                });
                true
            }
            PollOutcome::Deadline { .. } => {
                info!("Gave up watching task {} for {}", task.id, task.backend);
                false
            }
            PollOutcome::PaneGone(pane_id) => {
                self.pane_gone(task, &pane_id);
                false
            }
        }
    }

    /// Background watch left after a bounded wait. An unbounded wait has
    /// nothing left to linger for.
    fn linger_budget(&self) -> Duration {
        match self.config.reply_deadline() {
            Some(timeout) => self.config.watch_max().saturating_sub(timeout),
            None => Duration::ZERO,
        }
    }

    /// Send and wait for the reply. On timeout the task may keep being
    /// watched in the background (see `Continuation`). A zero reply timeout
    /// waits until the reply arrives or the pane goes away.
    pub async fn send_sync(&self, backend: &str, work_dir: &Path, message: &str) -> BridgeResult<String> {
        let (session, mut task) = self.begin(backend, work_dir, message, DispatchMode::Sync).await?;
        let key = session.key();

        match self.poll_reply(&session, &task.id, self.config.reply_deadline()).await {
            PollOutcome::Reply(reply) => {
                self.complete(&session, &mut task, reply.clone(), false).await;
                self.release(&key, &task.id);
                Ok(reply)
            }
            PollOutcome::PaneGone(pane_id) => {
                self.pane_gone(&mut task, &pane_id);
                self.release(&key, &task.id);
                Err(BridgeError::Mux(MuxError::PaneNotFound(pane_id)))
            }
            PollOutcome::Deadline { .. } => {
                self.time_out(&mut task);
                let err = BridgeError::ReplyTimeout {
                    backend: task.backend.clone(),
                    task_id: task.id.clone(),
                    timeout: self.config.reply_timeout(),
                };

                if !self.config.continue_after_timeout {
                    self.release(&key, &task.id);
                    return Err(err);
                }

                match self.continuation {
                    Continuation::InProcess => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            let budget = this.linger_budget();
                            this.linger(&session, &mut task, budget).await;
                            this.release(&session.key(), &task.id);
                        });
                    }
                    Continuation::Handoff => {
                        debug!("Task {} handed off with its claim held", task.id);
                    }
                }
                Err(err)
            }
        }
    }

    /// Send and return immediately. A detached watcher owns the wait; the
    /// handle only observes it.
    pub async fn send_async(&self, backend: &str, work_dir: &Path, message: &str) -> BridgeResult<TaskHandle> {
        let (session, task) = self.begin(backend, work_dir, message, DispatchMode::Async).await?;
        let (tx, rx) = watch::channel(task.clone());
        let handle = TaskHandle::new(task.id.clone(), rx);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_watcher(session, task, tx).await;
        });
        Ok(handle)
    }

    async fn run_watcher(&self, session: Session, mut task: Task, tx: watch::Sender<Task>) {
        let key = session.key();
        let budget = self
            .config
            .reply_deadline()
            .unwrap_or_else(|| self.config.watch_max());
        match self.poll_reply(&session, &task.id, Some(budget)).await {
            PollOutcome::Reply(reply) => {
                self.complete(&session, &mut task, reply, true).await;
                tx.send_replace(task.clone());
            }
            PollOutcome::PaneGone(pane_id) => {
                self.pane_gone(&mut task, &pane_id);
                tx.send_replace(task.clone());
            }
            PollOutcome::Deadline { .. } => {
                self.time_out(&mut task);
                tx.send_replace(task.clone());
                if self.linger(&session, &mut task, self.linger_budget()).await {
                    tx.send_replace(task.clone());
                }
            }
        }
        self.release(&key, &task.id);
    }

    /// Send and return the task id, leaving the claim for an external
    /// watcher (`watch`) to finish and release.
    pub async fn send_detached(&self, backend: &str, work_dir: &Path, message: &str) -> BridgeResult<String> {
        let (_, task) = self.begin(backend, work_dir, message, DispatchMode::Async).await?;
        Ok(task.id)
    }

    /// Give up on a handed-off task without watching it
    pub fn abandon(&self, backend: &str, work_dir: &Path, task_id: &str) -> BridgeResult<()> {
        let key = self.canonical_key(backend, work_dir)?;
        self.release(&key, task_id);
        Ok(())
    }

    /// Watch an already-sent task to completion (external watcher entry
    /// point). Never creates a session. Returns the reply if one arrived
    /// within `watch_max`.
    pub async fn watch(&self, backend: &str, work_dir: &Path, task_id: &str) -> BridgeResult<Option<String>> {
        let key = self.canonical_key(backend, work_dir)?;
        let session = match self.registry.resume(backend, work_dir).await {
            Ok(session) => session,
            Err(e) => {
                self.release(&key, task_id);
                return Err(e);
            }
        };

        let mut task = Task::new(
            task_id.to_string(),
            session.backend(),
            work_dir.to_path_buf(),
            &session.record.pane_id,
            "",
            DispatchMode::Async,
        );
        task.transition(TaskState::AwaitingMarker);

        let outcome = self
            .poll_reply(&session, task_id, Some(self.config.watch_max()))
            .await;
        let result = match outcome {
            PollOutcome::Reply(reply) => {
                self.complete(&session, &mut task, reply.clone(), true).await;
                Ok(Some(reply))
            }
            PollOutcome::Deadline { .. } => {
                self.time_out(&mut task);
                Ok(None)
            }
            PollOutcome::PaneGone(pane_id) => {
                self.pane_gone(&mut task, &pane_id);
                Err(BridgeError::Mux(MuxError::PaneNotFound(pane_id)))
            }
        };
        self.release(&key, task_id);
        result
    }

    /// Latest cached reply for the session, without touching the pane
    pub fn pending(&self, backend: &str, work_dir: &Path) -> BridgeResult<Option<CachedReply>> {
        let key = self.canonical_key(backend, work_dir)?;
        self.cache.latest(&key)
    }
}
