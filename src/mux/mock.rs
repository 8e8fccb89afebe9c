//! In-memory multiplexer for tests and dry runs
//!
//! Panes keep a scrollback buffer that echoes everything sent to them. An
//! optional responder plays the hosted assistant: when a framed request
//! arrives it schedules the reply body plus the end marker, which becomes
//! visible to `capture_output` once its delay has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{MuxError, MuxKind, Multiplexer, PaneHandle, PaneSpec};
use crate::dispatch::marker;

/// Produces the assistant's answer for a request, or `None` to stay silent
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Default)]
struct MockPane {
    name: String,
    alive: bool,
    launch_command: String,
    scrollback: String,
    pending: Vec<(Instant, String)>,
    sent: Vec<String>,
}

impl MockPane {
    fn flush_ready(&mut self) {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|(at, _)| *at <= now);
        self.pending = waiting;
        for (_, text) in ready {
            self.scrollback.push_str(&text);
        }
    }
}

#[derive(Default)]
struct MockState {
    panes: HashMap<String, MockPane>,
    next_id: u64,
    created: usize,
    captures: usize,
    focused: Vec<String>,
    failing_sends: usize,
    failing_liveness: usize,
    kills: usize,
    unavailable: bool,
}

pub struct MockMultiplexer {
    kind: MuxKind,
    state: Mutex<MockState>,
    responder: Option<Responder>,
    reply_delay: Duration,
}

impl MockMultiplexer {
    /// Panes that echo input but never answer
    pub fn new() -> Self {
        Self::with_kind(MuxKind::Tmux)
    }

    pub fn with_kind(kind: MuxKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MockState::default()),
            responder: None,
            reply_delay: Duration::ZERO,
        }
    }

    /// Answer every framed request with `respond(request)`
    pub fn with_responder<F>(mut self, respond: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(respond));
        self
    }

    /// Convenience responder that echoes the request back
    pub fn echoing() -> Self {
        Self::new().with_responder(|request| Some(format!("echo: {}", request)))
    }

    /// Delay between receiving a request and the reply appearing
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the pane being closed behind the bridge's back
    pub fn kill_externally(&self, handle: &PaneHandle) {
        if let Some(pane) = self.lock().panes.get_mut(&handle.id) {
            pane.alive = false;
        }
    }

    /// Make the next `count` sends fail
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().failing_sends = count;
    }

    /// Make the next `count` liveness checks time out
    pub fn fail_next_liveness(&self, count: usize) {
        self.lock().failing_liveness = count;
    }

    /// Make every command behave as if the multiplexer binary were missing
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Append raw text to a pane's scrollback
    pub fn push_output(&self, handle: &PaneHandle, text: &str) {
        if let Some(pane) = self.lock().panes.get_mut(&handle.id) {
            pane.scrollback.push_str(text);
        }
    }

    pub fn sent_texts(&self, handle: &PaneHandle) -> Vec<String> {
        self.lock()
            .panes
            .get(&handle.id)
            .map(|p| p.sent.clone())
            .unwrap_or_default()
    }

    pub fn launch_command(&self, handle: &PaneHandle) -> Option<String> {
        self.lock()
            .panes
            .get(&handle.id)
            .map(|p| p.launch_command.clone())
    }

    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    pub fn capture_count(&self) -> usize {
        self.lock().captures
    }

    /// Number of `kill_pane` calls, whether or not the pane was alive
    pub fn kill_count(&self) -> usize {
        self.lock().kills
    }

    pub fn live_panes(&self) -> usize {
        self.lock().panes.values().filter(|p| p.alive).count()
    }

    pub fn focused(&self) -> Vec<String> {
        self.lock().focused.clone()
    }

    fn check_available(&self, state: &MockState) -> Result<(), MuxError> {
        if state.unavailable {
            return Err(MuxError::Unavailable {
                program: self.kind.to_string(),
                reason: "mock marked unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn reply_for(&self, text: &str) -> Option<String> {
        let responder = self.responder.as_ref()?;
        let (request, task_id) = marker::unframe(text)?;
        let body = responder(request)?;
        Some(format!("{}\n{}\n", body, marker::end_marker(task_id)))
    }
}

impl Default for MockMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    fn kind(&self) -> MuxKind {
        self.kind
    }

    async fn create_pane(&self, spec: &PaneSpec) -> Result<PaneHandle, MuxError> {
        let mut state = self.lock();
        self.check_available(&state)?;

        if let Some((id, _)) = state
            .panes
            .iter()
            .find(|(_, pane)| pane.alive && pane.name == spec.name)
        {
            return Ok(PaneHandle::new(self.kind, id.clone()));
        }

        state.next_id += 1;
        state.created += 1;
        let id = format!("mock-{}", state.next_id);
        state.panes.insert(
            id.clone(),
            MockPane {
                name: spec.name.clone(),
                alive: true,
                launch_command: spec.launch_command.clone(),
                scrollback: format!("$ {}\n", spec.launch_command),
                ..MockPane::default()
            },
        );
        Ok(PaneHandle::new(self.kind, id))
    }

    async fn pane_exists(&self, handle: &PaneHandle) -> Result<bool, MuxError> {
        let mut state = self.lock();
        self.check_available(&state)?;
        if state.failing_liveness > 0 {
            state.failing_liveness -= 1;
            return Err(MuxError::Timeout {
                program: self.kind.to_string(),
                timeout: Duration::from_secs(5),
            });
        }
        Ok(state.panes.get(&handle.id).is_some_and(|p| p.alive))
    }

    async fn send_text(&self, handle: &PaneHandle, text: &str) -> Result<(), MuxError> {
        let reply = self.reply_for(text.trim());

        let mut state = self.lock();
        self.check_available(&state)?;
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(MuxError::CommandFailed {
                program: self.kind.to_string(),
                code: Some(1),
                stderr: "injected send failure".to_string(),
            });
        }

        let pane = state
            .panes
            .get_mut(&handle.id)
            .filter(|p| p.alive)
            .ok_or_else(|| MuxError::PaneNotFound(handle.id.clone()))?;

        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim_end_matches('\n');
        pane.sent.push(sanitized.to_string());
        pane.scrollback.push_str(sanitized);
        pane.scrollback.push('\n');
        if let Some(reply) = reply {
            pane.pending.push((Instant::now() + self.reply_delay, reply));
        }
        Ok(())
    }

    async fn capture_output(&self, handle: &PaneHandle) -> Result<String, MuxError> {
        let mut state = self.lock();
        self.check_available(&state)?;
        state.captures += 1;
        let pane = state
            .panes
            .get_mut(&handle.id)
            .filter(|p| p.alive)
            .ok_or_else(|| MuxError::PaneNotFound(handle.id.clone()))?;
        pane.flush_ready();
        Ok(pane.scrollback.clone())
    }

    async fn kill_pane(&self, handle: &PaneHandle) {
        let mut state = self.lock();
        state.kills += 1;
        if let Some(pane) = state.panes.get_mut(&handle.id) {
            pane.alive = false;
        }
    }

    async fn focus_pane(&self, handle: &PaneHandle) -> Result<(), MuxError> {
        let mut state = self.lock();
        if !state.panes.get(&handle.id).is_some_and(|p| p.alive) {
            return Err(MuxError::PaneNotFound(handle.id.clone()));
        }
        state.focused.push(handle.id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(name: &str) -> PaneSpec {
        PaneSpec {
            name: name.to_string(),
            work_dir: PathBuf::from("/tmp/project"),
            launch_command: "assistant".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_attaches_by_name() {
        let mux = MockMultiplexer::new();
        let first = mux.create_pane(&spec("pb-a")).await.unwrap();
        let again = mux.create_pane(&spec("pb-a")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(mux.created_count(), 1);

        mux.kill_externally(&first);
        let fresh = mux.create_pane(&spec("pb-a")).await.unwrap();
        assert_ne!(first, fresh);
        assert!(!mux.pane_exists(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_responder_answers_framed_request() {
        let mux = MockMultiplexer::echoing();
        let pane = mux.create_pane(&spec("pb-echo")).await.unwrap();
        let framed = marker::frame_request("hello", "abc-123456");

        mux.send_text(&pane, &framed).await.unwrap();
        let output = mux.capture_output(&pane).await.unwrap();
        assert_eq!(
            marker::extract_reply(&output, "abc-123456").as_deref(),
            Some("echo: hello")
        );
    }

    #[tokio::test]
    async fn test_delayed_reply_is_hidden_until_ready() {
        let mux = MockMultiplexer::echoing().with_reply_delay(Duration::from_secs(60));
        let pane = mux.create_pane(&spec("pb-slow")).await.unwrap();
        mux.send_text(&pane, &marker::frame_request("hi", "t-0000"))
            .await
            .unwrap();
        let output = mux.capture_output(&pane).await.unwrap();
        assert!(marker::extract_reply(&output, "t-0000").is_none());
    }

    #[tokio::test]
    async fn test_injected_send_failure() {
        let mux = MockMultiplexer::new();
        let pane = mux.create_pane(&spec("pb-f")).await.unwrap();
        mux.fail_next_sends(1);
        assert!(mux.send_text(&pane, "x").await.is_err());
        assert!(mux.send_text(&pane, "x").await.is_ok());
    }
}
