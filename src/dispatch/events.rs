//! Event channel for task lifecycle notifications

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;

/// Side-channel events emitted while tasks progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Framed request delivered to the pane
    Sent { backend: String, task_id: String },
    /// Reply observed within the deadline
    Completed {
        backend: String,
        task_id: String,
        reply: String,
    },
    /// Deadline passed without an end marker
    TimedOut { backend: String, task_id: String },
    /// Reply observed after the task had already timed out
    LateReply {
        backend: String,
        task_id: String,
        reply: String,
    },
    /// Delivery failed, or the pane went away mid-wait
    Failed {
        backend: String,
        task_id: String,
        message: String,
    },
    /// An unbounded wait is still running
    StillWaiting {
        backend: String,
        task_id: String,
        elapsed: Duration,
    },
}

impl DispatchEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DispatchEvent::Sent { task_id, .. }
            | DispatchEvent::Completed { task_id, .. }
            | DispatchEvent::TimedOut { task_id, .. }
            | DispatchEvent::LateReply { task_id, .. }
            | DispatchEvent::Failed { task_id, .. }
            | DispatchEvent::StillWaiting { task_id, .. } => task_id,
        }
    }
}

/// Unbounded event channel. Clones share the sender; only the original
/// owns the receiver.
pub struct EventChannel {
    event_tx: mpsc::UnboundedSender<DispatchEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<DispatchEvent>>,
}

impl Clone for EventChannel {
    fn clone(&self) -> Self {
        Self {
            event_tx: self.event_tx.clone(),
            event_rx: None,
        }
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn send_event(&self, event: DispatchEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("Failed to send event: {}", e))
    }

    /// Next event, or `None` once every sender is gone or this clone has no
    /// receiver
    pub async fn next_event(&mut self) -> Option<DispatchEvent> {
        match &mut self.event_rx {
            Some(event_rx) => event_rx.recv().await,
            None => None,
        }
    }

    /// Non-blocking variant of `next_event`
    pub fn try_next_event(&mut self) -> Option<DispatchEvent> {
        self.event_rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    pub fn event_tx(&self) -> mpsc::UnboundedSender<DispatchEvent> {
        self.event_tx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.event_tx.is_closed()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
