//! Terminal multiplexer adapters
//!
//! One capability interface over the supported pane hosts. The concrete
//! adapter is chosen once per process from the environment facts; sessions
//! created under another multiplexer keep using the adapter of their own
//! kind.

pub mod command;
pub mod iterm2;
pub mod mock;
#[cfg(all(test, unix))]
mod recorder;
pub mod tmux;
pub mod wezterm;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MultiplexerConfig;
use crate::environment::EnvironmentFacts;

pub use iterm2::Iterm2Adapter;
pub use mock::MockMultiplexer;
pub use tmux::TmuxAdapter;
pub use wezterm::WeztermAdapter;

/// Supported multiplexer products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxKind {
    Tmux,
    Wezterm,
    Iterm2,
}

impl MuxKind {
    /// Fallback order when the caller is not already inside a multiplexer:
    /// pane-split terminal first, scripting API second, classic last.
    pub const PREFERENCE: [MuxKind; 3] = [MuxKind::Wezterm, MuxKind::Iterm2, MuxKind::Tmux];

    pub fn as_str(&self) -> &'static str {
        match self {
            MuxKind::Tmux => "tmux",
            MuxKind::Wezterm => "wezterm",
            MuxKind::Iterm2 => "iterm2",
        }
    }
}

impl fmt::Display for MuxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MuxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmux" => Ok(MuxKind::Tmux),
            "wezterm" => Ok(MuxKind::Wezterm),
            "iterm2" | "iterm" => Ok(MuxKind::Iterm2),
            other => Err(format!(
                "unknown multiplexer `{}` (expected tmux, wezterm or iterm2)",
                other
            )),
        }
    }
}

/// Opaque pane reference understood only by the adapter of the same kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneHandle {
    pub kind: MuxKind,
    pub id: String,
}

impl PaneHandle {
    pub fn new(kind: MuxKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for PaneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Everything an adapter needs to create (or re-attach to) a pane
#[derive(Debug, Clone)]
pub struct PaneSpec {
    /// Logical name, stable for a (backend, working directory) pair
    pub name: String,
    pub work_dir: PathBuf,
    /// Shell command line that starts the hosted assistant
    pub launch_command: String,
}

/// Adapter failures
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("`{program}` is not available: {reason}")]
    Unavailable { program: String, reason: String },

    #[error("`{program}` did not finish within {}ms", timeout.as_millis())]
    Timeout { program: String, timeout: Duration },

    #[error("`{program}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("pane {0} does not exist")]
    PaneNotFound(String),

    #[error("unexpected multiplexer output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Uniform capability set over pane hosts
#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn kind(&self) -> MuxKind;

    /// Create a pane running `spec.launch_command`, or attach to the pane that
    /// already carries `spec.name`.
    async fn create_pane(&self, spec: &PaneSpec) -> Result<PaneHandle, MuxError>;

    /// `Ok(false)` only when the host confirms the pane is gone. An error
    /// means liveness is unknown (slow or failing host CLI).
    async fn pane_exists(&self, handle: &PaneHandle) -> Result<bool, MuxError>;

    /// Deliver `text` verbatim to the pane's input, followed by Enter.
    /// Carriage returns and trailing newlines are dropped; Enter is sent
    /// separately.
    async fn send_text(&self, handle: &PaneHandle, text: &str) -> Result<(), MuxError>;

    /// Visible text plus scrollback. Must be side-effect free.
    async fn capture_output(&self, handle: &PaneHandle) -> Result<String, MuxError>;

    /// Best-effort; a pane that is already gone is not an error
    async fn kill_pane(&self, handle: &PaneHandle);

    /// Bring the pane to the foreground where the host supports it
    async fn focus_pane(&self, _handle: &PaneHandle) -> Result<(), MuxError> {
        Ok(())
    }
}

/// Adapters available to this process, keyed by kind, with the preferred one
/// used for new panes.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<MuxKind, Arc<dyn Multiplexer>>,
    primary: Option<MuxKind>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per available kind; the first ranked kind becomes the
    /// primary.
    pub fn from_facts(facts: &EnvironmentFacts, config: &MultiplexerConfig) -> Self {
        let mut set = Self::new();
        for kind in &facts.available {
            let adapter: Arc<dyn Multiplexer> = match kind {
                MuxKind::Tmux => Arc::new(TmuxAdapter::new(config)),
                MuxKind::Wezterm => Arc::new(WeztermAdapter::new(config, facts)),
                MuxKind::Iterm2 => Arc::new(Iterm2Adapter::new(config)),
            };
            set.insert(adapter);
        }
        set
    }

    /// Register an adapter. The first one inserted becomes the primary.
    pub fn insert(&mut self, adapter: Arc<dyn Multiplexer>) {
        let kind = adapter.kind();
        if self.primary.is_none() {
            self.primary = Some(kind);
        }
        self.adapters.insert(kind, adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn Multiplexer>) -> Self {
        self.insert(adapter);
        self
    }

    pub fn primary(&self) -> Option<Arc<dyn Multiplexer>> {
        self.primary.and_then(|kind| self.get(kind))
    }

    pub fn primary_kind(&self) -> Option<MuxKind> {
        self.primary
    }

    pub fn get(&self, kind: MuxKind) -> Option<Arc<dyn Multiplexer>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_kind_parsing() {
        assert_eq!("tmux".parse::<MuxKind>().unwrap(), MuxKind::Tmux);
        assert_eq!("WezTerm".parse::<MuxKind>().unwrap(), MuxKind::Wezterm);
        assert_eq!("iterm".parse::<MuxKind>().unwrap(), MuxKind::Iterm2);
        assert!("screen".parse::<MuxKind>().is_err());
    }

    #[test]
    fn test_mux_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&MuxKind::Iterm2).unwrap();
        assert_eq!(json, "\"iterm2\"");
    }

    #[test]
    fn test_adapter_set_primary_is_first_inserted() {
        let set = AdapterSet::new()
            .with(Arc::new(MockMultiplexer::with_kind(MuxKind::Tmux)))
            .with(Arc::new(MockMultiplexer::with_kind(MuxKind::Wezterm)));
        assert_eq!(set.primary_kind(), Some(MuxKind::Tmux));
        assert!(set.get(MuxKind::Wezterm).is_some());
        assert!(set.get(MuxKind::Iterm2).is_none());
    }
}
