//! Classic multiplexer adapter (tmux session model)
//!
//! Each bridge pane is a detached tmux session named after the logical pane
//! name, so "attach instead of duplicate" is a `has-session` check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::command::{self, args};
use super::{MuxError, MuxKind, Multiplexer, PaneHandle, PaneSpec};
use crate::config::MultiplexerConfig;

/// Single-line texts up to this length go through `send-keys -l`
const FAST_PATH_MAX_LEN: usize = 200;

static BUFFER_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct TmuxAdapter {
    bin: String,
    timeout: Duration,
    enter_delay: Duration,
    capture_lines: usize,
}

impl TmuxAdapter {
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            bin: config.tmux_bin.clone(),
            timeout: config.command_timeout(),
            enter_delay: config.enter_delay(),
            capture_lines: config.capture_lines,
        }
    }

    async fn tmux(&self, argv: Vec<String>) -> Result<command::CommandOutput, MuxError> {
        command::run(&self.bin, &argv, None, self.timeout)
            .await?
            .check(&self.bin)
    }

    async fn has_session(&self, name: &str) -> Result<bool, MuxError> {
        // `=` disables tmux's prefix matching of session names
        let target = format!("={}", name);
        let output = command::run(
            &self.bin,
            &args(["has-session", "-t", target.as_str()]),
            None,
            self.timeout,
        )
        .await?;
        Ok(output.success)
    }

    async fn press_enter(&self, target: &str) -> Result<(), MuxError> {
        if !self.enter_delay.is_zero() {
            tokio::time::sleep(self.enter_delay).await;
        }
        self.tmux(args(["send-keys", "-t", target, "Enter"])).await?;
        Ok(())
    }

    /// Paste through a named buffer loaded from stdin so tmux never parses
    /// the text as part of its own command line.
    async fn paste(&self, target: &str, text: &str) -> Result<(), MuxError> {
        let buffer = format!(
            "pb-{}-{}",
            std::process::id(),
            BUFFER_SEQ.fetch_add(1, Ordering::Relaxed)
        );

        command::run(
            &self.bin,
            &args(["load-buffer", "-b", buffer.as_str(), "-"]),
            Some(text.as_bytes()),
            self.timeout,
        )
        .await?
        .check(&self.bin)?;

        let pasted = self
            .tmux(args(["paste-buffer", "-t", target, "-b", buffer.as_str(), "-p"]))
            .await;

        // Buffer cleanup is best-effort; the paste result decides the outcome
        let _ = command::run(
            &self.bin,
            &args(["delete-buffer", "-b", buffer.as_str()]),
            None,
            self.timeout,
        )
        .await;

        pasted.map(|_| ())
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    fn kind(&self) -> MuxKind {
        MuxKind::Tmux
    }

    async fn create_pane(&self, spec: &PaneSpec) -> Result<PaneHandle, MuxError> {
        if self.has_session(&spec.name).await? {
            debug!("Attaching to existing tmux session {}", spec.name);
            return Ok(PaneHandle::new(MuxKind::Tmux, spec.name.clone()));
        }

        let cwd = spec.work_dir.to_string_lossy().into_owned();
        self.tmux(args([
            "new-session",
            "-d",
            "-s",
            spec.name.as_str(),
            "-c",
            cwd.as_str(),
            spec.launch_command.as_str(),
        ]))
        .await?;

        info!("Created tmux session {} in {}", spec.name, cwd);
        Ok(PaneHandle::new(MuxKind::Tmux, spec.name.clone()))
    }

    async fn pane_exists(&self, handle: &PaneHandle) -> Result<bool, MuxError> {
        self.has_session(&handle.id).await
    }

    async fn send_text(&self, handle: &PaneHandle, text: &str) -> Result<(), MuxError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim_end_matches('\n');
        if sanitized.is_empty() {
            return Ok(());
        }

        if !sanitized.contains('\n') && sanitized.len() <= FAST_PATH_MAX_LEN {
            // `-l` sends the argument as literal keys; `--` keeps a leading
            // dash from being read as a flag
            self.tmux(args(["send-keys", "-t", handle.id.as_str(), "-l", "--", sanitized]))
                .await?;
        } else {
            self.paste(&handle.id, sanitized).await?;
        }

        self.press_enter(&handle.id).await
    }

    async fn capture_output(&self, handle: &PaneHandle) -> Result<String, MuxError> {
        let start = format!("-{}", self.capture_lines);
        let output = self
            .tmux(args([
                "capture-pane",
                "-p",
                "-J",
                "-t",
                handle.id.as_str(),
                "-S",
                start.as_str(),
            ]))
            .await
            .map_err(|e| match e {
                MuxError::CommandFailed { .. } => MuxError::PaneNotFound(handle.id.clone()),
                other => other,
            })?;
        Ok(output.stdout)
    }

    async fn kill_pane(&self, handle: &PaneHandle) {
        if let Err(e) = command::run(
            &self.bin,
            &args(["kill-session", "-t", handle.id.as_str()]),
            None,
            self.timeout,
        )
        .await
        {
            debug!("kill-session for {} failed: {}", handle.id, e);
        }
    }

    async fn focus_pane(&self, handle: &PaneHandle) -> Result<(), MuxError> {
        // Only meaningful when the caller is itself inside tmux
        if std::env::var_os("TMUX").is_some() {
            self.tmux(args(["switch-client", "-t", handle.id.as_str()]))
                .await?;
        } else {
            info!("Attach with: {} attach -t {}", self.bin, handle.id);
        }
        Ok(())
    }
}
