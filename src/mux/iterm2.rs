//! Scripting-API adapter (iTerm2 through the `it2` CLI)
//!
//! Pane creation, input, listing and closing go through `it2`; scrollback is
//! read with AppleScript because `it2` has no capture command.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::command::{self, args};
use super::{MuxError, MuxKind, Multiplexer, PaneHandle, PaneSpec};
use crate::config::MultiplexerConfig;

/// Time a fresh split needs before its shell accepts input
const PANE_READY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct It2Session {
    id: String,
    #[serde(default)]
    name: String,
}

pub struct Iterm2Adapter {
    bin: String,
    timeout: Duration,
    enter_delay: Duration,
}

impl Iterm2Adapter {
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            bin: config.it2_bin.clone(),
            timeout: config.command_timeout(),
            enter_delay: config.enter_delay(),
        }
    }

    async fn it2(&self, argv: Vec<String>) -> Result<command::CommandOutput, MuxError> {
        command::run(&self.bin, &argv, None, self.timeout)
            .await?
            .check(&self.bin)
    }

    async fn list_sessions(&self) -> Result<Vec<It2Session>, MuxError> {
        let output = self.it2(args(["session", "list", "--json"])).await?;
        serde_json::from_str(&output.stdout)
            .map_err(|e| MuxError::Parse(format!("it2 session list: {}", e)))
    }

    async fn type_line(&self, session: &str, text: &str) -> Result<(), MuxError> {
        self.it2(send_args(session, text)).await?;
        if !self.enter_delay.is_zero() {
            tokio::time::sleep(self.enter_delay).await;
        }
        self.it2(send_args(session, "\r")).await?;
        Ok(())
    }
}

/// `--` ends option parsing, so text starting with `-` stays text
fn send_args(session: &str, text: &str) -> Vec<String> {
    args(["session", "send", "--session", session, "--", text])
}

/// Parse `Created new pane: <id>`
fn parse_split_output(stdout: &str) -> Option<String> {
    let line = stdout.trim();
    let id = match line.rsplit_once(": ") {
        Some((_, id)) => id.trim(),
        None => line,
    };
    (!id.is_empty()).then(|| id.to_string())
}

/// `it2` ids may carry a `w0t0p0:` location prefix; AppleScript only knows
/// the unique id part.
fn unique_id(id: &str) -> &str {
    id.rsplit_once(':').map_or(id, |(_, uuid)| uuid)
}

fn contents_script(id: &str) -> String {
    let id = unique_id(id).replace('"', "");
    format!(
        r#"tell application "iTerm2"
  repeat with w in windows
    repeat with t in tabs of w
      repeat with s in sessions of t
        if unique id of s is "{}" then return contents of s
      end repeat
    end repeat
  end repeat
end tell
error "session not found""#,
        id
    )
}

fn startup_line(work_dir: &Path, name: &str, launch_command: &str) -> String {
    format!(
        "cd {} && printf '\\033]1;%s\\007' {} && {}",
        shell_words::quote(&work_dir.to_string_lossy()),
        shell_words::quote(name),
        launch_command
    )
}

#[async_trait]
impl Multiplexer for Iterm2Adapter {
    fn kind(&self) -> MuxKind {
        MuxKind::Iterm2
    }

    async fn create_pane(&self, spec: &PaneSpec) -> Result<PaneHandle, MuxError> {
        if let Ok(sessions) = self.list_sessions().await {
            if let Some(existing) = sessions.iter().find(|s| s.name == spec.name) {
                debug!("Attaching to existing iTerm2 session {}", existing.id);
                return Ok(PaneHandle::new(MuxKind::Iterm2, existing.id.clone()));
            }
        }

        let output = self
            .it2(args(["session", "split", "--vertical"]))
            .await?;
        let id = parse_split_output(&output.stdout).ok_or_else(|| {
            MuxError::Parse(format!("it2 split returned `{}`", output.stdout.trim()))
        })?;

        tokio::time::sleep(PANE_READY_DELAY).await;
        self.type_line(&id, &startup_line(&spec.work_dir, &spec.name, &spec.launch_command))
            .await?;

        info!("Created iTerm2 session {} for {}", id, spec.name);
        Ok(PaneHandle::new(MuxKind::Iterm2, id))
    }

    async fn pane_exists(&self, handle: &PaneHandle) -> Result<bool, MuxError> {
        let sessions = self.list_sessions().await?;
        Ok(sessions.iter().any(|s| s.id == handle.id))
    }

    async fn send_text(&self, handle: &PaneHandle, text: &str) -> Result<(), MuxError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim_end_matches('\n');
        if sanitized.is_empty() {
            return Ok(());
        }
        self.type_line(&handle.id, sanitized).await
    }

    async fn capture_output(&self, handle: &PaneHandle) -> Result<String, MuxError> {
        let output = command::run(
            "osascript",
            &args(["-e", contents_script(&handle.id).as_str()]),
            None,
            self.timeout,
        )
        .await?;
        if !output.success {
            return Err(MuxError::PaneNotFound(handle.id.clone()));
        }
        Ok(output.stdout)
    }

    async fn kill_pane(&self, handle: &PaneHandle) {
        if let Err(e) = self
            .it2(args([
                "session",
                "close",
                "--session",
                handle.id.as_str(),
                "--force",
            ]))
            .await
        {
            debug!("it2 close for {} failed: {}", handle.id, e);
        }
    }

    async fn focus_pane(&self, handle: &PaneHandle) -> Result<(), MuxError> {
        self.it2(args(["session", "focus", handle.id.as_str()]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_split_output() {
        assert_eq!(
            parse_split_output("Created new pane: w0t1p1:ABCD-1234\n").as_deref(),
            Some("w0t1p1:ABCD-1234")
        );
        assert_eq!(parse_split_output("ABCD\n").as_deref(), Some("ABCD"));
        assert_eq!(parse_split_output("   "), None);
    }

    #[test]
    fn test_unique_id_strips_location() {
        assert_eq!(unique_id("w0t0p0:ABCD-1234"), "ABCD-1234");
        assert_eq!(unique_id("ABCD-1234"), "ABCD-1234");
    }

    #[test]
    fn test_startup_line_quotes_work_dir() {
        let line = startup_line(Path::new("/Users/dev/my project"), "pb-gemini-00ff00ff", "gemini");
        assert!(line.starts_with("cd '/Users/dev/my project' && "));
        assert!(line.ends_with("&& gemini"));
    }

    #[test]
    fn test_send_args_keep_leading_dash_as_text() {
        let text = "-v flag means?\n\n$HOME `x` \"q\"";
        let argv = send_args("w0t0p1:ABCD", text);
        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(argv[sep + 1..].to_vec(), vec![text.to_string()]);
        assert!(argv[..sep].iter().all(|a| a != text));
        assert_eq!(argv.last().map(String::as_str), Some(text));
    }
}
