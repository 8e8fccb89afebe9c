//! Terminal-emulator CLI adapter (`wezterm cli` pane model)

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::command::{self, CommandOutput};
use super::{MuxError, MuxKind, Multiplexer, PaneHandle, PaneSpec};
use crate::config::MultiplexerConfig;
use crate::environment::{EnvironmentFacts, ShellSpec};

/// Subset of `wezterm cli list --format json` we rely on
#[derive(Debug, Deserialize)]
struct WeztermPane {
    pane_id: u64,
    #[serde(default)]
    title: String,
}

pub struct WeztermAdapter {
    bin: String,
    class: Option<String>,
    prefer_mux: bool,
    timeout: Duration,
    enter_delay: Duration,
    capture_lines: usize,
    split_percent: u8,
    shell: ShellSpec,
    /// Windows WezTerm driven from WSL: panes start through `wsl.exe`
    wsl_launch: bool,
    in_wsl_pane: bool,
}

impl WeztermAdapter {
    pub fn new(config: &MultiplexerConfig, facts: &EnvironmentFacts) -> Self {
        Self {
            bin: facts
                .wezterm_bin
                .clone()
                .or_else(|| config.wezterm_bin.clone())
                .unwrap_or_else(|| "wezterm".to_string()),
            class: config.wezterm_class.clone(),
            prefer_mux: config.wezterm_prefer_mux,
            timeout: config.command_timeout(),
            enter_delay: config.enter_delay(),
            capture_lines: config.capture_lines,
            split_percent: config.split_percent,
            shell: facts.shell.clone(),
            wsl_launch: facts.wezterm_windows_exe,
            in_wsl_pane: facts.in_wsl_pane,
        }
    }

    fn cli_args(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = vec!["cli".to_string()];
        if let Some(class) = &self.class {
            argv.push("--class".to_string());
            argv.push(class.clone());
        }
        if self.prefer_mux {
            argv.push("--prefer-mux".to_string());
        }
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }

    async fn cli(&self, tail: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput, MuxError> {
        command::run(&self.bin, &self.cli_args(tail), stdin, self.timeout)
            .await?
            .check(&self.bin)
    }

    async fn list_panes(&self) -> Result<Vec<WeztermPane>, MuxError> {
        let output = self.cli(&["list", "--format", "json"], None).await?;
        serde_json::from_str(&output.stdout)
            .map_err(|e| MuxError::Parse(format!("wezterm pane list: {}", e)))
    }

    fn split_args(&self, spec: &PaneSpec) -> Vec<String> {
        let percent = self.split_percent.to_string();
        let mut tail: Vec<String> = ["split-pane", "--right", "--percent", percent.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let command_line = format!("{}exec {}", title_escape(&spec.name), spec.launch_command);

        if self.wsl_launch {
            let cwd = to_wsl_path(&spec.work_dir.to_string_lossy());
            let script = format!("cd {} && {}", shell_words::quote(&cwd), command_line);
            tail.push("--".to_string());
            if !self.in_wsl_pane {
                tail.push("wsl.exe".to_string());
            }
            tail.extend(["bash", "-l", "-i", "-c"].iter().map(|s| s.to_string()));
            tail.push(script);
        } else {
            tail.push("--cwd".to_string());
            tail.push(spec.work_dir.to_string_lossy().into_owned());
            tail.push("--".to_string());
            tail.push(self.shell.program.clone());
            tail.push(self.shell.flag.clone());
            if self.shell.flag == "-c" {
                tail.push(command_line);
            } else {
                tail.push(spec.launch_command.clone());
            }
        }

        let refs: Vec<&str> = tail.iter().map(String::as_str).collect();
        self.cli_args(&refs)
    }
}

/// OSC 2 title sequence so the pane can be found again by name
fn title_escape(name: &str) -> String {
    format!("printf '\\033]2;%s\\033\\\\' {}; ", shell_words::quote(name))
}

/// Translate Windows-side paths into their WSL equivalents
pub fn to_wsl_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let lower = normalized.to_lowercase();

    for prefix in ["//wsl.localhost/", "//wsl$/"] {
        if lower.starts_with(prefix) {
            let rest = &normalized[prefix.len()..];
            // Drop the distro component
            return match rest.find('/') {
                Some(idx) => rest[idx..].to_string(),
                None => "/".to_string(),
            };
        }
    }

    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = normalized[2..].trim_start_matches('/');
        return format!("/mnt/{}/{}", drive, rest).trim_end_matches('/').to_string();
    }

    normalized
}

#[async_trait]
impl Multiplexer for WeztermAdapter {
    fn kind(&self) -> MuxKind {
        MuxKind::Wezterm
    }

    async fn create_pane(&self, spec: &PaneSpec) -> Result<PaneHandle, MuxError> {
        if let Ok(panes) = self.list_panes().await {
            if let Some(pane) = panes.iter().find(|p| p.title == spec.name) {
                debug!("Attaching to existing WezTerm pane {}", pane.pane_id);
                return Ok(PaneHandle::new(MuxKind::Wezterm, pane.pane_id.to_string()));
            }
        }

        let argv = self.split_args(spec);
        let output = command::run(&self.bin, &argv, None, self.timeout)
            .await?
            .check(&self.bin)?;

        let pane_id = output.stdout.trim().to_string();
        if pane_id.is_empty() || pane_id.parse::<u64>().is_err() {
            return Err(MuxError::Parse(format!(
                "split-pane returned `{}`",
                output.stdout.trim()
            )));
        }

        info!("Created WezTerm pane {} for {}", pane_id, spec.name);
        Ok(PaneHandle::new(MuxKind::Wezterm, pane_id))
    }

    async fn pane_exists(&self, handle: &PaneHandle) -> Result<bool, MuxError> {
        let panes = self.list_panes().await?;
        Ok(panes.iter().any(|p| p.pane_id.to_string() == handle.id))
    }

    async fn send_text(&self, handle: &PaneHandle, text: &str) -> Result<(), MuxError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim_end_matches('\n');
        if sanitized.is_empty() {
            return Ok(());
        }

        // Text travels on stdin; multi-line input goes as a bracketed paste so
        // embedded newlines do not submit early.
        let pane = handle.id.as_str();
        if sanitized.contains('\n') {
            self.cli(&["send-text", "--pane-id", pane], Some(sanitized.as_bytes()))
                .await?;
        } else {
            self.cli(
                &["send-text", "--pane-id", pane, "--no-paste"],
                Some(sanitized.as_bytes()),
            )
            .await?;
        }

        if !self.enter_delay.is_zero() {
            tokio::time::sleep(self.enter_delay).await;
        }

        self.cli(&["send-text", "--pane-id", pane, "--no-paste"], Some(b"\r"))
            .await?;
        Ok(())
    }

    async fn capture_output(&self, handle: &PaneHandle) -> Result<String, MuxError> {
        let start = format!("-{}", self.capture_lines);
        let output = self
            .cli(
                &[
                    "get-text",
                    "--pane-id",
                    handle.id.as_str(),
                    "--start-line",
                    start.as_str(),
                ],
                None,
            )
            .await
            .map_err(|e| match e {
                MuxError::CommandFailed { .. } => MuxError::PaneNotFound(handle.id.clone()),
                other => other,
            })?;
        Ok(output.stdout)
    }

    async fn kill_pane(&self, handle: &PaneHandle) {
        if let Err(e) = self
            .cli(&["kill-pane", "--pane-id", handle.id.as_str()], None)
            .await
        {
            debug!("kill-pane for {} failed: {}", handle.id, e);
        }
    }

    async fn focus_pane(&self, handle: &PaneHandle) -> Result<(), MuxError> {
        self.cli(&["activate-pane", "--pane-id", handle.id.as_str()], None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Platform;
    use std::path::PathBuf;

    fn facts(wsl_launch: bool) -> EnvironmentFacts {
        EnvironmentFacts {
            platform: if wsl_launch {
                Platform::Wsl
            } else {
                Platform::Posix
            },
            is_wsl: wsl_launch,
            self_detected: None,
            available: vec![MuxKind::Wezterm],
            shell: ShellSpec::posix(),
            wezterm_bin: Some("/usr/bin/wezterm".to_string()),
            wezterm_windows_exe: wsl_launch,
            in_wsl_pane: false,
        }
    }

    fn spec() -> PaneSpec {
        PaneSpec {
            name: "pb-codex-1234abcd".to_string(),
            work_dir: PathBuf::from("/home/dev/project"),
            launch_command: "codex".to_string(),
        }
    }

    #[test]
    fn test_wsl_path_translation() {
        assert_eq!(
            to_wsl_path(r"\\wsl.localhost\Ubuntu\home\dev\project"),
            "/home/dev/project"
        );
        assert_eq!(to_wsl_path(r"\\wsl$\Debian\srv"), "/srv");
        assert_eq!(to_wsl_path(r"C:\Users\dev\code"), "/mnt/c/Users/dev/code");
        assert_eq!(to_wsl_path("/home/dev"), "/home/dev");
    }

    #[test]
    fn test_split_args_native() {
        let mut config = MultiplexerConfig::default();
        config.wezterm_class = Some("bridge".to_string());
        let adapter = WeztermAdapter::new(&config, &facts(false));
        let argv = adapter.split_args(&spec());

        assert_eq!(&argv[..3], &["cli", "--class", "bridge"]);
        assert!(argv.contains(&"--cwd".to_string()));
        assert!(argv.contains(&"/home/dev/project".to_string()));
        let last = argv.last().unwrap();
        assert!(last.ends_with("exec codex"));
        assert!(last.contains("pb-codex-1234abcd"));
    }

    #[test]
    fn test_split_args_through_wsl() {
        let adapter = WeztermAdapter::new(&MultiplexerConfig::default(), &facts(true));
        let argv = adapter.split_args(&spec());

        assert!(argv.contains(&"wsl.exe".to_string()));
        assert!(!argv.contains(&"--cwd".to_string()));
        assert!(argv.last().unwrap().starts_with("cd /home/dev/project && "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_text_travels_on_stdin() {
        use crate::mux::recorder::RecordingBin;

        let bin = RecordingBin::new();
        let mut facts = facts(false);
        facts.wezterm_bin = Some(bin.program());
        let config = MultiplexerConfig {
            enter_delay_ms: 0,
            ..MultiplexerConfig::default()
        };
        let adapter = WeztermAdapter::new(&config, &facts);
        let pane = PaneHandle::new(MuxKind::Wezterm, "42".to_string());

        let multi = "--pane-id 7\n  \"$HOME\" `id` 'q'";
        tokio_test::assert_ok!(adapter.send_text(&pane, &format!("{}\r\n", multi)).await);
        let single = "-n $PATH";
        tokio_test::assert_ok!(adapter.send_text(&pane, single).await);

        let calls = bin.calls();
        assert_eq!(calls.len(), 4, "calls: {:?}", calls);
        assert_eq!(calls[0], ["cli", "send-text", "--pane-id", "42"]);
        assert_eq!(calls[1], ["cli", "send-text", "--pane-id", "42", "--no-paste"]);
        assert_eq!(calls[2], ["cli", "send-text", "--pane-id", "42", "--no-paste"]);
        assert_eq!(bin.stdin(0), multi.as_bytes());
        assert_eq!(bin.stdin(1), b"\r");
        assert_eq!(bin.stdin(2), single.as_bytes());
        assert_eq!(bin.stdin(3), b"\r");
    }
}
