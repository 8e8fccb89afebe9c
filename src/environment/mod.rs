//! Host classification and multiplexer discovery
//!
//! `HostSnapshot::capture` does all the I/O; `detect` is a pure function of
//! the snapshot so rankings can be asserted from fixed inputs.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::config::MultiplexerConfig;
use crate::mux::MuxKind;

/// Environment variables consulted during detection
const ENV_KEYS: [&str; 5] = [
    "WEZTERM_PANE",
    "ITERM_SESSION_ID",
    "TMUX",
    "WSL_DISTRO_NAME",
    "WSL_INTEROP",
];

/// Host operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Posix,
    Wsl,
    Windows,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Posix => "posix",
            Platform::Wsl => "wsl",
            Platform::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Shell used to interpret a backend's launch command inside a new pane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellSpec {
    pub program: String,
    pub flag: String,
}

impl ShellSpec {
    pub fn posix() -> Self {
        Self {
            program: "bash".to_string(),
            flag: "-c".to_string(),
        }
    }
}

/// Raw host observations
#[derive(Debug, Clone, Default)]
pub struct HostSnapshot {
    pub windows: bool,
    pub proc_version: Option<String>,
    pub env: HashMap<String, String>,
    /// Resolved binary per multiplexer kind, when found
    pub binaries: HashMap<MuxKind, String>,
    pub pwsh_available: bool,
}

/// Derived facts consumed by the rest of the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentFacts {
    pub platform: Platform,
    pub is_wsl: bool,
    /// Multiplexer the calling process is running inside, if any
    pub self_detected: Option<MuxKind>,
    /// Ranked, highest preference first
    pub available: Vec<MuxKind>,
    pub shell: ShellSpec,
    pub wezterm_bin: Option<String>,
    /// WezTerm is the Windows build driven from inside WSL
    pub wezterm_windows_exe: bool,
    /// The caller itself runs in a WSL shell
    pub in_wsl_pane: bool,
}

impl EnvironmentFacts {
    /// Highest ranked multiplexer
    pub fn preferred(&self) -> Option<MuxKind> {
        self.available.first().copied()
    }
}

impl HostSnapshot {
    /// Observe the current host
    pub fn capture(config: &MultiplexerConfig) -> Self {
        let env = ENV_KEYS
            .iter()
            .filter_map(|key| {
                std::env::var(key)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(|v| (key.to_string(), v))
            })
            .collect();

        let proc_version = std::fs::read_to_string("/proc/version").ok();
        let is_wsl = proc_version
            .as_deref()
            .is_some_and(|v| v.to_lowercase().contains("microsoft"));

        let mut binaries = HashMap::new();
        if let Some(path) = resolve_wezterm_bin(config.wezterm_bin.as_deref(), is_wsl) {
            binaries.insert(MuxKind::Wezterm, path);
        }
        if let Some(path) = resolve_bin(&config.it2_bin) {
            binaries.insert(MuxKind::Iterm2, path);
        }
        if let Some(path) = resolve_bin(&config.tmux_bin).or_else(|| resolve_bin("tmux.exe")) {
            binaries.insert(MuxKind::Tmux, path);
        }

        let snapshot = Self {
            windows: cfg!(windows),
            proc_version,
            env,
            binaries,
            pwsh_available: which::which("pwsh").is_ok(),
        };
        debug!("Captured host snapshot: {:?}", snapshot);
        snapshot
    }

    fn has_env(&self, key: &str) -> bool {
        self.env.get(key).is_some_and(|v| !v.is_empty())
    }
}

/// Classify the host and rank the usable multiplexers.
///
/// Ranking: the multiplexer the caller runs inside, then the explicit
/// override, then every resolved binary in `MuxKind::PREFERENCE` order.
pub fn detect(snapshot: &HostSnapshot, override_kind: Option<MuxKind>) -> EnvironmentFacts {
    let is_wsl = snapshot
        .proc_version
        .as_deref()
        .is_some_and(|v| v.to_lowercase().contains("microsoft"));

    let platform = if snapshot.windows {
        Platform::Windows
    } else if is_wsl {
        Platform::Wsl
    } else {
        Platform::Posix
    };

    let self_detected = if snapshot.has_env("WEZTERM_PANE") {
        Some(MuxKind::Wezterm)
    } else if snapshot.has_env("ITERM_SESSION_ID") {
        Some(MuxKind::Iterm2)
    } else if snapshot.has_env("TMUX") {
        Some(MuxKind::Tmux)
    } else {
        None
    };

    let mut available = Vec::new();
    let mut push = |kind: MuxKind| {
        if !available.contains(&kind) {
            available.push(kind);
        }
    };
    if let Some(kind) = self_detected {
        push(kind);
    }
    if let Some(kind) = override_kind {
        push(kind);
    }
    for kind in MuxKind::PREFERENCE {
        if snapshot.binaries.contains_key(&kind) {
            push(kind);
        }
    }

    let shell = match platform {
        Platform::Windows => ShellSpec {
            program: if snapshot.pwsh_available {
                "pwsh".to_string()
            } else {
                "powershell".to_string()
            },
            flag: "-Command".to_string(),
        },
        Platform::Posix | Platform::Wsl => ShellSpec::posix(),
    };

    let wezterm_bin = snapshot.binaries.get(&MuxKind::Wezterm).cloned();
    let wezterm_windows_exe = is_wsl
        && wezterm_bin
            .as_deref()
            .is_some_and(|bin| bin.to_lowercase().ends_with(".exe") || bin.starts_with("/mnt/"));

    EnvironmentFacts {
        platform,
        is_wsl,
        self_detected,
        available,
        shell,
        wezterm_bin,
        wezterm_windows_exe,
        in_wsl_pane: snapshot.has_env("WSL_DISTRO_NAME") || snapshot.has_env("WSL_INTEROP"),
    }
}

fn resolve_bin(name: &str) -> Option<String> {
    which::which(name)
        .ok()
        .map(|path| path.to_string_lossy().into_owned())
}

/// Configured path, then PATH, then the default Windows install locations
/// visible from WSL.
fn resolve_wezterm_bin(configured: Option<&str>, is_wsl: bool) -> Option<String> {
    if let Some(path) = configured {
        if Path::new(path).exists() {
            return Some(path.to_string());
        }
        if let Some(found) = resolve_bin(path) {
            return Some(found);
        }
    }

    if let Some(found) = resolve_bin("wezterm").or_else(|| resolve_bin("wezterm.exe")) {
        return Some(found);
    }

    if is_wsl {
        for drive in 'c'..='z' {
            for dir in ["Program Files", "Program Files (x86)"] {
                let candidate = format!("/mnt/{}/{}/WezTerm/wezterm.exe", drive, dir);
                if Path::new(&candidate).exists() {
                    return Some(candidate);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(env: &[(&str, &str)], binaries: &[MuxKind]) -> HostSnapshot {
        HostSnapshot {
            windows: false,
            proc_version: Some("Linux version 6.1.0".to_string()),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            binaries: binaries
                .iter()
                .map(|kind| (*kind, format!("/usr/bin/{}", kind)))
                .collect(),
            pwsh_available: false,
        }
    }

    #[test]
    fn test_self_detection_ranks_first() {
        let host = snapshot(
            &[("TMUX", "/tmp/tmux-1000/default,123,0")],
            &[MuxKind::Tmux, MuxKind::Wezterm],
        );
        let facts = detect(&host, Some(MuxKind::Wezterm));
        assert_eq!(facts.self_detected, Some(MuxKind::Tmux));
        assert_eq!(facts.available, vec![MuxKind::Tmux, MuxKind::Wezterm]);
    }

    #[test]
    fn test_override_ranks_above_preference_order() {
        let host = snapshot(&[], &[MuxKind::Tmux, MuxKind::Wezterm, MuxKind::Iterm2]);
        let facts = detect(&host, Some(MuxKind::Tmux));
        assert_eq!(
            facts.available,
            vec![MuxKind::Tmux, MuxKind::Wezterm, MuxKind::Iterm2]
        );
    }

    #[test]
    fn test_preference_order_without_override() {
        let host = snapshot(&[], &[MuxKind::Tmux, MuxKind::Iterm2, MuxKind::Wezterm]);
        let facts = detect(&host, None);
        assert_eq!(
            facts.available,
            vec![MuxKind::Wezterm, MuxKind::Iterm2, MuxKind::Tmux]
        );
        assert_eq!(facts.preferred(), Some(MuxKind::Wezterm));
    }

    #[test]
    fn test_nothing_available() {
        let facts = detect(&snapshot(&[], &[]), None);
        assert!(facts.available.is_empty());
        assert_eq!(facts.preferred(), None);
    }

    #[test]
    fn test_empty_marker_is_ignored() {
        let host = snapshot(&[("WEZTERM_PANE", "")], &[MuxKind::Tmux]);
        let facts = detect(&host, None);
        assert_eq!(facts.self_detected, None);
    }

    #[test]
    fn test_wsl_with_windows_wezterm() {
        let mut host = snapshot(&[("WSL_DISTRO_NAME", "Ubuntu")], &[]);
        host.proc_version = Some("Linux version 5.15 microsoft-standard-WSL2".to_string());
        host.binaries.insert(
            MuxKind::Wezterm,
            "/mnt/c/Program Files/WezTerm/wezterm.exe".to_string(),
        );
        let facts = detect(&host, None);
        assert_eq!(facts.platform, Platform::Wsl);
        assert!(facts.is_wsl);
        assert!(facts.wezterm_windows_exe);
        assert!(facts.in_wsl_pane);
        assert_eq!(facts.shell, ShellSpec::posix());
    }

    #[test]
    fn test_windows_shell_selection() {
        let mut host = snapshot(&[], &[MuxKind::Wezterm]);
        host.windows = true;
        host.proc_version = None;
        host.pwsh_available = true;
        let facts = detect(&host, None);
        assert_eq!(facts.platform, Platform::Windows);
        assert_eq!(facts.shell.program, "pwsh");
        assert_eq!(facts.shell.flag, "-Command");
    }

    #[test]
    fn test_detect_is_deterministic() {
        let host = snapshot(&[("ITERM_SESSION_ID", "w0t0p0:ABC")], &[MuxKind::Tmux]);
        assert_eq!(detect(&host, None), detect(&host, None));
    }
}
