//! Configuration management module
//!
//! Handles loading, validation, and management of application configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::BackendConfig;
use crate::mux::MuxKind;

/// Bounds for the hex length of per-task marker entropy
pub const MIN_MARKER_ENTROPY: usize = 4;
pub const MAX_MARKER_ENTROPY: usize = 32;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Logging level
    pub log_level: String,

    /// Name of the per-working-directory state folder
    pub state_dir_name: String,

    /// File-based logging configuration
    pub log: LogConfig,

    /// Multiplexer selection and CLI tuning
    pub multiplexer: MultiplexerConfig,

    /// Dispatch timing and marker settings
    pub dispatch: DispatchConfig,

    /// Desktop notification settings
    pub notify: NotifyConfig,

    /// Hosted assistant definitions
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Path to the log file; empty disables file logging
    pub file_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Explicit multiplexer override, ranked below self-detection
    pub preferred: Option<MuxKind>,

    /// Timeout for a single multiplexer CLI call in milliseconds
    pub command_timeout_ms: u64,

    pub tmux_bin: String,

    /// WezTerm binary; discovered from PATH and install locations when unset
    pub wezterm_bin: Option<String>,

    /// `--class` passed to `wezterm cli`
    pub wezterm_class: Option<String>,

    /// Pass `--prefer-mux` to `wezterm cli`
    pub wezterm_prefer_mux: bool,

    pub it2_bin: String,

    /// Pause between pasting text and pressing Enter, in milliseconds
    pub enter_delay_ms: u64,

    /// Scrollback lines included in each capture
    pub capture_lines: usize,

    /// Size of newly split panes, in percent
    pub split_percent: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Synchronous wait before a task is declared timed out; 0 waits until
    /// the reply arrives
    pub reply_timeout_secs: u64,

    /// Deadline for a connectivity probe
    pub ping_timeout_secs: u64,

    /// How long a background watcher keeps polling after the reply timeout
    pub watch_max_secs: u64,

    /// First poll interval in milliseconds
    pub poll_initial_ms: u64,

    /// Poll interval cap in milliseconds
    pub poll_max_ms: u64,

    /// Hex characters of randomness in task identifiers and markers
    pub marker_entropy: usize,

    /// Delay before the single send retry
    pub send_retry_delay_ms: u64,

    /// Age after which an in-flight claim is considered abandoned
    pub inflight_stale_secs: u64,

    /// Hand a timed-out synchronous task to a background watcher
    pub continue_after_timeout: bool,

    /// Interval between "still waiting" reports of an unbounded wait
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Emit a desktop notification when a background reply arrives
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_dir_name: ".panebridge".to_string(),
            log: LogConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            dispatch: DispatchConfig::default(),
            notify: NotifyConfig::default(),
            backends: BackendConfig::defaults(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        let file_path = dirs::cache_dir()
            .map(|dir| dir.join("panebridge").join("panebridge.log"))
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { file_path }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            preferred: None,
            command_timeout_ms: 5000,
            tmux_bin: "tmux".to_string(),
            wezterm_bin: None,
            wezterm_class: None,
            wezterm_prefer_mux: false,
            it2_bin: "it2".to_string(),
            enter_delay_ms: 10,
            capture_lines: 2000,
            split_percent: 50,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: 60,
            ping_timeout_secs: 5,
            watch_max_secs: 3600,
            poll_initial_ms: 100,
            poll_max_ms: 2000,
            marker_entropy: 12,
            send_retry_delay_ms: 300,
            inflight_stale_secs: 3900,
            continue_after_timeout: true,
            progress_interval_ms: 30_000,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl MultiplexerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn enter_delay(&self) -> Duration {
        Duration::from_millis(self.enter_delay_ms)
    }
}

impl DispatchConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Budget of a synchronous wait; `None` when it has no deadline
    pub fn reply_deadline(&self) -> Option<Duration> {
        (self.reply_timeout_secs > 0).then(|| self.reply_timeout())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn watch_max(&self) -> Duration {
        Duration::from_secs(self.watch_max_secs)
    }

    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn inflight_stale(&self) -> Duration {
        Duration::from_secs(self.inflight_stale_secs)
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("panebridge")
            .join("config.toml")
    }

    /// Load configuration from file with environment variable overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        // Apply environment variable overrides
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if !path.as_ref().exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            return config;
        }

        Self::load_from_file(path).unwrap_or_else(|err| {
            tracing::warn!("Failed to load config: {}, using defaults", err);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Apply environment variable overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Apply overrides using `lookup` as the variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // PANEBRIDGE_LOG_LEVEL - logging level
        if let Some(log_level) = lookup("PANEBRIDGE_LOG_LEVEL") {
            self.log_level = log_level;
        }

        // PANEBRIDGE_LOG_FILE_PATH - logging destination file
        if let Some(file_path) = lookup("PANEBRIDGE_LOG_FILE_PATH") {
            self.log.file_path = file_path.trim().to_string();
        }

        // PANEBRIDGE_MUX - multiplexer override
        if let Some(mux) = lookup("PANEBRIDGE_MUX") {
            match mux.parse::<MuxKind>() {
                Ok(kind) => self.multiplexer.preferred = Some(kind),
                Err(e) => tracing::warn!("Ignoring PANEBRIDGE_MUX: {}", e),
            }
        }

        // Binary overrides, with the upstream variable names as fallback
        if let Some(bin) = lookup("PANEBRIDGE_TMUX_BIN") {
            self.multiplexer.tmux_bin = bin;
        }
        if let Some(bin) = lookup("PANEBRIDGE_WEZTERM_BIN").or_else(|| lookup("WEZTERM_BIN")) {
            if !bin.trim().is_empty() {
                self.multiplexer.wezterm_bin = Some(bin);
            }
        }
        if let Some(class) = lookup("PANEBRIDGE_WEZTERM_CLASS").or_else(|| lookup("WEZTERM_CLASS"))
        {
            if !class.trim().is_empty() {
                self.multiplexer.wezterm_class = Some(class);
            }
        }
        if let Some(bin) = lookup("PANEBRIDGE_IT2_BIN").or_else(|| lookup("IT2_BIN")) {
            if !bin.trim().is_empty() {
                self.multiplexer.it2_bin = bin;
            }
        }

        // PANEBRIDGE_ENTER_DELAY_MS - delay before Enter
        if let Some(delay) = lookup("PANEBRIDGE_ENTER_DELAY_MS") {
            if let Ok(value) = delay.parse::<u64>() {
                self.multiplexer.enter_delay_ms = value;
            }
        }

        // PANEBRIDGE_REPLY_TIMEOUT_SECS - synchronous reply timeout
        if let Some(timeout) = lookup("PANEBRIDGE_REPLY_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.dispatch.reply_timeout_secs = value;
            }
        }

        // PANEBRIDGE_PING_TIMEOUT_SECS - probe timeout
        if let Some(timeout) = lookup("PANEBRIDGE_PING_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse::<u64>() {
                self.dispatch.ping_timeout_secs = value;
            }
        }

        // PANEBRIDGE_POLL_MAX_MS - poll interval cap
        if let Some(interval) = lookup("PANEBRIDGE_POLL_MAX_MS") {
            if let Ok(value) = interval.parse::<u64>() {
                self.dispatch.poll_max_ms = value;
            }
        }

        // PANEBRIDGE_MARKER_ENTROPY - marker randomness
        if let Some(entropy) = lookup("PANEBRIDGE_MARKER_ENTROPY") {
            if let Ok(value) = entropy.parse::<usize>() {
                self.dispatch.marker_entropy = value;
            }
        }

        // CODEX_SESSION_ROOT - where codex keeps its conversation logs
        if let Some(root) = lookup("CODEX_SESSION_ROOT") {
            if !root.trim().is_empty() {
                if let Some(codex) = self.backends.iter_mut().find(|b| b.name == "codex") {
                    codex.conversation_dir = Some(root);
                }
            }
        }

        // PANEBRIDGE_NOTIFY - desktop notifications
        if let Some(enabled) = lookup("PANEBRIDGE_NOTIFY") {
            self.notify.enabled = enabled.parse().unwrap_or(self.notify.enabled);
        }
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.state_dir_name.trim().is_empty() {
            anyhow::bail!("state_dir_name must not be empty");
        }

        if self.multiplexer.command_timeout_ms == 0 {
            anyhow::bail!("multiplexer.command_timeout_ms must be greater than 0");
        }

        if self.multiplexer.split_percent == 0 || self.multiplexer.split_percent >= 100 {
            anyhow::bail!("multiplexer.split_percent must be between 1 and 99");
        }

        if self.dispatch.ping_timeout_secs == 0 {
            anyhow::bail!("dispatch.ping_timeout_secs must be greater than 0");
        }

        if self.dispatch.progress_interval_ms == 0 {
            anyhow::bail!("dispatch.progress_interval_ms must be greater than 0");
        }

        if self.dispatch.poll_initial_ms == 0 {
            anyhow::bail!("dispatch.poll_initial_ms must be greater than 0");
        }

        if self.dispatch.poll_max_ms < self.dispatch.poll_initial_ms {
            anyhow::bail!("dispatch.poll_max_ms must not be below dispatch.poll_initial_ms");
        }

        if !(MIN_MARKER_ENTROPY..=MAX_MARKER_ENTROPY).contains(&self.dispatch.marker_entropy) {
            anyhow::bail!(
                "dispatch.marker_entropy must be between {} and {}",
                MIN_MARKER_ENTROPY,
                MAX_MARKER_ENTROPY
            );
        }

        if self.backends.is_empty() {
            anyhow::bail!("At least one backend must be configured");
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !seen.insert(backend.name.as_str()) {
                anyhow::bail!("Duplicate backend name: {}", backend.name);
            }
        }

        Ok(())
    }

    /// Display formatted configuration
    pub fn display(&self) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        println!("{}", content);
        Ok(())
    }

    /// Display configuration management help
    pub fn display_help() -> Result<()> {
        println!("Configuration management commands:");
        println!("  panebridge config show    - Show current configuration");
        println!("  panebridge config init    - Write the default configuration file");
        println!("  panebridge config reset   - Overwrite the file with the defaults");
        Ok(())
    }

    /// Handle configuration command
    pub fn handle_command(action: &Option<crate::cli::ConfigAction>, path: &Path) -> Result<()> {
        match action {
            Some(crate::cli::ConfigAction::Show) => {
                println!("# Configuration from {}", path.display());
                let config = Config::load_or_default(path);
                config.display()?;
            }
            Some(crate::cli::ConfigAction::Init { force }) => {
                if path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        path.display()
                    );
                }
                Config::default().save_to_file(path)?;
                println!("Wrote default configuration to {}", path.display());
            }
            Some(crate::cli::ConfigAction::Reset) => {
                Config::default().save_to_file(path)?;
                println!("Reset {} to the default configuration", path.display());
            }
            None => {
                Config::display_help()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        let names: Vec<_> = config.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["codex", "gemini"]);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config.backends.len(), deserialized.backends.len());
        assert_eq!(
            config.dispatch.reply_timeout_secs,
            deserialized.dispatch.reply_timeout_secs
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[dispatch]\nreply_timeout_secs = 5\n").unwrap();
        assert_eq!(config.dispatch.reply_timeout_secs, 5);
        assert_eq!(config.dispatch.marker_entropy, 12);
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        // Test save
        config.save_to_file(temp_file.path()).unwrap();

        // Test load
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.state_dir_name, loaded_config.state_dir_name);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PANEBRIDGE_MUX", "tmux"),
            ("WEZTERM_BIN", "/opt/wezterm"),
            ("PANEBRIDGE_REPLY_TIMEOUT_SECS", "7"),
            ("PANEBRIDGE_MARKER_ENTROPY", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.multiplexer.preferred, Some(MuxKind::Tmux));
        assert_eq!(config.multiplexer.wezterm_bin.as_deref(), Some("/opt/wezterm"));
        assert_eq!(config.dispatch.reply_timeout_secs, 7);
        assert_eq!(config.dispatch.marker_entropy, 12);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.dispatch.marker_entropy = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.backends.push(config.backends[0].clone());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatch.poll_max_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dispatch.ping_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_reply_timeout_means_no_deadline() {
        let mut config = Config::default();
        assert_eq!(config.dispatch.ping_timeout_secs, 5);
        assert_eq!(config.dispatch.reply_deadline(), Some(Duration::from_secs(60)));

        config.dispatch.reply_timeout_secs = 0;
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.reply_deadline(), None);
    }

    #[test]
    fn test_reset_rewrites_file_with_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("panebridge").join("config.toml");

        let mut edited = Config::default();
        edited.state_dir_name = ".elsewhere".to_string();
        edited.dispatch.reply_timeout_secs = 9;
        edited.backends.truncate(1);
        edited.save_to_file(&path).unwrap();

        Config::handle_command(&Some(crate::cli::ConfigAction::Reset), &path).unwrap();

        let reset = Config::load_from_file(&path).unwrap();
        assert_eq!(reset.state_dir_name, ".panebridge");
        assert_eq!(reset.dispatch.reply_timeout_secs, 60);
        assert_eq!(reset.backends, BackendConfig::defaults());
    }

    #[test]
    fn test_codex_session_root_override() {
        let mut config = Config::default();
        config.apply_overrides_from(|key| {
            (key == "CODEX_SESSION_ROOT").then(|| "/srv/codex-logs".to_string())
        });
        let codex = config.backends.iter().find(|b| b.name == "codex").unwrap();
        assert_eq!(codex.conversation_dir.as_deref(), Some("/srv/codex-logs"));
    }
}
