//! Hosted assistant definitions
//!
//! A backend is immutable once configuration is loaded. The bridge never
//! interprets the full-permission flag; it only appends it to the launch
//! command when asked to.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Name used on the command line and in state file names
    pub name: String,

    /// Command line that starts a fresh assistant
    pub command: String,

    /// Command line that continues the assistant's previous conversation
    #[serde(default)]
    pub resume_command: Option<String>,

    /// Command line that reopens one known conversation; `{id}` is replaced
    /// by the conversation id
    #[serde(default)]
    pub resume_id_command: Option<String>,

    /// Where the assistant writes its conversation logs. `~` is the home
    /// directory and `{project_hash}` the SHA-256 of the working directory.
    #[serde(default)]
    pub conversation_dir: Option<String>,

    /// Flag appended when elevated permissions are requested
    #[serde(default)]
    pub full_permission_flag: Option<String>,
}

/// Launch-time options for a backend process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    pub resume: bool,
    pub elevated: bool,
}

impl BackendConfig {
    /// The two assistants shipped in the default configuration
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                name: "codex".to_string(),
                command: "codex".to_string(),
                resume_command: Some("codex resume --last".to_string()),
                resume_id_command: Some("codex resume {id}".to_string()),
                conversation_dir: Some("~/.codex/sessions".to_string()),
                full_permission_flag: Some(
                    "--dangerously-bypass-approvals-and-sandbox".to_string(),
                ),
            },
            Self {
                name: "gemini".to_string(),
                command: "gemini".to_string(),
                resume_command: Some("gemini --resume latest".to_string()),
                resume_id_command: Some("gemini --resume {id}".to_string()),
                conversation_dir: Some("~/.gemini/tmp/{project_hash}/chats".to_string()),
                full_permission_flag: Some("--yolo".to_string()),
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Backend name must not be empty");
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "Backend name `{}` may only contain letters, digits, '-' and '_'",
                self.name
            );
        }
        if self.command.trim().is_empty() {
            anyhow::bail!("Backend `{}` has an empty command", self.name);
        }
        Ok(())
    }

    /// Command line for the requested launch mode
    pub fn launch_command(&self, options: LaunchOptions) -> String {
        self.launch_command_for(options, None)
    }

    /// Like `launch_command`, but a resume reopens `conversation` when the
    /// session is bound to one and the backend can address it by id
    pub fn launch_command_for(&self, options: LaunchOptions, conversation: Option<&str>) -> String {
        let by_id = match (&self.resume_id_command, conversation) {
            (Some(template), Some(id)) if options.resume => Some(template.replace("{id}", id)),
            _ => None,
        };
        let base = match (by_id, &self.resume_command, options.resume) {
            (Some(command), _, _) => command,
            (None, Some(resume), true) => resume.clone(),
            _ => self.command.clone(),
        };

        match (&self.full_permission_flag, options.elevated) {
            (Some(flag), true) => format!("{} {}", base, flag),
            _ => base,
        }
    }
}

/// Lookup table over configured backends
#[derive(Debug, Clone)]
pub struct BackendCatalog {
    backends: Vec<BackendConfig>,
}

impl BackendCatalog {
    pub fn new(backends: Vec<BackendConfig>) -> Self {
        Self { backends }
    }

    pub fn get(&self, name: &str) -> BridgeResult<&BackendConfig> {
        self.backends
            .iter()
            .find(|b| b.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| BridgeError::UnknownBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter()
    }
}

impl Default for BackendCatalog {
    fn default() -> Self {
        Self::new(BackendConfig::defaults())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codex() -> BackendConfig {
        BackendConfig::defaults().remove(0)
    }

    #[test]
    fn test_launch_command_variants() {
        let backend = codex();
        assert_eq!(backend.launch_command(LaunchOptions::default()), "codex");
        assert_eq!(
            backend.launch_command(LaunchOptions {
                resume: true,
                elevated: false
            }),
            "codex resume --last"
        );
        assert_eq!(
            backend.launch_command(LaunchOptions {
                resume: true,
                elevated: true
            }),
            "codex resume --last --dangerously-bypass-approvals-and-sandbox"
        );
    }

    #[test]
    fn test_resume_without_resume_command_uses_base() {
        let backend = BackendConfig {
            name: "plain".to_string(),
            command: "assistant".to_string(),
            resume_command: None,
            resume_id_command: None,
            conversation_dir: None,
            full_permission_flag: None,
        };
        let options = LaunchOptions {
            resume: true,
            elevated: true,
        };
        assert_eq!(backend.launch_command(options), "assistant");
    }

    #[test]
    fn test_resume_reopens_bound_conversation() {
        let backend = codex();
        let resume = LaunchOptions {
            resume: true,
            elevated: false,
        };
        let id = "019a2b3c-4d5e-6f70-8192-a3b4c5d6e7f8";

        assert_eq!(
            backend.launch_command_for(resume, Some(id)),
            format!("codex resume {}", id)
        );
        assert_eq!(backend.launch_command_for(resume, None), "codex resume --last");
        // A fresh start never reopens anything
        assert_eq!(backend.launch_command_for(LaunchOptions::default(), Some(id)), "codex");
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = BackendCatalog::default();
        assert_eq!(catalog.get("Gemini").unwrap().name, "gemini");
        assert!(matches!(
            catalog.get("claude"),
            Err(BridgeError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_validate_rejects_path_characters() {
        let mut backend = codex();
        backend.name = "../etc".to_string();
        assert!(backend.validate().is_err());
    }
}
