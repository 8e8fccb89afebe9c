//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for panebridge.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::mux::MuxKind;

#[derive(Parser, Debug, Clone)]
#[command(name = "panebridge")]
#[command(about = "Talk to assistants running in terminal panes")]
#[command(
    long_about = "Starts assistant CLIs inside tmux, WezTerm or iTerm2 panes, keeps track of them \
                  per working directory, and relays messages and replies without re-sending \
                  conversation context"
)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Working directory the sessions belong to (defaults to the current one)
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    /// Multiplexer to use for new panes (tmux, wezterm, iterm2)
    #[arg(long, global = true)]
    pub mux: Option<MuxKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start (or attach to) assistant sessions
    Up {
        /// Backends to start
        #[arg(required = true)]
        backends: Vec<String>,

        /// Reuse the recorded session, or launch the backend's resume command
        #[arg(short, long)]
        resume: bool,

        /// Launch with the backend's full-permission flag
        #[arg(long)]
        yolo: bool,
    },

    /// Send a message; returns the task id unless --wait is given
    Ask {
        backend: String,

        /// Block until the reply arrives and print it
        #[arg(short, long)]
        wait: bool,

        /// Reply timeout in seconds for --wait; 0 waits until the reply
        /// arrives
        #[arg(long)]
        timeout: Option<u64>,

        /// Message text; `-` or nothing reads standard input
        message: Vec<String>,
    },

    /// Print the latest reply without touching the pane
    Pend { backend: String },

    /// Check that the backend answers
    Ping { backend: String },

    /// List sessions of the working directory
    Status { backend: Option<String> },

    /// Terminate a backend's session
    Kill { backend: String },

    /// Bring back a recorded session, relaunching it with resume if needed
    Restore { backend: String },

    /// Show the detected environment
    Env,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Background watcher for an already-sent task
    #[command(hide = true)]
    Watch {
        backend: String,

        #[arg(long)]
        task_id: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Explicit --config-file, else the per-user default location
    pub fn config_path(&self) -> PathBuf {
        self.config_file.clone().unwrap_or_else(Config::default_path)
    }

    /// Adjust log level based on verbose flag
    pub fn effective_log_level(&self, config: &Config) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| config.log_level.clone())
        }
    }
}
