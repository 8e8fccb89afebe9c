//! Command execution
//!
//! Wires configuration, environment detection, the registry and the
//! dispatcher together for one CLI invocation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::{BackendCatalog, LaunchOptions};
use crate::cache::FileReplyCache;
use crate::cli::{Cli, Commands};
use crate::config::{Config, DispatchConfig};
use crate::dispatch::{Continuation, DispatchEvent, Dispatcher, EventChannel};
use crate::environment::{self, EnvironmentFacts, HostSnapshot};
use crate::error::BridgeError;
use crate::mux::AdapterSet;
use crate::notify::{CompletionNotifier, NoopNotifier, SystemNotifier};
use crate::probe::ConnectivityProber;
use crate::session::{FileSessionStore, SessionRegistry};
use crate::ui::cli as display;

/// Process exit status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    /// Reply did not arrive in time
    Timeout,
    /// `pend` found nothing cached
    Empty,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::Timeout => 2,
            ExitStatus::Empty => 3,
        }
    }
}

pub struct App {
    cli: Cli,
    config: Config,
    work_dir: PathBuf,
    facts: EnvironmentFacts,
    notifier: Arc<dyn CompletionNotifier>,
    dispatcher: Dispatcher,
}

impl App {
    pub fn new(cli: Cli, config: Config) -> Result<Self> {
        let work_dir = match &cli.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("Failed to read current directory")?,
        };
        let work_dir = SessionRegistry::normalize_work_dir(&work_dir);

        let snapshot = HostSnapshot::capture(&config.multiplexer);
        let facts = environment::detect(&snapshot, cli.mux.or(config.multiplexer.preferred));
        debug!("Environment facts: {:?}", facts);

        let adapters = AdapterSet::from_facts(&facts, &config.multiplexer);
        let registry = SessionRegistry::new(
            adapters,
            Arc::new(FileSessionStore::new(config.state_dir_name.clone())),
            BackendCatalog::new(config.backends.clone()),
        );

        let notifier: Arc<dyn CompletionNotifier> = if config.notify.enabled {
            Arc::new(SystemNotifier::new(env!("CARGO_PKG_NAME")))
        } else {
            Arc::new(NoopNotifier)
        };

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(FileReplyCache::new(config.state_dir_name.clone())),
            notifier.clone(),
            config.dispatch.clone(),
        )
        .with_continuation(Continuation::Handoff);

        Ok(Self {
            cli,
            config,
            work_dir,
            facts,
            notifier,
            dispatcher,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub async fn run(&self) -> Result<ExitStatus> {
        let registry = self.dispatcher.registry();

        match &self.cli.command {
            Commands::Up {
                backends,
                resume,
                yolo,
            } => {
                let options = LaunchOptions {
                    resume: *resume,
                    elevated: *yolo,
                };
                let mut status = ExitStatus::Success;
                for backend in backends {
                    match registry.start(backend, &self.work_dir, options).await {
                        Ok(session) => display::display_session_started(&session)?,
                        Err(e) => {
                            display::display_error(&e.to_string());
                            status = ExitStatus::Failure;
                        }
                    }
                }
                Ok(status)
            }

            Commands::Ask {
                backend,
                wait,
                timeout,
                message,
            } => {
                let text = message_text(message, std::io::stdin())?;
                if *wait {
                    self.ask_and_wait(backend, &text, *timeout).await
                } else {
                    self.ask_detached(backend, &text).await
                }
            }

            Commands::Pend { backend } => {
                let reply = self.dispatcher.pending(backend, &self.work_dir)?;
                display::display_pending(backend, reply.as_ref())?;
                Ok(if reply.is_some() {
                    ExitStatus::Success
                } else {
                    ExitStatus::Empty
                })
            }

            Commands::Ping { backend } => {
                let prober = ConnectivityProber::new(self.dispatcher.clone());
                match prober.ping(backend, &self.work_dir).await {
                    Ok(outcome) => {
                        display::display_ping(backend, &outcome)?;
                        Ok(if outcome.is_alive() {
                            ExitStatus::Success
                        } else {
                            ExitStatus::Failure
                        })
                    }
                    Err(e @ BridgeError::EnvironmentMismatch { .. }) => {
                        display::display_error(&e.to_string());
                        Ok(ExitStatus::Failure)
                    }
                    Err(e) => Err(e.into()),
                }
            }

            Commands::Status { backend } => {
                let rows = registry.list(&self.work_dir, backend.as_deref()).await?;
                display::display_status(&self.work_dir, &rows)?;
                Ok(ExitStatus::Success)
            }

            Commands::Kill { backend } => {
                let existed = registry.kill(backend, &self.work_dir).await?;
                display::display_killed(backend, existed)?;
                Ok(ExitStatus::Success)
            }

            Commands::Restore { backend } => {
                let session = registry.restore(backend, &self.work_dir).await?;
                display::display_session_started(&session)?;
                Ok(ExitStatus::Success)
            }

            Commands::Env => {
                display::display_environment(&self.facts)?;
                Ok(ExitStatus::Success)
            }

            Commands::Config { action } => {
                Config::handle_command(action, &self.cli.config_path())?;
                Ok(ExitStatus::Success)
            }

            Commands::Watch { backend, task_id } => {
                let result = self.dispatcher.watch(backend, &self.work_dir, task_id).await;
                self.notifier.flush();
                match result? {
                    Some(_) => Ok(ExitStatus::Success),
                    None => Ok(ExitStatus::Timeout),
                }
            }
        }
    }

    async fn ask_and_wait(&self, backend: &str, text: &str, timeout: Option<u64>) -> Result<ExitStatus> {
        let dispatch = wait_config(&self.config.dispatch, timeout);
        let unbounded = dispatch.reply_deadline().is_none();
        let mut dispatcher = self.dispatcher.clone().with_config(dispatch);

        let progress = unbounded.then(|| {
            let mut events = EventChannel::new();
            dispatcher = dispatcher.clone().with_events(events.clone());
            tokio::spawn(async move {
                while let Some(event) = events.next_event().await {
                    if let DispatchEvent::StillWaiting { elapsed, .. } = event {
                        display::display_still_waiting(elapsed);
                    }
                }
            })
        });

        let result = dispatcher.send_sync(backend, &self.work_dir, text).await;
        if let Some(printer) = progress {
            printer.abort();
        }

        match result {
            Ok(reply) => {
                display::display_reply(&reply)?;
                Ok(ExitStatus::Success)
            }
            Err(BridgeError::ReplyTimeout {
                backend,
                task_id,
                timeout,
            }) => {
                display::display_error(&format!(
                    "no reply from {} within {}s (task {})",
                    backend,
                    timeout.as_secs(),
                    task_id
                ));
                if self.config.dispatch.continue_after_timeout {
                    if let Err(e) = self.spawn_watcher(&backend, &task_id) {
                        warn!("{:#}", e);
                        dispatcher.abandon(&backend, &self.work_dir, &task_id)?;
                    } else {
                        eprintln!("A late reply will still be available through `pend {}`", backend);
                    }
                }
                Ok(ExitStatus::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ask_detached(&self, backend: &str, text: &str) -> Result<ExitStatus> {
        let task_id = self.dispatcher.send_detached(backend, &self.work_dir, text).await?;
        if let Err(e) = self.spawn_watcher(backend, &task_id) {
            self.dispatcher.abandon(backend, &self.work_dir, &task_id)?;
            return Err(e);
        }
        display::display_task_submitted(backend, &task_id)?;
        Ok(ExitStatus::Success)
    }

    /// Re-run this binary detached as `watch <backend> --task-id <id>`
    fn spawn_watcher(&self, backend: &str, task_id: &str) -> Result<()> {
        let exe = std::env::current_exe().context("Failed to locate the panebridge executable")?;
        let mut command = std::process::Command::new(exe);
        command
            .arg("--work-dir")
            .arg(&self.work_dir)
            .arg("--config-file")
            .arg(self.cli.config_path());
        if let Some(kind) = self.cli.mux {
            command.arg("--mux").arg(kind.as_str());
        }
        command
            .args(["watch", backend, "--task-id", task_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to start watcher for task {}", task_id))?;
        info!("Watcher (pid {}) took over task {}", child.id(), task_id);
        Ok(())
    }
}

/// Message from the command line words, or from `input` for `-`/nothing
fn message_text<R: Read>(parts: &[String], mut input: R) -> Result<String> {
    let text = if parts.is_empty() || (parts.len() == 1 && parts[0] == "-") {
        let mut buffer = String::new();
        input
            .read_to_string(&mut buffer)
            .context("Failed to read message from stdin")?;
        buffer
    } else {
        parts.join(" ")
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        anyhow::bail!("Message is empty");
    }
    Ok(text)
}

/// Dispatch settings for `ask --wait`; `--timeout 0` waits without a
/// deadline
fn wait_config(dispatch: &DispatchConfig, timeout: Option<u64>) -> DispatchConfig {
    let mut dispatch = dispatch.clone();
    if let Some(secs) = timeout {
        dispatch.reply_timeout_secs = secs;
    }
    dispatch
}
