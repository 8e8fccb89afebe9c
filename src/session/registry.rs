//! Session registry: (backend, working directory) to live pane
//!
//! Every lookup re-validates the recorded pane with `pane_exists` before it
//! is handed out. A dead pane is logged and recreated in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::conversation;
use super::store::{SessionKey, SessionRecord, SessionStore};
use crate::backend::{BackendCatalog, LaunchOptions};
use crate::error::{BridgeError, BridgeResult};
use crate::mux::{AdapterSet, MuxKind, Multiplexer, PaneHandle, PaneSpec};

const LIVENESS_ATTEMPTS: u32 = 2;
const LIVENESS_RETRY_DELAY: Duration = Duration::from_millis(250);

/// A validated, live session together with the adapter that owns its pane
#[derive(Clone)]
pub struct Session {
    pub record: SessionRecord,
    pub adapter: Arc<dyn Multiplexer>,
}

impl Session {
    pub fn handle(&self) -> PaneHandle {
        self.record.handle()
    }

    pub fn key(&self) -> SessionKey {
        self.record.key()
    }

    pub fn backend(&self) -> &str {
        &self.record.backend
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("record", &self.record).finish()
    }
}

/// One row of `status`
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub record: SessionRecord,
    pub alive: bool,
    /// Task currently holding the session, if any
    pub busy_with: Option<String>,
}

/// Stable logical pane name for a backend in a directory
pub fn pane_name(backend: &str, work_dir: &Path) -> String {
    let digest = Sha256::digest(work_dir.to_string_lossy().as_bytes());
    let short: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("pb-{}-{}", backend, short)
}

pub struct SessionRegistry {
    adapters: AdapterSet,
    store: Arc<dyn SessionStore>,
    backends: BackendCatalog,
}

impl SessionRegistry {
    pub fn new(adapters: AdapterSet, store: Arc<dyn SessionStore>, backends: BackendCatalog) -> Self {
        Self {
            adapters,
            store,
            backends,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn backends(&self) -> &BackendCatalog {
        &self.backends
    }

    fn primary(&self) -> BridgeResult<Arc<dyn Multiplexer>> {
        self.adapters
            .primary()
            .ok_or_else(|| BridgeError::BackendUnavailable {
                guidance: "no terminal multiplexer found. Install tmux, run inside WezTerm or \
                           iTerm2, or select one with --mux"
                    .to_string(),
            })
    }

    fn adapter_for(&self, kind: MuxKind) -> BridgeResult<Arc<dyn Multiplexer>> {
        self.adapters
            .get(kind)
            .ok_or_else(|| BridgeError::BackendUnavailable {
                guidance: format!(
                    "the session was created under {}, which is not reachable from here. \
                     Run from a host where {} is available, or `kill` the session",
                    kind, kind
                ),
            })
    }

    /// Confirm the recorded pane still exists. Only a confirmed absence
    /// makes the session stale; a liveness check that keeps failing is
    /// surfaced instead of being taken as "gone".
    async fn validate(&self, record: SessionRecord) -> BridgeResult<Session> {
        let adapter = self.adapter_for(record.mux)?;
        let handle = record.handle();

        let mut attempt = 1;
        let alive = loop {
            match adapter.pane_exists(&handle).await {
                Ok(alive) => break alive,
                Err(e) if attempt < LIVENESS_ATTEMPTS => {
                    warn!("Liveness check for {} failed ({}), retrying", handle, e);
                    attempt += 1;
                    tokio::time::sleep(LIVENESS_RETRY_DELAY).await;
                }
                Err(e) => return Err(BridgeError::from_mux(e)),
            }
        };

        if alive {
            Ok(Session { record, adapter })
        } else {
            Err(BridgeError::StaleSession {
                backend: record.backend,
                pane_id: record.pane_id,
            })
        }
    }

    async fn create_with(
        &self,
        backend: &str,
        work_dir: &Path,
        launch_command: String,
        conversation_id: Option<String>,
    ) -> BridgeResult<Session> {
        let adapter = self.primary()?;
        let spec = PaneSpec {
            name: pane_name(backend, work_dir),
            work_dir: work_dir.to_path_buf(),
            launch_command,
        };

        let handle = adapter
            .create_pane(&spec)
            .await
            .map_err(BridgeError::from_mux)?;

        let key = SessionKey::new(backend, work_dir);
        let record = SessionRecord {
            backend: backend.to_string(),
            mux: handle.kind,
            pane_id: handle.id.clone(),
            pane_name: spec.name,
            work_dir: work_dir.to_path_buf(),
            launch_command: spec.launch_command,
            created_at: Utc::now(),
            marker_path: self.store.marker_path(&key),
            conversation_id,
        };
        self.store.save(&record)?;

        info!("Session for {} is pane {} in {}", backend, handle, work_dir.display());
        Ok(Session { record, adapter })
    }

    async fn create(
        &self,
        backend: &str,
        work_dir: &Path,
        options: LaunchOptions,
        conversation_id: Option<String>,
    ) -> BridgeResult<Session> {
        let command = self
            .backends
            .get(backend)?
            .launch_command_for(options, conversation_id.as_deref());
        self.create_with(backend, work_dir, command, conversation_id).await
    }

    /// Command that brings a dead pane's assistant back: its own conversation
    /// when one is bound, otherwise the command the pane was started with
    fn relaunch_command(&self, record: &SessionRecord) -> BridgeResult<String> {
        let backend = self.backends.get(&record.backend)?;
        let elevated = backend
            .full_permission_flag
            .as_deref()
            .is_some_and(|flag| record.launch_command.ends_with(flag));
        Ok(match (&record.conversation_id, &backend.resume_id_command) {
            (Some(id), Some(_)) => backend.launch_command_for(
                LaunchOptions {
                    resume: true,
                    elevated,
                },
                Some(id),
            ),
            _ => record.launch_command.clone(),
        })
    }

    /// Live session for the pair, creating one when none is recorded and
    /// recreating it when the recorded pane is gone.
    pub async fn get_or_create(&self, backend: &str, work_dir: &Path) -> BridgeResult<Session> {
        let backend = self.backends.get(backend)?.name.clone();
        let key = SessionKey::new(backend.as_str(), work_dir);

        let Some(record) = self.store.load(&key)? else {
            return self
                .create(&backend, work_dir, LaunchOptions::default(), None)
                .await;
        };

        let previous = record.clone();
        match self.validate(record).await {
            Ok(session) => {
                debug!("Reusing session {} for {}", session.handle(), backend);
                Ok(session)
            }
            Err(err @ BridgeError::StaleSession { .. }) => {
                warn!("{}; recreating", err);
                // Never leave a second assistant behind for the same pair
                if let Ok(adapter) = self.adapter_for(previous.mux) {
                    adapter.kill_pane(&previous.handle()).await;
                }
                let command = self.relaunch_command(&previous)?;
                self.create_with(&backend, work_dir, command, previous.conversation_id)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Reconnect to the recorded pane without creating anything
    pub async fn resume(&self, backend: &str, work_dir: &Path) -> BridgeResult<Session> {
        let backend = self.backends.get(backend)?.name.clone();
        let key = SessionKey::new(backend.as_str(), work_dir);
        let not_found = || BridgeError::SessionNotFound {
            backend: backend.clone(),
            work_dir: work_dir.to_path_buf(),
        };

        let record = self.store.load(&key)?.ok_or_else(not_found)?;
        match self.validate(record).await {
            Ok(session) => Ok(session),
            Err(err @ BridgeError::StaleSession { .. }) => {
                warn!("{}", err);
                Err(not_found())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the marker record; the pane itself is left alone
    pub fn forget(&self, backend: &str, work_dir: &Path) -> BridgeResult<()> {
        let key = SessionKey::new(backend, work_dir);
        self.store.remove(&key)?;
        self.store.clear_claim(&key)
    }

    /// Explicit start. A fresh start replaces any previous pane; `resume`
    /// reuses the recorded pane and falls back to relaunching the recorded
    /// conversation, or the backend's resume command when none is bound.
    pub async fn start(&self, backend: &str, work_dir: &Path, options: LaunchOptions) -> BridgeResult<Session> {
        let name = self.backends.get(backend)?.name.clone();
        let key = SessionKey::new(name.as_str(), work_dir);

        if options.resume {
            match self.resume(&name, work_dir).await {
                Ok(session) => return Ok(session),
                Err(BridgeError::SessionNotFound { .. }) => {
                    info!("No session to resume for {}, starting one", name);
                    let conversation = self.store.load(&key)?.and_then(|r| r.conversation_id);
                    return self.create(&name, work_dir, options, conversation).await;
                }
                Err(e) => return Err(e),
            }
        } else if let Some(previous) = self.store.load(&key)? {
            if let Ok(adapter) = self.adapter_for(previous.mux) {
                debug!("Replacing pane {} for {}", previous.pane_id, name);
                adapter.kill_pane(&previous.handle()).await;
            }
            self.forget(&name, work_dir)?;
        }

        self.create(&name, work_dir, options, None).await
    }

    /// Force-resume: bring back the recorded session, relaunching the
    /// backend's resume command if its pane died, and focus it.
    pub async fn restore(&self, backend: &str, work_dir: &Path) -> BridgeResult<Session> {
        let name = self.backends.get(backend)?.name.clone();
        let record = self
            .store
            .load(&SessionKey::new(name.as_str(), work_dir))?
            .ok_or_else(|| BridgeError::SessionNotFound {
                backend: name.clone(),
                work_dir: work_dir.to_path_buf(),
            })?;

        let previous = record.clone();
        let session = match self.validate(record).await {
            Ok(session) => session,
            Err(err @ BridgeError::StaleSession { .. }) => {
                warn!("{}; relaunching with resume", err);
                let options = LaunchOptions {
                    resume: true,
                    elevated: false,
                };
                self.create(&name, work_dir, options, previous.conversation_id)
                    .await?
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = session.adapter.focus_pane(&session.handle()).await {
            warn!("Could not focus {}: {}", session.handle(), e);
        }
        Ok(session)
    }

    /// Bind the session to the assistant conversation it runs, looked up in
    /// the backend's conversation logs written since `since`. A session stays
    /// bound to the first conversation found for its pane.
    pub async fn remember_conversation(
        &self,
        session: &Session,
        since: SystemTime,
    ) -> BridgeResult<Option<String>> {
        let key = session.key();
        let Some(mut record) = self.store.load(&key)? else {
            return Ok(None);
        };
        if record.pane_id != session.record.pane_id {
            return Ok(None);
        }
        if record.conversation_id.is_some() {
            return Ok(record.conversation_id);
        }

        let backend = self.backends.get(&record.backend)?;
        let (Some(_), Some(template)) = (&backend.resume_id_command, &backend.conversation_dir) else {
            return Ok(None);
        };
        let Some(dir) = conversation::log_dir(template, &record.work_dir) else {
            return Ok(None);
        };

        let work_dir = record.work_dir.clone();
        let found = tokio::task::spawn_blocking(move || {
            conversation::latest_conversation(&dir, &work_dir, since)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Conversation lookup for {} failed: {}", record.backend, e);
            None
        });
        let Some(id) = found else {
            return Ok(None);
        };

        info!("Session {} runs conversation {}", session.handle(), id);
        record.conversation_id = Some(id.clone());
        self.store.save(&record)?;
        Ok(Some(id))
    }

    /// Terminate the pane and forget it. Returns whether a record existed.
    pub async fn kill(&self, backend: &str, work_dir: &Path) -> BridgeResult<bool> {
        let name = self.backends.get(backend)?.name.clone();
        let key = SessionKey::new(name.as_str(), work_dir);
        let Some(record) = self.store.load(&key)? else {
            return Ok(false);
        };

        match self.adapter_for(record.mux) {
            Ok(adapter) => adapter.kill_pane(&record.handle()).await,
            Err(e) => warn!("Not killing pane {}: {}", record.pane_id, e),
        }
        self.forget(&name, work_dir)?;
        info!("Killed session for {}", name);
        Ok(true)
    }

    /// Recorded sessions in `work_dir`, optionally for one backend
    pub async fn list(&self, work_dir: &Path, backend: Option<&str>) -> BridgeResult<Vec<SessionStatus>> {
        let records = self.store.list(work_dir)?;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            if backend.is_some_and(|b| !b.eq_ignore_ascii_case(&record.backend)) {
                continue;
            }
            let alive = match self.adapters.get(record.mux) {
                Some(adapter) => match adapter.pane_exists(&record.handle()).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        warn!("Could not check pane {}: {}", record.pane_id, e);
                        false
                    }
                },
                None => false,
            };
            let busy_with = self
                .store
                .current_claim(&record.key())?
                .map(|claim| claim.task_id);
            rows.push(SessionStatus {
                record,
                alive,
                busy_with,
            });
        }
        Ok(rows)
    }

    /// Canonical absolute form used as part of the session key
    pub fn normalize_work_dir(work_dir: &Path) -> PathBuf {
        std::fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendConfig;
    use crate::mux::{MockMultiplexer, MuxError};
    use crate::session::store::MemorySessionStore;
    use tempfile::TempDir;

    const CONVERSATION: &str = "0199f0a1-2b3c-7d4e-8f50-6a7b8c9d0e1f";

    /// Backends whose conversation logs live under `logs/<backend>`
    fn logging_to(mux: Arc<MockMultiplexer>, logs: &Path) -> SessionRegistry {
        let backends = BackendConfig::defaults()
            .into_iter()
            .map(|mut backend| {
                let dir = logs.join(&backend.name);
                backend.conversation_dir = Some(dir.to_string_lossy().into_owned());
                backend
            })
            .collect();
        SessionRegistry::new(
            AdapterSet::new().with(mux),
            Arc::new(MemorySessionStore::new()),
            BackendCatalog::new(backends),
        )
    }

    fn write_codex_log(logs: &Path, work_dir: &Path) {
        let log = logs
            .join("codex")
            .join("2026")
            .join(format!("rollout-2026-10-19T10-00-00-{}.jsonl", CONVERSATION));
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        let meta = format!("{{\"payload\":{{\"cwd\":\"{}\"}}}}\n", work_dir.display());
        std::fs::write(&log, meta).unwrap();
    }

    fn registry(mux: Arc<MockMultiplexer>) -> SessionRegistry {
        SessionRegistry::new(
            AdapterSet::new().with(mux),
            Arc::new(MemorySessionStore::new()),
            BackendCatalog::default(),
        )
    }

    #[test]
    fn test_pane_name_is_stable_per_directory() {
        let a = pane_name("codex", Path::new("/work/a"));
        assert_eq!(a, pane_name("codex", Path::new("/work/a")));
        assert_ne!(a, pane_name("codex", Path::new("/work/b")));
        assert!(a.starts_with("pb-codex-"));
        assert_eq!(a.len(), "pb-codex-".len() + 8);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/project");

        let first = registry.get_or_create("codex", dir).await.unwrap();
        let second = registry.get_or_create("codex", dir).await.unwrap();
        assert_eq!(first.record.pane_id, second.record.pane_id);
        assert_eq!(mux.created_count(), 1);
    }

    #[tokio::test]
    async fn test_dead_pane_is_recreated() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/project");

        let first = registry.get_or_create("gemini", dir).await.unwrap();
        mux.kill_externally(&first.handle());
        let second = registry.get_or_create("gemini", dir).await.unwrap();

        assert_ne!(first.record.pane_id, second.record.pane_id);
        assert!(mux.pane_exists(&second.handle()).await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_without_record_is_not_found() {
        let registry = registry(Arc::new(MockMultiplexer::new()));
        let result = registry.resume("codex", Path::new("/nowhere")).await;
        assert!(matches!(result, Err(BridgeError::SessionNotFound { .. })));
    }

    #[tokio::test]
    async fn test_start_with_resume_falls_back_to_resume_command() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let options = LaunchOptions {
            resume: true,
            elevated: false,
        };
        let session = registry
            .start("codex", Path::new("/work/x"), options)
            .await
            .unwrap();
        assert_eq!(
            mux.launch_command(&session.handle()).as_deref(),
            Some("codex resume --last")
        );
    }

    #[tokio::test]
    async fn test_fresh_start_replaces_previous_pane() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/y");

        let old = registry.get_or_create("codex", dir).await.unwrap();
        let elevated = LaunchOptions {
            resume: false,
            elevated: true,
        };
        let new = registry.start("codex", dir, elevated).await.unwrap();

        assert!(!mux.pane_exists(&old.handle()).await.unwrap());
        assert_eq!(mux.live_panes(), 1);
        assert!(new.record.launch_command.ends_with("--dangerously-bypass-approvals-and-sandbox"));
    }

    #[tokio::test]
    async fn test_restore_relaunches_and_focuses() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/z");

        let first = registry.get_or_create("gemini", dir).await.unwrap();
        mux.kill_externally(&first.handle());

        let restored = registry.restore("gemini", dir).await.unwrap();
        assert_eq!(restored.record.launch_command, "gemini --resume latest");
        assert_eq!(mux.focused(), vec![restored.record.pane_id.clone()]);
    }

    #[tokio::test]
    async fn test_session_from_unreachable_mux_is_unavailable() {
        let tmux = Arc::new(MockMultiplexer::with_kind(MuxKind::Tmux));
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let dir = Path::new("/work/w");

        let under_tmux = SessionRegistry::new(
            AdapterSet::new().with(tmux),
            store.clone(),
            BackendCatalog::default(),
        );
        under_tmux.get_or_create("codex", dir).await.unwrap();

        let under_wezterm = SessionRegistry::new(
            AdapterSet::new().with(Arc::new(MockMultiplexer::with_kind(MuxKind::Wezterm))),
            store,
            BackendCatalog::default(),
        );
        let result = under_wezterm.get_or_create("codex", dir).await;
        assert!(matches!(result, Err(BridgeError::BackendUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_kill_and_list() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/k");

        registry.get_or_create("codex", dir).await.unwrap();
        registry.get_or_create("gemini", dir).await.unwrap();
        assert_eq!(registry.list(dir, None).await.unwrap().len(), 2);

        assert!(registry.kill("codex", dir).await.unwrap());
        assert!(!registry.kill("codex", dir).await.unwrap());

        let rows = registry.list(dir, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.backend, "gemini");
        assert!(rows[0].alive);
    }

    #[tokio::test]
    async fn test_flaky_liveness_check_keeps_pane() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/flaky");

        let first = registry.get_or_create("codex", dir).await.unwrap();
        mux.fail_next_liveness(1);
        let second = registry.get_or_create("codex", dir).await.unwrap();

        assert_eq!(first.record.pane_id, second.record.pane_id);
        assert_eq!(mux.created_count(), 1);
        assert_eq!(mux.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_liveness_is_not_taken_as_gone() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/slow-host");

        let first = registry.get_or_create("gemini", dir).await.unwrap();
        mux.fail_next_liveness(LIVENESS_ATTEMPTS as usize);
        let result = registry.get_or_create("gemini", dir).await;

        assert!(matches!(result, Err(BridgeError::Mux(MuxError::Timeout { .. }))));
        assert_eq!(mux.created_count(), 1);
        assert_eq!(mux.kill_count(), 0);
        assert!(mux.pane_exists(&first.handle()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_pane_is_killed_before_recreation() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry(mux.clone());
        let dir = Path::new("/work/stale");

        let first = registry.get_or_create("codex", dir).await.unwrap();
        mux.kill_externally(&first.handle());
        registry.get_or_create("codex", dir).await.unwrap();

        assert_eq!(mux.kill_count(), 1);
        assert_eq!(mux.created_count(), 2);
        assert_eq!(mux.live_panes(), 1);
    }

    #[tokio::test]
    async fn test_bound_conversation_is_reopened() {
        let logs = TempDir::new().unwrap();
        let mux = Arc::new(MockMultiplexer::new());
        let registry = logging_to(mux.clone(), logs.path());
        let dir = Path::new("/work/bound");
        let since = SystemTime::now() - Duration::from_secs(10);
        let reopen = format!("codex resume {}", CONVERSATION);

        let session = registry.get_or_create("codex", dir).await.unwrap();
        assert_eq!(registry.remember_conversation(&session, since).await.unwrap(), None);

        write_codex_log(logs.path(), dir);
        let bound = registry.remember_conversation(&session, since).await.unwrap();
        assert_eq!(bound.as_deref(), Some(CONVERSATION));

        // Stale recreation
        mux.kill_externally(&session.handle());
        let recreated = registry.get_or_create("codex", dir).await.unwrap();
        assert_eq!(recreated.record.launch_command, reopen);
        assert_eq!(recreated.record.conversation_id.as_deref(), Some(CONVERSATION));

        // Forced restore
        mux.kill_externally(&recreated.handle());
        let restored = registry.restore("codex", dir).await.unwrap();
        assert_eq!(restored.record.launch_command, reopen);

        // Explicit start with resume
        mux.kill_externally(&restored.handle());
        let options = LaunchOptions {
            resume: true,
            elevated: false,
        };
        let resumed = registry.start("codex", dir, options).await.unwrap();
        assert_eq!(mux.launch_command(&resumed.handle()), Some(reopen));

        // A fresh start drops the binding
        let fresh = registry.start("codex", dir, LaunchOptions::default()).await.unwrap();
        assert_eq!(fresh.record.conversation_id, None);
        assert_eq!(fresh.record.launch_command, "codex");
    }
}
