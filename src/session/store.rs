//! Persistence for session marker records and in-flight claims

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::mux::{MuxKind, PaneHandle};

const SESSION_SUFFIX: &str = ".session.json";
const INFLIGHT_SUFFIX: &str = ".inflight.json";
const TAKEOVER_SUFFIX: &str = ".takeover.lock";

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identity of a session: one backend in one working directory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub backend: String,
    pub work_dir: PathBuf,
}

impl SessionKey {
    pub fn new(backend: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: backend.into(),
            work_dir: work_dir.into(),
        }
    }
}

/// Marker record persisted per (backend, working directory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub backend: String,
    pub mux: MuxKind,
    pub pane_id: String,
    pub pane_name: String,
    pub work_dir: PathBuf,
    pub launch_command: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub marker_path: Option<PathBuf>,
    /// Assistant conversation this pane runs, once it is known
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl SessionRecord {
    pub fn handle(&self) -> PaneHandle {
        PaneHandle::new(self.mux, self.pane_id.clone())
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.backend.clone(), self.work_dir.clone())
    }
}

/// Ownership of a session's single input slot by one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InflightClaim {
    pub task_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl InflightClaim {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            claimed_at: Utc::now(),
        }
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.claimed_at);
        age.to_std().map(|age| age > stale_after).unwrap_or(false)
    }
}

/// Storage backend for the session registry.
///
/// Calls are short, synchronous and never made while a multiplexer command
/// is outstanding.
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &SessionKey) -> BridgeResult<Option<SessionRecord>>;

    fn save(&self, record: &SessionRecord) -> BridgeResult<()>;

    fn remove(&self, key: &SessionKey) -> BridgeResult<()>;

    /// Records stored for one working directory
    fn list(&self, work_dir: &Path) -> BridgeResult<Vec<SessionRecord>>;

    /// Where the marker for `key` lives, if the store is on disk
    fn marker_path(&self, _key: &SessionKey) -> Option<PathBuf> {
        None
    }

    /// Claim the session for `task_id`. Fails with `SessionBusy` while a
    /// fresh claim by another task exists.
    fn claim(&self, key: &SessionKey, task_id: &str, stale_after: Duration) -> BridgeResult<()>;

    /// Release the claim if `task_id` still holds it
    fn release(&self, key: &SessionKey, task_id: &str) -> BridgeResult<()>;

    fn current_claim(&self, key: &SessionKey) -> BridgeResult<Option<InflightClaim>>;

    /// Drop any claim regardless of owner
    fn clear_claim(&self, key: &SessionKey) -> BridgeResult<()>;
}

/// Serialize `value` next to `path` and rename it into place
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> BridgeResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| BridgeError::Store(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;

    let temp = temp_path(path);
    write_synced(&temp, &serde_json::to_vec_pretty(value)?)?;

    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// Read a JSON file; a missing file is `None`
pub fn read_json<T: DeserializeOwned>(path: &Path) -> BridgeResult<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Unique sibling of `path` for staging a write
fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(body)?;
    file.sync_all()
}

/// Time since the file was last written, `None` if it is gone
fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn remove_if_exists(path: &Path) -> BridgeResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// On-disk store: `<work_dir>/<state_dir>/<backend>.session.json`
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    state_dir_name: String,
}

impl FileSessionStore {
    pub fn new(state_dir_name: impl Into<String>) -> Self {
        Self {
            state_dir_name: state_dir_name.into(),
        }
    }

    pub fn state_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.state_dir_name)
    }

    fn record_path(&self, key: &SessionKey) -> PathBuf {
        self.state_dir(&key.work_dir)
            .join(format!("{}{}", key.backend, SESSION_SUFFIX))
    }

    fn claim_path(&self, key: &SessionKey) -> PathBuf {
        self.state_dir(&key.work_dir)
            .join(format!("{}{}", key.backend, INFLIGHT_SUFFIX))
    }

    /// Publish `claim` at `path` complete or not at all. Fails with
    /// `AlreadyExists` when another claim is in place; never replaces it.
    fn publish_claim(path: &Path, claim: &InflightClaim) -> std::io::Result<()> {
        let temp = temp_path(path);
        write_synced(&temp, &serde_json::to_vec(claim)?)?;
        let linked = fs::hard_link(&temp, path);
        if let Err(e) = fs::remove_file(&temp) {
            debug!("Could not remove {}: {}", temp.display(), e);
        }
        linked
    }

    fn busy(key: &SessionKey, path: &Path) -> BridgeError {
        let task_id = read_json::<InflightClaim>(path)
            .ok()
            .flatten()
            .map_or_else(|| "unknown".to_string(), |holder| holder.task_id);
        BridgeError::SessionBusy {
            backend: key.backend.clone(),
            task_id,
        }
    }

    /// Replace a stale claim while holding the takeover lock, so two
    /// processes never both clear the same claim
    fn take_over(
        &self,
        key: &SessionKey,
        path: &Path,
        claim: &InflightClaim,
        stale_after: Duration,
    ) -> BridgeResult<()> {
        let lock = path.with_file_name(format!("{}{}", key.backend, TAKEOVER_SUFFIX));
        match Self::publish_claim(&lock, claim) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if file_age(&lock).is_some_and(|age| age > stale_after) {
                    warn!("Removing abandoned takeover lock {}", lock.display());
                    remove_if_exists(&lock)?;
                }
                return Err(Self::busy(key, path));
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.replace_stale(key, path, claim, stale_after);
        if let Err(e) = remove_if_exists(&lock) {
            warn!("Could not remove takeover lock {}: {}", lock.display(), e);
        }
        result
    }

    fn replace_stale(
        &self,
        key: &SessionKey,
        path: &Path,
        claim: &InflightClaim,
        stale_after: Duration,
    ) -> BridgeResult<()> {
        // The claim may have been replaced since it was judged stale
        if file_age(path).is_some_and(|age| age <= stale_after) {
            return Err(Self::busy(key, path));
        }
        warn!("Clearing stale in-flight claim for {}", key.backend);
        remove_if_exists(path)?;
        match Self::publish_claim(path, claim) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Self::busy(key, path)),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, key: &SessionKey) -> BridgeResult<Option<SessionRecord>> {
        let path = self.record_path(key);
        match read_json::<SessionRecord>(&path) {
            Ok(record) => Ok(record),
            Err(BridgeError::Store(reason)) if reason.starts_with("invalid JSON") => {
                warn!("Ignoring unreadable session record {}: {}", path.display(), reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn save(&self, record: &SessionRecord) -> BridgeResult<()> {
        let path = self.record_path(&record.key());
        write_json_atomic(&path, record)?;
        debug!("Saved session record {}", path.display());
        Ok(())
    }

    fn remove(&self, key: &SessionKey) -> BridgeResult<()> {
        remove_if_exists(&self.record_path(key))
    }

    fn list(&self, work_dir: &Path) -> BridgeResult<Vec<SessionRecord>> {
        let dir = self.state_dir(work_dir);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().ends_with(SESSION_SUFFIX));
            if !is_record {
                continue;
            }
            match read_json::<SessionRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        records.sort_by(|a, b| a.backend.cmp(&b.backend));
        Ok(records)
    }

    fn marker_path(&self, key: &SessionKey) -> Option<PathBuf> {
        Some(self.record_path(key))
    }

    /// A claim file is never observed half-written, and only its age on
    /// disk decides staleness; an unreadable but recent claim still counts.
    fn claim(&self, key: &SessionKey, task_id: &str, stale_after: Duration) -> BridgeResult<()> {
        let path = self.claim_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let claim = InflightClaim::new(task_id);

        match Self::publish_claim(&path, &claim) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if file_age(&path).is_some_and(|age| age > stale_after) {
                    self.take_over(key, &path, &claim, stale_after)
                } else {
                    Err(Self::busy(key, &path))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, key: &SessionKey, task_id: &str) -> BridgeResult<()> {
        let path = self.claim_path(key);
        match read_json::<InflightClaim>(&path) {
            Ok(Some(claim)) if claim.task_id == task_id => remove_if_exists(&path),
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("Leaving unreadable claim {} in place: {}", path.display(), e);
                Ok(())
            }
        }
    }

    fn current_claim(&self, key: &SessionKey) -> BridgeResult<Option<InflightClaim>> {
        read_json(&self.claim_path(key))
    }

    fn clear_claim(&self, key: &SessionKey) -> BridgeResult<()> {
        remove_if_exists(&self.claim_path(key))
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<SessionKey, SessionRecord>,
    claims: HashMap<SessionKey, InflightClaim>,
}

/// Process-local store for tests
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &SessionKey) -> BridgeResult<Option<SessionRecord>> {
        Ok(self.lock().records.get(key).cloned())
    }

    fn save(&self, record: &SessionRecord) -> BridgeResult<()> {
        self.lock().records.insert(record.key(), record.clone());
        Ok(())
    }

    fn remove(&self, key: &SessionKey) -> BridgeResult<()> {
        self.lock().records.remove(key);
        Ok(())
    }

    fn list(&self, work_dir: &Path) -> BridgeResult<Vec<SessionRecord>> {
        let mut records: Vec<_> = self
            .lock()
            .records
            .values()
            .filter(|r| r.work_dir == work_dir)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.backend.cmp(&b.backend));
        Ok(records)
    }

    fn claim(&self, key: &SessionKey, task_id: &str, stale_after: Duration) -> BridgeResult<()> {
        let mut state = self.lock();
        if let Some(holder) = state.claims.get(key) {
            if !holder.is_stale(stale_after) {
                return Err(BridgeError::SessionBusy {
                    backend: key.backend.clone(),
                    task_id: holder.task_id.clone(),
                });
            }
        }
        state.claims.insert(key.clone(), InflightClaim::new(task_id));
        Ok(())
    }

    fn release(&self, key: &SessionKey, task_id: &str) -> BridgeResult<()> {
        let mut state = self.lock();
        if state.claims.get(key).is_some_and(|c| c.task_id == task_id) {
            state.claims.remove(key);
        }
        Ok(())
    }

    fn current_claim(&self, key: &SessionKey) -> BridgeResult<Option<InflightClaim>> {
        Ok(self.lock().claims.get(key).cloned())
    }

    fn clear_claim(&self, key: &SessionKey) -> BridgeResult<()> {
        self.lock().claims.remove(key);
        Ok(())
    }
}
