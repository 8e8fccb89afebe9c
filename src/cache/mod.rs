//! Latest completed reply per session
//!
//! Single slot, last write wins. Only the dispatch completion step writes
//! here; pings never do.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BridgeResult;
use crate::session::store::{read_json, write_json_atomic};
use crate::session::SessionKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReply {
    pub backend: String,
    pub task_id: String,
    pub text: String,
    pub completed_at: DateTime<Utc>,
}

impl CachedReply {
    pub fn new(backend: &str, task_id: &str, text: &str) -> Self {
        Self {
            backend: backend.to_string(),
            task_id: task_id.to_string(),
            text: text.to_string(),
            completed_at: Utc::now(),
        }
    }
}

pub trait ReplyCache: Send + Sync {
    fn latest(&self, key: &SessionKey) -> BridgeResult<Option<CachedReply>>;

    fn store(&self, key: &SessionKey, reply: &CachedReply) -> BridgeResult<()>;
}

/// `<work_dir>/<state_dir>/<backend>.reply.json`
#[derive(Debug, Clone)]
pub struct FileReplyCache {
    state_dir_name: String,
}

impl FileReplyCache {
    pub fn new(state_dir_name: impl Into<String>) -> Self {
        Self {
            state_dir_name: state_dir_name.into(),
        }
    }

    fn path(&self, key: &SessionKey) -> PathBuf {
        key.work_dir
            .join(&self.state_dir_name)
            .join(format!("{}.reply.json", key.backend))
    }
}

impl ReplyCache for FileReplyCache {
    fn latest(&self, key: &SessionKey) -> BridgeResult<Option<CachedReply>> {
        read_json(&self.path(key))
    }

    fn store(&self, key: &SessionKey, reply: &CachedReply) -> BridgeResult<()> {
        let path = self.path(key);
        write_json_atomic(&path, reply)?;
        debug!("Cached reply for task {} at {}", reply.task_id, path.display());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryReplyCache {
    slots: Mutex<HashMap<SessionKey, CachedReply>>,
}

impl MemoryReplyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplyCache for MemoryReplyCache {
    fn latest(&self, key: &SessionKey) -> BridgeResult<Option<CachedReply>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slots.get(key).cloned())
    }

    fn store(&self, key: &SessionKey, reply: &CachedReply) -> BridgeResult<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(key.clone(), reply.clone());
        Ok(())
    }
}
