//! Conversation binding
//!
//! Assistants keep their conversations in log files under a per-user
//! directory. The newest log written while a session was answering names the
//! conversation that session runs, so a later resume can reopen exactly that
//! conversation instead of whatever ran last on the host.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Log nesting depth scanned below the conversation directory
const MAX_DEPTH: usize = 5;

/// Bytes read from the top of a log when looking for its id
const HEAD_BYTES: u64 = 16 * 1024;

/// Filesystem timestamps are coarse on some hosts
const MTIME_SLACK: Duration = Duration::from_secs(2);

const UUID_LEN: usize = 36;

/// Hex SHA-256 of the working directory, as assistants name their
/// per-project state directories
pub fn project_hash(work_dir: &Path) -> String {
    Sha256::digest(work_dir.to_string_lossy().as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Expand a conversation directory template for `work_dir`
pub fn log_dir(template: &str, work_dir: &Path) -> Option<PathBuf> {
    let expanded = template.replace("{project_hash}", &project_hash(work_dir));
    match expanded.strip_prefix("~") {
        Some(rest) => {
            let home = dirs::home_dir()?;
            Some(home.join(rest.trim_start_matches(['/', '\\'])))
        }
        None => Some(PathBuf::from(expanded)),
    }
}

/// First hyphenated UUID in `text`, lowercased
pub fn find_uuid(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    if bytes.len() < UUID_LEN {
        return None;
    }
    (0..=bytes.len() - UUID_LEN).find_map(|start| {
        let window = &bytes[start..start + UUID_LEN];
        let shaped = window.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        });
        if !shaped {
            return None;
        }
        let candidate = std::str::from_utf8(window).ok()?;
        Uuid::try_parse(candidate).ok().map(|id| id.hyphenated().to_string())
    })
}

fn is_log(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

fn collect_logs(dir: &Path, depth: usize, since: SystemTime, found: &mut Vec<(SystemTime, PathBuf)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            if depth < MAX_DEPTH {
                collect_logs(&path, depth + 1, since, found);
            }
        } else if is_log(&path) {
            if let Ok(modified) = meta.modified() {
                if modified >= since {
                    found.push((modified, path));
                }
            }
        }
    }
}

fn head(path: &Path) -> Option<String> {
    let mut buf = Vec::new();
    fs::File::open(path)
        .ok()?
        .take(HEAD_BYTES)
        .read_to_end(&mut buf)
        .ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Whether a log's header records `work_dir` as the assistant's directory
fn mentions(head: &str, work_dir: &Path) -> bool {
    let raw = work_dir.to_string_lossy();
    if head.contains(raw.as_ref()) {
        return true;
    }
    // JSON escapes backslashes and quotes in paths
    serde_json::to_string(raw.as_ref())
        .map(|quoted| head.contains(quoted.trim_matches('"')))
        .unwrap_or(false)
}

/// Conversation id of the newest log in `dir` modified since `since`.
///
/// Logs whose header names `work_dir` win over newer logs that don't, so a
/// shared log directory does not bind a session to another project's
/// conversation.
pub fn latest_conversation(dir: &Path, work_dir: &Path, since: SystemTime) -> Option<String> {
    let since = since.checked_sub(MTIME_SLACK).unwrap_or(since);
    let mut logs = Vec::new();
    collect_logs(dir, 0, since, &mut logs);
    if logs.is_empty() {
        debug!("No conversation logs under {} since the task started", dir.display());
        return None;
    }
    logs.sort_by(|a, b| b.0.cmp(&a.0));

    let mut fallback = None;
    for (_, path) in &logs {
        let Some(text) = head(path) else {
            continue;
        };
        let from_name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(find_uuid);
        let Some(id) = from_name.or_else(|| find_uuid(&text)) else {
            continue;
        };
        if mentions(&text, work_dir) {
            return Some(id);
        }
        fallback.get_or_insert(id);
    }
    fallback
}
