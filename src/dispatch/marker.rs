//! Task ids and the begin/end markers that delimit a reply in raw pane output
//!
//! A framed request ends with the begin marker on its own line. The
//! assistant is asked to print the end marker after its answer, but the
//! instruction spells it in two quoted halves, so the echoed request never
//! contains the end marker itself. A reply is therefore the text between
//! the last begin marker and the first end marker that follows it.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::config::{MAX_MARKER_ENTROPY, MIN_MARKER_ENTROPY};

const BEGIN_PREFIX: &str = "@@PB-BEGIN-";
const END_PREFIX: &str = "@@PB-END-";
const CLOSE: &str = "@@";

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<pid><seq>-<entropy>`, all lowercase hex. `entropy` is clamped to the
/// supported range.
pub fn new_task_id(entropy: usize) -> String {
    let entropy = entropy.clamp(MIN_MARKER_ENTROPY, MAX_MARKER_ENTROPY);
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{:x}{:x}-{}",
        std::process::id(),
        TASK_SEQ.fetch_add(1, Ordering::Relaxed),
        &random[..entropy]
    )
}

pub fn begin_marker(task_id: &str) -> String {
    format!("{}{}{}", BEGIN_PREFIX, task_id, CLOSE)
}

pub fn end_marker(task_id: &str) -> String {
    format!("{}{}{}", END_PREFIX, task_id, CLOSE)
}

/// Wrap `message` for delivery to the hosted assistant
pub fn frame_request(message: &str, task_id: &str) -> String {
    format!(
        "{}\n\nWhen your reply is complete, print this marker on its own line, joining the two \
         quoted parts without spaces: \"@@PB\" + \"-END-{}@@\"\n{}",
        message.trim(),
        task_id,
        begin_marker(task_id)
    )
}

/// Split a framed request back into the caller's message and its task id
pub fn unframe(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_end();
    let begin_at = text.rfind(BEGIN_PREFIX)?;
    let task_id = text[begin_at + BEGIN_PREFIX.len()..].strip_suffix(CLOSE)?;
    let message = match text[..begin_at].rfind("\n\n") {
        Some(split) => &text[..split],
        None => text[..begin_at].trim_end(),
    };
    Some((message, task_id))
}

/// Reply body for `task_id` in a pane snapshot, once the end marker is there
pub fn extract_reply(snapshot: &str, task_id: &str) -> Option<String> {
    let begin = begin_marker(task_id);
    let end = end_marker(task_id);

    let start = snapshot.rfind(&begin)? + begin.len();
    let rest = &snapshot[start..];
    let stop = rest.find(&end)?;
    Some(rest[..stop].trim().to_string())
}

/// Whether `text` still carries any bridge marker
pub fn contains_marker(text: &str) -> bool {
    text.contains(BEGIN_PREFIX) || text.contains(END_PREFIX)
}
