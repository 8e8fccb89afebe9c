//! Host-level completion notifications.
//!
//! macOS: native Notification Center via `mac-notification-sys` with an
//! AppleScript/JXA fallback to survive sandbox quirks.
//! Windows: WinRT Toast via `winrt-notification`.
//! Linux: Freedesktop notifications via `notify-rust`.
//! Other platforms: no-op.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Longest reply excerpt shown in a notification body
const PREVIEW_CHARS: usize = 120;

/// Receives "a reply is ready" signals from background watchers
pub trait CompletionNotifier: Send + Sync {
    fn reply_ready(&self, backend: &str, task_id: &str, reply: &str);

    /// Block until notifications already handed off have been delivered.
    /// Short-lived processes call this before exiting.
    fn flush(&self) {}
}

/// Discards every notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl CompletionNotifier for NoopNotifier {
    fn reply_ready(&self, backend: &str, task_id: &str, _reply: &str) {
        tracing::debug!("Reply ready for {} (task {}), notifications disabled", backend, task_id);
    }
}

/// Lightweight wrapper around platform notification backends.
#[derive(Clone)]
pub struct SystemNotifier {
    backend: NotificationBackend,
    in_flight: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SystemNotifier {
    /// Create a new notifier using the provided application name label.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            backend: NotificationBackend::new(app_name.into()),
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fire a notification on a helper thread. Failures are logged but do not bubble up.
    pub fn notify(&self, title: impl Into<String>, body: impl Into<String>) {
        if let Some(handle) = self.backend.notify_async(title.into(), body.into()) {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(handle);
        }
    }
}

impl CompletionNotifier for SystemNotifier {
    fn reply_ready(&self, backend: &str, task_id: &str, reply: &str) {
        self.notify(format!("{} replied", backend), preview(reply, task_id));
    }

    fn flush(&self) {
        let handles: Vec<_> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("Notification thread panicked");
            }
        }
    }
}

fn preview(reply: &str, task_id: &str) -> String {
    let first_line = reply.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut text: String = first_line.trim().chars().take(PREVIEW_CHARS).collect();
    if first_line.trim().chars().count() > PREVIEW_CHARS || reply.lines().count() > 1 {
        text.push('…');
    }
    if text.is_empty() {
        format!("Task {} finished with an empty reply", task_id)
    } else {
        text
    }
}

#[derive(Clone)]
enum NotificationBackend {
    #[cfg(target_os = "macos")]
    Mac(MacNotifier),
    #[cfg(target_os = "windows")]
    Windows(WindowsNotifier),
    #[cfg(target_os = "linux")]
    Linux(LinuxNotifier),
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    Noop,
}

impl NotificationBackend {
    fn new(app_name: String) -> Self {
        #[cfg(target_os = "macos")]
        {
            NotificationBackend::Mac(MacNotifier { app_name })
        }
        #[cfg(target_os = "windows")]
        {
            NotificationBackend::Windows(WindowsNotifier { app_id: app_name })
        }
        #[cfg(target_os = "linux")]
        {
            NotificationBackend::Linux(LinuxNotifier { app_name })
        }
        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        {
            let _ = app_name;
            NotificationBackend::Noop
        }
    }

    fn notify_async(&self, title: String, body: String) -> Option<JoinHandle<()>> {
        match self {
            #[cfg(target_os = "macos")]
            NotificationBackend::Mac(backend) => {
                let app_name = backend.app_name.clone();
                Some(std::thread::spawn(move || {
                    if let Err(err) = send_macos_notification(&app_name, &title, &body) {
                        tracing::warn!(?err, "Failed to send macOS notification");
                    }
                }))
            }
            #[cfg(target_os = "windows")]
            NotificationBackend::Windows(backend) => {
                let app_id = backend.app_id.clone();
                Some(std::thread::spawn(move || {
                    if let Err(err) = send_windows_notification(&app_id, &title, &body) {
                        tracing::warn!(?err, "Failed to send Windows toast");
                    }
                }))
            }
            #[cfg(target_os = "linux")]
            NotificationBackend::Linux(backend) => {
                let app_name = backend.app_name.clone();
                Some(std::thread::spawn(move || {
                    if let Err(err) = send_linux_notification(&app_name, &title, &body) {
                        tracing::warn!(?err, "Failed to send Linux notification");
                    }
                }))
            }
            #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
            NotificationBackend::Noop => {
                let _ = (title, body);
                tracing::debug!("System notifications are not supported on this platform");
                None
            }
        }
    }
}

#[cfg(target_os = "macos")]
#[derive(Clone)]
struct MacNotifier {
    app_name: String,
}

#[cfg(target_os = "macos")]
fn send_macos_notification(app_name: &str, title: &str, body: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use mac_notification_sys::{Notification, send_notification, set_application};

    if let Err(err) = (|| {
        if let Err(err) = set_application(app_name) {
            tracing::warn!(?err, "Failed to set macOS notification application");
        }
        send_notification(title, Some("Reply ready"), body, None::<&Notification>)?;
        Ok::<_, mac_notification_sys::error::Error>(())
    })() {
        tracing::warn!(?err, "Native macOS notification failed, falling back to osascript");
        send_macos_with_osascript(app_name, title, body)
            .with_context(|| "both macOS notification paths failed")
    } else {
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn escape_script_text(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('\"', "\\\"")
        .replace('\n', " ")
        .replace('\r', "")
}

#[cfg(target_os = "macos")]
fn send_macos_with_osascript(app_name: &str, title: &str, body: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::process::Command;

    let script = format!(
        r#"display notification "{}" with title "{}" subtitle "{}""#,
        escape_script_text(body),
        escape_script_text(title),
        escape_script_text(app_name)
    );

    let status = Command::new("osascript")
        .args(["-e", &script])
        .status()
        .with_context(|| "failed to invoke osascript for notification")?;

    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("osascript exited with status: {:?}", status.code()))
    }
}

#[cfg(target_os = "windows")]
#[derive(Clone)]
struct WindowsNotifier {
    app_id: String,
}

#[cfg(target_os = "windows")]
fn send_windows_notification(app_id: &str, title: &str, body: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use winrt_notification::{Duration, Toast};

    Toast::new(app_id)
        .title(title)
        .text1(body)
        .duration(Duration::Short)
        .show()
        .map(|_| ())
        .with_context(|| "failed to show Windows toast notification")
}

#[cfg(target_os = "linux")]
#[derive(Clone)]
struct LinuxNotifier {
    app_name: String,
}

#[cfg(target_os = "linux")]
fn send_linux_notification(app_name: &str, title: &str, body: &str) -> anyhow::Result<()> {
    use anyhow::Context;
    use notify_rust::Notification;

    Notification::new()
        .appname(app_name)
        .summary(title)
        .body(body)
        .show()
        .map(|_| ())
        .with_context(|| "failed to show Linux desktop notification")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_takes_first_line() {
        assert_eq!(preview("Done.\nMore detail", "t1"), "Done.…");
        assert_eq!(preview("short", "t1"), "short");
        assert_eq!(preview("   \n", "t9"), "Task t9 finished with an empty reply");
    }

    #[test]
    fn test_noop_flush_returns() {
        let notifier = NoopNotifier;
        notifier.reply_ready("codex", "t1", "hi");
        notifier.flush();
    }
}
