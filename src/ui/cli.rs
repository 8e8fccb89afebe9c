//! Simple CLI output implementation
//!
//! Reply bodies go to stdout untouched so they can be piped; everything
//! decorative is colored and kept short.

use std::path::Path;
use std::time::Duration;

use colored::Colorize;

use super::format_age;
use crate::AppResult;
use crate::cache::CachedReply;
use crate::environment::EnvironmentFacts;
use crate::probe::PingOutcome;
use crate::session::{Session, SessionStatus};

/// Confirm a started or attached session
pub fn display_session_started(session: &Session) -> AppResult<()> {
    println!(
        "{} {} {} {}",
        "✅".green(),
        session.backend().bold(),
        "ready in".dimmed(),
        session.handle().to_string().cyan()
    );
    println!("   {} {}", "Command:".dimmed(), session.record.launch_command);
    Ok(())
}

/// Print a reply body verbatim
pub fn display_reply(text: &str) -> AppResult<()> {
    println!("{}", text);
    Ok(())
}

/// Acknowledge an asynchronous send
pub fn display_task_submitted(backend: &str, task_id: &str) -> AppResult<()> {
    println!("{}", task_id);
    eprintln!(
        "{} {} {} {}",
        "📨".normal(),
        "Sent to".dimmed(),
        backend.bold(),
        format!("(use `panebridge pend {}` for the reply)", backend).dimmed()
    );
    Ok(())
}

/// Latest cached reply, or a note that there is none
pub fn display_pending(backend: &str, reply: Option<&CachedReply>) -> AppResult<()> {
    match reply {
        Some(reply) => {
            eprintln!(
                "{} {} {}",
                format!("Task {}", reply.task_id).dimmed(),
                "completed".dimmed(),
                format_age(reply.completed_at).dimmed()
            );
            println!("{}", reply.text);
        }
        None => eprintln!("{} No reply cached for {}", "∅".yellow(), backend.bold()),
    }
    Ok(())
}

pub fn display_ping(backend: &str, outcome: &PingOutcome) -> AppResult<()> {
    match outcome {
        PingOutcome::Alive { latency } => println!(
            "{} {} connection OK ({} ms)",
            "✅".green(),
            backend.bold(),
            latency.as_millis()
        ),
        PingOutcome::Unreachable { reason } => println!(
            "{} {} unreachable: {}",
            "❌".red(),
            backend.bold(),
            reason
        ),
    }
    Ok(())
}

/// Table of recorded sessions
pub fn display_status(work_dir: &Path, rows: &[SessionStatus]) -> AppResult<()> {
    println!("🔍 Sessions in {}", work_dir.display().to_string().bold());
    if rows.is_empty() {
        println!("   (No sessions)");
        return Ok(());
    }

    for row in rows {
        let state = if !row.alive {
            "dead".red()
        } else if row.busy_with.is_some() {
            "busy".yellow()
        } else {
            "idle".green()
        };
        println!(
            "   {:<10} {:<6} {:<8} {:<24} {}",
            row.record.backend.bold(),
            state,
            row.record.mux.to_string(),
            row.record.pane_id,
            format_age(row.record.created_at).dimmed()
        );
        if let Some(task_id) = &row.busy_with {
            println!("   {:<10} {} {}", "", "task".dimmed(), task_id);
        }
    }
    Ok(())
}

pub fn display_killed(backend: &str, existed: bool) -> AppResult<()> {
    if existed {
        println!("{} Killed {} session", "🛑".normal(), backend.bold());
    } else {
        println!("{} No {} session recorded here", "ℹ️".normal(), backend.bold());
    }
    Ok(())
}

/// Detected host facts
pub fn display_environment(facts: &EnvironmentFacts) -> AppResult<()> {
    println!("🖥️  Environment");
    println!("   Platform:     {}", facts.platform.to_string().bold());
    println!("   WSL:          {}", facts.is_wsl);
    println!(
        "   Running in:   {}",
        facts
            .self_detected
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    let available = if facts.available.is_empty() {
        "none".red().to_string()
    } else {
        facts
            .available
            .iter()
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(" > ")
    };
    println!("   Multiplexers: {}", available);
    println!("   Shell:        {} {}", facts.shell.program, facts.shell.flag);
    if let Some(bin) = &facts.wezterm_bin {
        let suffix = if facts.wezterm_windows_exe {
            " (Windows build via WSL)"
        } else {
            ""
        };
        println!("   WezTerm:      {}{}", bin, suffix);
    }
    Ok(())
}

/// Progress line for a wait without a deadline
pub fn display_still_waiting(elapsed: Duration) {
    eprintln!(
        "{} {}",
        "⏳".normal(),
        format!("Still waiting... ({}s)", elapsed.as_secs()).dimmed()
    );
}

/// Error line on stderr
pub fn display_error(message: &str) {
    eprintln!("{} {}", "Error:".red().bold(), message);
}
