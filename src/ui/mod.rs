//! User Interface module
//!
//! Plain command-line output for command results.

/// Simple CLI output functions
pub mod cli;

use chrono::{DateTime, Utc};

/// Human-readable age such as `3m ago`
pub fn format_age(at: DateTime<Utc>) -> String {
    format_age_since(at, Utc::now())
}

fn format_age_since(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{}s ago", secs),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
