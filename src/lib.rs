//! grex - Incremental group chat activity extractor
//!
//! This library pulls the message history of one group chat out of a
//! messaging session bridge, enriches it with reactions, media metadata and
//! links, and keeps an append-only, crash-safe checkpoint on disk that
//! downstream report generators read.
//!
//! # Modules
//!
//! - [`upstream`] - Facade over the messaging provider and its HTTP bridge
//! - [`retry`] - Bounded exponential backoff
//! - [`negotiator`] - Cold-start batch-size ladder
//! - [`normalize`] - Raw record to [`Message`] conversion
//! - [`reactions`] - Reaction precedence and the monitor dataset
//! - [`checkpoint`] - Atomic JSON persistence
//! - [`orchestrator`] - The extraction state machine
//! - [`shutdown`] - Cooperative cancellation

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod negotiator;
pub mod normalize;
pub mod orchestrator;
pub mod reactions;
pub mod retry;
pub mod roster;
pub mod shutdown;
pub mod status;
pub mod upstream;

pub use checkpoint::{CheckpointFiles, CheckpointStore, JsonCheckpointStore, Loaded};
pub use cli::*;
pub use config::Config;
pub use error::{GrexError, Result, format_error};
pub use model::*;
pub use orchestrator::{ExitReason, Extractor, ExtractorSettings, Phase, RunReport};
pub use upstream::{HttpUpstream, UpstreamClient};

use chrono::{DateTime, Datelike, Utc};

/// Get the default data directory for grex
#[must_use]
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("grex")
}

/// Format an unsigned integer with thousands separators.
#[must_use]
pub fn format_number_u64(value: u64) -> String {
    let mut out = String::with_capacity(24);

    for (idx, ch) in value.to_string().chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }

    out.chars().rev().collect()
}

/// Format a usize with thousands separators.
#[must_use]
pub fn format_number_usize(value: usize) -> String {
    format_number_u64(u64::try_from(value).unwrap_or(u64::MAX))
}

/// Format a datetime as a human-friendly relative string.
///
/// - < 1 minute: "just now"
/// - < 1 hour: "Nm ago"
/// - < 24 hours: "Nh ago"
/// - < 7 days: "Nd ago"
/// - Same calendar year: "Mon D"
/// - Different year: "Mon D, YYYY"
#[must_use]
pub fn format_relative_date(dt: DateTime<Utc>) -> String {
    format_relative_date_with_base(dt, Utc::now())
}

/// Format a datetime relative to a fixed base time.
#[must_use]
pub fn format_relative_date_with_base(dt: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(dt);

    if duration.num_seconds() < 0 {
        return dt.format("%b %d, %Y").to_string();
    }

    let minutes = duration.num_minutes();
    let hours = duration.num_hours();
    let days = duration.num_days();

    if duration.num_seconds() < 60 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}m ago")
    } else if hours < 24 {
        format!("{hours}h ago")
    } else if days < 7 {
        format!("{days}d ago")
    } else if dt.year() == now.year() {
        dt.format("%b %d").to_string()
    } else {
        dt.format("%b %d, %Y").to_string()
    }
}

/// Format a duration as `1h 02m 03s`, dropping leading zero units.
#[must_use]
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}
