//! Checkpoint summaries for `grex status`.

use crate::checkpoint::Loaded;
use crate::model::{Membership, MessageType, ReactionSource, RunError, format_timestamp};
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// What the data directory currently holds.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total_messages: usize,
    pub text_messages: usize,
    pub media_messages: usize,
    pub system_messages: usize,
    pub other_messages: usize,
    pub failed_media: usize,
    pub links: usize,
    pub messages_with_reactions: usize,
    pub reactions_from_monitor: usize,
    pub current_participants: usize,
    pub former_participants: usize,
    pub oldest_message: Option<String>,
    pub newest_message: Option<String>,
    pub watermark: Option<i64>,
    pub last_run: Option<LastRun>,
    pub previous_runs: usize,
    pub recent_errors: Vec<RunError>,
}

/// Highlights of the most recent run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastRun {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub messages_extracted: u64,
    pub batches_fetched: u64,
    pub error_count: usize,
}

/// Summarize a loaded checkpoint, keeping at most `max_errors` of the last
/// run's errors (newest last).
#[must_use]
pub fn summarize(loaded: &Loaded, max_errors: usize) -> StatusReport {
    let mut report = StatusReport {
        total_messages: loaded.messages.len(),
        watermark: loaded.watermark(),
        previous_runs: loaded.history.len(),
        ..StatusReport::default()
    };

    for message in &loaded.messages {
        match message.kind {
            MessageType::Text => report.text_messages += 1,
            MessageType::Media => report.media_messages += 1,
            MessageType::System => report.system_messages += 1,
            MessageType::Other => report.other_messages += 1,
        }
        if message.media.as_ref().is_some_and(|m| m.is_error()) {
            report.failed_media += 1;
        }
        report.links += message.links.len();
        if !message.reactions.is_empty() {
            report.messages_with_reactions += 1;
        }
        if message.reaction_source == ReactionSource::Monitor {
            report.reactions_from_monitor += 1;
        }
    }

    let timestamps = loaded.messages.iter().map(|m| m.timestamp);
    report.oldest_message = timestamps.clone().min().map(format_timestamp);
    report.newest_message = timestamps.max().map(format_timestamp);

    let roster = Roster::from_participants(loaded.participants.clone());
    report.current_participants = roster.count(Membership::Current);
    report.former_participants = roster.count(Membership::Former);

    if let Some(run) = &loaded.last_run {
        report.last_run = Some(LastRun {
            start_time: run.start_time,
            end_time: run.end_time,
            messages_extracted: run.messages_extracted,
            batches_fetched: run.batches_fetched,
            error_count: run.error_count(),
        });
        let skip = run.errors.len().saturating_sub(max_errors);
        report.recent_errors = run.errors.iter().skip(skip).cloned().collect();
    }

    report
}
