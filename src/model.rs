//! Data models for extracted group activity.
//!
//! `Raw*` structures mirror what the session bridge hands back; everything
//! else is the normalized form that is checkpointed to disk and read by the
//! downstream report generators. All persisted structures use camelCase keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// A normalized message from the monitored chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub date: String,
    pub chat_id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_phone: Option<String>,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub has_media: bool,
    #[serde(default)]
    pub has_reaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    pub links: Vec<String>,
    pub media: Option<MediaInfo>,
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reaction_source: ReactionSource,
    pub mentioned_ids: BTreeSet<String>,
    pub is_forwarded: bool,
    pub is_starred: bool,
    pub is_gif: bool,
}

/// Coarse message classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Media,
    System,
    Other,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Media => write!(f, "media"),
            Self::System => write!(f, "system"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Media metadata, or an error marker when the download failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub mimetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MediaInfo {
    /// Metadata for a successfully downloaded blob.
    #[must_use]
    pub fn from_blob(blob: &MediaBlob) -> Self {
        Self {
            mimetype: blob.mimetype.clone(),
            filename: blob.filename.clone(),
            size: Some(blob.data.len() as u64),
            error: None,
        }
    }

    /// Marker stored when the download could not be completed.
    #[must_use]
    pub fn download_failed() -> Self {
        Self {
            mimetype: "unknown".to_string(),
            filename: None,
            size: None,
            error: Some("Could not download media".to_string()),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// All reactions with one emoji on one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub reactors: Vec<Reactor>,
}

/// A participant who reacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reactor {
    pub id: String,
    pub phone: String,
}

impl Reactor {
    pub fn new(id: impl Into<String>, phone: Option<&str>) -> Self {
        let id = id.into();
        let phone = phone
            .filter(|p| !p.is_empty())
            .map_or_else(|| user_part(&id).to_string(), str::to_string);
        Self { id, phone }
    }
}

/// Which reconciliation step produced a message's reactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionSource {
    Inline,
    Fetched,
    Monitor,
    #[default]
    None,
}

impl std::fmt::Display for ReactionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Fetched => write!(f, "fetched"),
            Self::Monitor => write!(f, "monitor"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A member of the chat, current or inferred former
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
    pub phone_number: String,
    pub is_admin: bool,
    pub is_super_admin: bool,
    pub membership: Membership,
}

/// Roster membership status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Current,
    Former,
}

// =============================================================================
// Upstream records
// =============================================================================

/// A message record as returned by the session bridge
///
/// The bridge sends `null` for fields it has no value for, so every
/// non-optional field reads `null` as its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawMessage {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub from: String,
    pub author: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub has_media: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub has_reaction: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub reactions: Vec<RawReaction>,
    #[serde(deserialize_with = "null_as_default")]
    pub mentioned_ids: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_forwarded: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_starred: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_gif: bool,
    pub device_type: Option<String>,
}

impl RawMessage {
    /// The author id, falling back to the sender for one-to-one chats.
    #[must_use]
    pub fn author_id(&self) -> &str {
        self.author
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.from)
    }
}

/// A reaction group as returned by the session bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawReaction {
    #[serde(deserialize_with = "null_as_default")]
    pub emoji: String,
    #[serde(deserialize_with = "null_as_default")]
    pub reactors: Vec<RawReactor>,
}

/// A reactor as returned by the session bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawReactor {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    pub phone: Option<String>,
}

/// A roster entry as returned by the session bridge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawParticipant {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    pub name: Option<String>,
    pub number: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_admin: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub is_super_admin: bool,
}

/// Read an explicit `null` the same way as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Downloaded media payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub mimetype: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

// =============================================================================
// Run state
// =============================================================================

/// Most error entries kept per run; older entries are dropped first.
pub const MAX_RUN_ERRORS: usize = 200;

/// One entry in a run's error log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "error")]
    pub message: String,
}

/// State of the current extraction process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionRun {
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub messages_extracted: u64,
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    /// Errors evicted from `errors` once the log hit its cap.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub errors_dropped: u64,
    pub batches_fetched: u64,
}

impl ExtractionRun {
    /// Start a run, resuming from a previous watermark if there is one.
    #[must_use]
    pub const fn start(start_time: DateTime<Utc>, watermark: Option<i64>) -> Self {
        Self {
            start_time,
            end_time: None,
            messages_extracted: 0,
            last_message_timestamp: watermark,
            errors: Vec::new(),
            errors_dropped: 0,
            batches_fetched: 0,
        }
    }

    /// Advance the watermark. Never moves it backwards.
    pub fn observe_timestamp(&mut self, timestamp: i64) {
        self.last_message_timestamp = Some(
            self.last_message_timestamp
                .map_or(timestamp, |current| current.max(timestamp)),
        );
    }

    /// Append a non-fatal error to the run log, keeping at most
    /// [`MAX_RUN_ERRORS`] entries.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(RunError {
            timestamp: Utc::now(),
            message: message.into(),
        });
        if self.errors.len() > MAX_RUN_ERRORS {
            let excess = self.errors.len() - MAX_RUN_ERRORS;
            self.errors.drain(..excess);
            self.errors_dropped += excess as u64;
        }
    }

    /// Errors seen this run, including ones evicted from the log.
    #[must_use]
    pub fn error_count(&self) -> usize {
        let dropped = usize::try_from(self.errors_dropped).unwrap_or(usize::MAX);
        self.errors.len().saturating_add(dropped)
    }

    /// Wall-clock time since the run started.
    #[must_use]
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(count: &u64) -> bool {
    *count == 0
}

/// Strip the server part from an id like `15551234567@c.us`.
#[must_use]
pub fn user_part(id: &str) -> &str {
    id.split_once('@').map_or(id, |(user, _)| user)
}

/// Render an epoch-seconds timestamp as RFC 3339.
#[must_use]
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}
