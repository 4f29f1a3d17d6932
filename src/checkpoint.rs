//! Checkpoint persistence.
//!
//! The extractor's state lives in three pretty-printed JSON documents in the
//! data directory:
//!
//! - **messages**: every extracted message, newest first, plus a header
//!   describing the current run
//! - **metadata**: the last run and a short history of earlier runs
//! - **participants**: the roster, including inferred former members
//!
//! Each document is written to a temporary file in the same directory,
//! flushed, and renamed over the previous generation. A crash at any point
//! leaves either the old or the new file, never a torn one. The messages
//! document is committed first so the metadata never points past it.

use crate::error::{GrexError, Result};
use crate::model::{ExtractionRun, Message, Participant};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Finished runs kept in the metadata document.
pub const MAX_RUN_HISTORY: usize = 50;

pub const DEFAULT_MESSAGES_FILE: &str = "messages_full.json";
pub const DEFAULT_METADATA_FILE: &str = "extraction_metadata.json";
pub const DEFAULT_PARTICIPANTS_FILE: &str = "participants.json";

// =============================================================================
// Documents
// =============================================================================

/// Header of the messages document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionInfo {
    pub chat_id: String,
    pub last_updated: DateTime<Utc>,
    pub total_messages: usize,
    pub current_run: ExtractionRun,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDocument {
    #[allow(dead_code)]
    extraction_info: Option<ExtractionInfo>,
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageDocumentRef<'a> {
    extraction_info: ExtractionInfo,
    messages: Vec<&'a Message>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub messages_extracted: u64,
    pub batches_fetched: u64,
    pub last_message_timestamp: Option<i64>,
    pub error_count: usize,
}

impl From<&ExtractionRun> for RunSummary {
    fn from(run: &ExtractionRun) -> Self {
        Self {
            start_time: run.start_time,
            end_time: run.end_time,
            messages_extracted: run.messages_extracted,
            batches_fetched: run.batches_fetched,
            last_message_timestamp: run.last_message_timestamp,
            error_count: run.error_count(),
        }
    }
}

/// Append `summary` to `history`, dropping the oldest entries past the cap.
pub fn append_history(history: &mut Vec<RunSummary>, summary: RunSummary) {
    history.push(summary);
    if history.len() > MAX_RUN_HISTORY {
        let excess = history.len() - MAX_RUN_HISTORY;
        history.drain(..excess);
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataDocument {
    last_run: ExtractionRun,
    #[serde(default)]
    extraction_history: Vec<RunSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantDocument {
    chat_id: String,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    participants: Vec<Participant>,
}

// =============================================================================
// Store interface
// =============================================================================

/// Everything recovered from disk.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub messages: Vec<Message>,
    pub last_run: Option<ExtractionRun>,
    pub history: Vec<RunSummary>,
    pub participants: Vec<Participant>,
}

impl Loaded {
    /// Resume point: the later of the recorded watermark and the newest
    /// stored message.
    #[must_use]
    pub fn watermark(&self) -> Option<i64> {
        let recorded = self
            .last_run
            .as_ref()
            .and_then(|r| r.last_message_timestamp);
        let newest = self.messages.iter().map(|m| m.timestamp).max();
        recorded.max(newest)
    }
}

/// State handed to the store for one save.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub chat_id: &'a str,
    pub messages: &'a [Message],
    pub run: &'a ExtractionRun,
    pub history: &'a [RunSummary],
    pub participants: &'a [Participant],
}

/// Durable storage for extractor state.
pub trait CheckpointStore: Send {
    /// Read the last committed state. A missing store is empty, not an error.
    ///
    /// # Errors
    ///
    /// Fails if the messages document exists but cannot be read or parsed.
    fn load(&self) -> Result<Loaded>;

    /// Atomically replace the stored state.
    ///
    /// # Errors
    ///
    /// Returns [`GrexError::Persistence`] if any document cannot be written.
    fn save(&mut self, snapshot: &Snapshot<'_>) -> Result<()>;
}

// =============================================================================
// JSON file store
// =============================================================================

/// Locations of the three checkpoint documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub messages: PathBuf,
    pub metadata: PathBuf,
    pub participants: PathBuf,
}

impl CheckpointFiles {
    /// Default file names inside `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            messages: dir.join(DEFAULT_MESSAGES_FILE),
            metadata: dir.join(DEFAULT_METADATA_FILE),
            participants: dir.join(DEFAULT_PARTICIPANTS_FILE),
        }
    }
}

/// Checkpoint store backed by JSON files.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    files: CheckpointFiles,
}

impl JsonCheckpointStore {
    #[must_use]
    pub const fn new(files: CheckpointFiles) -> Self {
        Self { files }
    }

    #[must_use]
    pub const fn files(&self) -> &CheckpointFiles {
        &self.files
    }

    fn load_messages(&self) -> Result<Vec<Message>> {
        let path = &self.files.messages;
        let Some(content) = read_optional(path)? else {
            return Ok(Vec::new());
        };
        let document: MessageDocument =
            serde_json::from_str(&content).map_err(|e| GrexError::CheckpointCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(document.messages)
    }

    fn render_messages(snapshot: &Snapshot<'_>) -> Result<Vec<u8>> {
        let mut messages: Vec<&Message> = snapshot.messages.iter().collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        let document = MessageDocumentRef {
            extraction_info: ExtractionInfo {
                chat_id: snapshot.chat_id.to_string(),
                last_updated: Utc::now(),
                total_messages: messages.len(),
                current_run: snapshot.run.clone(),
            },
            messages,
        };
        Ok(serde_json::to_vec_pretty(&document)?)
    }

    fn render_metadata(snapshot: &Snapshot<'_>) -> Result<Vec<u8>> {
        let document = MetadataDocument {
            last_run: snapshot.run.clone(),
            extraction_history: snapshot.history.to_vec(),
        };
        Ok(serde_json::to_vec_pretty(&document)?)
    }

    fn render_participants(snapshot: &Snapshot<'_>) -> Result<Vec<u8>> {
        let mut participants = snapshot.participants.to_vec();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        let document = ParticipantDocument {
            chat_id: snapshot.chat_id.to_string(),
            last_updated: Utc::now(),
            participants,
        };
        Ok(serde_json::to_vec_pretty(&document)?)
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn load(&self) -> Result<Loaded> {
        let messages = self.load_messages()?;
        let metadata: Option<MetadataDocument> = load_lenient(&self.files.metadata);
        let roster: Option<ParticipantDocument> = load_lenient(&self.files.participants);

        let (last_run, history) = match metadata {
            Some(doc) => (Some(doc.last_run), doc.extraction_history),
            None => (None, Vec::new()),
        };

        debug!(
            messages = messages.len(),
            has_metadata = last_run.is_some(),
            "Loaded checkpoint"
        );

        Ok(Loaded {
            messages,
            last_run,
            history,
            participants: roster.map(|doc| doc.participants).unwrap_or_default(),
        })
    }

    fn save(&mut self, snapshot: &Snapshot<'_>) -> Result<()> {
        let messages = Self::render_messages(snapshot)?;
        let metadata = Self::render_metadata(snapshot)?;
        let participants = Self::render_participants(snapshot)?;

        commit(
            stage(&self.files.messages, &messages)?,
            &self.files.messages,
        )?;
        commit(
            stage(&self.files.metadata, &metadata)?,
            &self.files.metadata,
        )?;
        commit(
            stage(&self.files.participants, &participants)?,
            &self.files.participants,
        )?;

        debug!(
            messages = snapshot.messages.len(),
            path = %self.files.messages.display(),
            "Checkpoint saved"
        );
        Ok(())
    }
}

/// Read a file, treating a missing one as `None`.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GrexError::path_error("read checkpoint", path, e)),
    }
}

/// Parse an auxiliary document; unreadable ones are logged and skipped.
fn load_lenient<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match read_optional(path) {
        Ok(content) => content?,
        Err(e) => {
            warn!("{}", e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                "Ignoring unreadable checkpoint file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

/// Write `content` to a flushed temporary file next to `path`.
fn stage(path: &Path, content: &[u8]) -> Result<NamedTempFile> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let failed = |e: std::io::Error| GrexError::persistence(path, e.to_string());

    std::fs::create_dir_all(parent).map_err(failed)?;
    let mut staged = NamedTempFile::new_in(parent).map_err(failed)?;
    staged.write_all(content).map_err(failed)?;
    staged.as_file().sync_all().map_err(failed)?;
    Ok(staged)
}

/// Rename a staged file over `path`.
fn commit(staged: NamedTempFile, path: &Path) -> Result<()> {
    staged
        .persist(path)
        .map(|_| ())
        .map_err(|e| GrexError::persistence(path, e.error.to_string()))
}
