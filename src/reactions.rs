//! Reaction reconciliation.
//!
//! Reactions reach us from two places: the message record itself (or a
//! direct re-fetch through the upstream), and the reaction-monitor dataset,
//! a JSON array appended by an independent observer that records reactions
//! as they happen. The upstream is unreliable for historical messages, so
//! the monitor dataset is the fallback when the upstream has nothing.

use crate::error::{GrexError, Result};
use crate::model::{RawMessage, RawReaction, Reaction, ReactionSource, Reactor};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::upstream::UpstreamClient;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

// =============================================================================
// Monitor dataset
// =============================================================================

/// One record written by the reaction observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredReaction {
    #[serde(default)]
    pub reaction_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub emoji: String,
    pub sender: ReactionSender,
    #[serde(default)]
    pub original_message: Option<OriginalMessage>,
}

/// Who reacted, as recorded by the observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSender {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
}

/// The message a recorded reaction points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalMessage {
    pub id: String,
    #[serde(default)]
    pub body: Option<String>,
}

/// Monitor records indexed by the id of the message they react to.
#[derive(Debug, Default)]
pub struct MonitorIndex {
    path: Option<PathBuf>,
    modified: Option<SystemTime>,
    by_message: HashMap<String, Vec<MonitoredReaction>>,
    records: usize,
}

impl MonitorIndex {
    /// Load the dataset at `path`. A missing or unreadable file gives an
    /// empty index; the extractor then relies on the upstream alone.
    pub fn load(path: &Path) -> Self {
        let mut index = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };
        index.reload();
        index
    }

    /// Build an index from records already in memory.
    pub fn from_records(records: impl IntoIterator<Item = MonitoredReaction>) -> Self {
        let mut index = Self::default();
        index.rebuild(records);
        index
    }

    /// Re-read the file if its modification time moved. Returns whether the
    /// index was reloaded.
    pub fn refresh_if_changed(&mut self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if modified.is_none() || modified == self.modified {
            return false;
        }
        self.reload();
        true
    }

    /// Reactions recorded for `message_id`.
    #[must_use]
    pub fn get(&self, message_id: &str) -> &[MonitoredReaction] {
        self.by_message
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of messages with at least one recorded reaction.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.by_message.len()
    }

    /// Number of distinct reaction records.
    #[must_use]
    pub const fn record_count(&self) -> usize {
        self.records
    }

    fn reload(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        self.modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No reaction monitor data at {}, using upstream reactions only",
                    path.display()
                );
                self.rebuild(Vec::new());
                return;
            }
            Err(e) => {
                warn!(
                    "Could not read reaction monitor data {}: {}",
                    path.display(),
                    e
                );
                return;
            }
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(values) => values,
            Err(e) => {
                warn!(
                    "Could not parse reaction monitor data {}: {}",
                    path.display(),
                    e
                );
                return;
            }
        };

        let total = values.len();
        let records: Vec<MonitoredReaction> = values
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        if records.len() < total {
            warn!(
                skipped = total - records.len(),
                "Skipped malformed reaction monitor records"
            );
        }

        self.rebuild(records);
        info!(
            messages = self.by_message.len(),
            records = self.records,
            "Loaded reaction monitor data"
        );
    }

    fn rebuild(&mut self, records: impl IntoIterator<Item = MonitoredReaction>) {
        let mut seen_ids = HashSet::new();
        let mut by_message: HashMap<String, Vec<MonitoredReaction>> = HashMap::new();
        let mut count = 0;

        for record in records {
            let Some(message_id) = record.original_message.as_ref().map(|m| m.id.clone()) else {
                continue;
            };
            if let Some(reaction_id) = &record.reaction_id {
                if !seen_ids.insert(reaction_id.clone()) {
                    continue;
                }
            }
            by_message.entry(message_id).or_default().push(record);
            count += 1;
        }

        self.by_message = by_message;
        self.records = count;
    }
}

// =============================================================================
// Grouping
// =============================================================================

/// Group `(emoji, reactor)` pairs by emoji, in first-seen order. Empty emoji
/// (a removed reaction) are dropped and each reactor appears at most once
/// per emoji.
fn group_by_emoji(pairs: impl IntoIterator<Item = (String, Reactor)>) -> Vec<Reaction> {
    let mut groups: Vec<Reaction> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (emoji, reactor) in pairs {
        if emoji.is_empty() {
            continue;
        }
        let position = *positions.entry(emoji.clone()).or_insert_with(|| {
            groups.push(Reaction {
                emoji,
                reactors: Vec::new(),
            });
            groups.len() - 1
        });
        let group = &mut groups[position];
        if !group.reactors.iter().any(|r| r.id == reactor.id) {
            group.reactors.push(reactor);
        }
    }

    groups
}

/// Normalize reaction groups reported by the upstream.
#[must_use]
pub fn group_upstream(reactions: &[RawReaction]) -> Vec<Reaction> {
    group_by_emoji(reactions.iter().flat_map(|reaction| {
        reaction.reactors.iter().map(|reactor| {
            (
                reaction.emoji.clone(),
                Reactor::new(reactor.id.clone(), reactor.phone.as_deref()),
            )
        })
    }))
}

/// Regroup flat monitor records by emoji.
#[must_use]
pub fn group_monitored(records: &[MonitoredReaction]) -> Vec<Reaction> {
    group_by_emoji(records.iter().map(|record| {
        (
            record.emoji.clone(),
            Reactor::new(record.sender.id.clone(), record.sender.number.as_deref()),
        )
    }))
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reactions chosen for one message.
#[derive(Debug)]
pub struct Reconciled {
    pub reactions: Vec<Reaction>,
    pub source: ReactionSource,
    /// Failed direct fetch, as a [`GrexError::PartialData`] for the run log.
    pub warning: Option<GrexError>,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Inline,
    Fetch,
}

/// Applies the reaction precedence rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReactionReconciler {
    /// Try a live fetch before trusting the inline snapshot.
    pub prefer_live: bool,
}

impl ReactionReconciler {
    #[must_use]
    pub const fn new(prefer_live: bool) -> Self {
        Self { prefer_live }
    }

    /// Pick the reactions for `raw`: inline list, then a direct fetch, then
    /// the monitor dataset, then nothing. With `prefer_live` the first two
    /// steps swap places.
    ///
    /// # Errors
    ///
    /// Only a fatal authentication error from the direct fetch is returned.
    pub async fn reconcile(
        &self,
        raw: &RawMessage,
        upstream: &dyn UpstreamClient,
        retry: &RetryPolicy,
        shutdown: &ShutdownSignal,
        monitor: &MonitorIndex,
    ) -> Result<Reconciled> {
        let order = if self.prefer_live {
            [Step::Fetch, Step::Inline]
        } else {
            [Step::Inline, Step::Fetch]
        };
        let mut warning = None;

        for step in order {
            match step {
                Step::Inline => {
                    let reactions = group_upstream(&raw.reactions);
                    if !reactions.is_empty() {
                        return Ok(Reconciled {
                            reactions,
                            source: ReactionSource::Inline,
                            warning,
                        });
                    }
                }
                Step::Fetch => {
                    if !raw.has_reaction {
                        continue;
                    }
                    let description = format!("fetch reactions for {}", raw.id);
                    match retry
                        .execute(&description, shutdown, || upstream.fetch_reactions(&raw.id))
                        .await
                    {
                        Ok(fetched) => {
                            let reactions = group_upstream(&fetched);
                            if !reactions.is_empty() {
                                return Ok(Reconciled {
                                    reactions,
                                    source: ReactionSource::Fetched,
                                    warning,
                                });
                            }
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(message_id = %raw.id, "Could not fetch reactions: {}", e);
                            warning = Some(GrexError::partial(&raw.id, "reactions", e.to_string()));
                        }
                    }
                }
            }
        }

        let reactions = group_monitored(monitor.get(&raw.id));
        if !reactions.is_empty() {
            debug!(
                message_id = %raw.id,
                kinds = reactions.len(),
                "Used reaction monitor data"
            );
            return Ok(Reconciled {
                reactions,
                source: ReactionSource::Monitor,
                warning,
            });
        }

        Ok(Reconciled {
            reactions: Vec::new(),
            source: ReactionSource::None,
            warning,
        })
    }
}
