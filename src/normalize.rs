//! Message normalization.
//!
//! Turns a [`RawMessage`] from the upstream into the persisted [`Message`]
//! form: type classification, link extraction, the optional media download
//! and reaction reconciliation. Problems with individual fields never fail
//! the message; they degrade the field and come back as warnings.

use crate::error::{GrexError, Result};
use crate::model::{
    MediaInfo, Message, MessageType, RawMessage, ReactionSource, format_timestamp, user_part,
};
use crate::reactions::{MonitorIndex, ReactionReconciler};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::upstream::UpstreamClient;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

static LINK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("link pattern is valid"));

const MEDIA_TYPES: &[&str] = &["image", "video", "audio", "ptt", "document", "sticker"];

const SYSTEM_TYPES: &[&str] = &[
    "notification",
    "notification_template",
    "e2e_notification",
    "gp2",
    "group_notification",
    "call_log",
    "protocol",
    "revoked",
    "ciphertext",
];

/// Classify an upstream type string.
#[must_use]
pub fn classify(kind: &str, has_media: bool) -> MessageType {
    let kind = kind.to_ascii_lowercase();
    if kind == "chat" || kind == "text" {
        MessageType::Text
    } else if MEDIA_TYPES.contains(&kind.as_str()) {
        MessageType::Media
    } else if SYSTEM_TYPES.contains(&kind.as_str()) {
        MessageType::System
    } else if has_media {
        MessageType::Media
    } else {
        MessageType::Other
    }
}

/// Extract URLs from a message body, in order of appearance.
#[must_use]
pub fn extract_links(body: &str) -> Vec<String> {
    LINK_PATTERN
        .find_iter(body)
        .map(|m| trim_link(m.as_str()))
        .filter(|link| link.contains("://") && !link.ends_with("://"))
        .map(str::to_string)
        .collect()
}

/// Strip sentence punctuation and unbalanced closers off the end of a link.
fn trim_link(link: &str) -> &str {
    let mut link = link;
    loop {
        let Some(last) = link.chars().last() else {
            return link;
        };
        let trim = match last {
            '.' | ',' | ';' | ':' | '!' | '?' | '"' | '\'' => true,
            ')' => link.matches('(').count() < link.matches(')').count(),
            ']' => link.matches('[').count() < link.matches(']').count(),
            '}' => link.matches('{').count() < link.matches('}').count(),
            '>' => link.matches('<').count() < link.matches('>').count(),
            _ => false,
        };
        if !trim {
            return link;
        }
        link = &link[..link.len() - last.len_utf8()];
    }
}

/// Build the normalized record without any upstream work.
#[must_use]
pub fn to_message(raw: &RawMessage, chat_id: &str) -> Message {
    let author_id = raw.author_id().to_string();
    let author_phone = Some(user_part(&author_id).to_string()).filter(|p| !p.is_empty());
    Message {
        id: raw.id.clone(),
        timestamp: raw.timestamp,
        date: format_timestamp(raw.timestamp),
        chat_id: chat_id.to_string(),
        author_phone,
        author_id,
        body: raw.body.clone(),
        kind: classify(&raw.kind, raw.has_media),
        has_media: raw.has_media,
        has_reaction: raw.has_reaction,
        device_type: raw.device_type.clone(),
        links: extract_links(&raw.body),
        media: None,
        reactions: Vec::new(),
        reaction_source: ReactionSource::None,
        mentioned_ids: raw.mentioned_ids.iter().cloned().collect(),
        is_forwarded: raw.is_forwarded,
        is_starred: raw.is_starred,
        is_gif: raw.is_gif,
    }
}

/// Upstream handles a normalization needs.
#[derive(Clone, Copy)]
pub struct NormalizeContext<'a> {
    pub upstream: &'a dyn UpstreamClient,
    pub retry: &'a RetryPolicy,
    pub shutdown: &'a ShutdownSignal,
    pub monitor: &'a MonitorIndex,
}

/// A normalized message plus the non-fatal problems hit on the way.
#[derive(Debug)]
pub struct Normalized {
    pub message: Message,
    /// [`GrexError::PartialData`] for each field that had to be degraded.
    pub warnings: Vec<GrexError>,
}

/// Message normalizer.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub reconciler: ReactionReconciler,
    pub download_media: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            reconciler: ReactionReconciler::default(),
            download_media: true,
        }
    }
}

impl Normalizer {
    #[must_use]
    pub const fn new(reconciler: ReactionReconciler, download_media: bool) -> Self {
        Self {
            reconciler,
            download_media,
        }
    }

    /// Normalize `raw`, or return `None` for ids already in `seen` and for
    /// records without an id. Seen ids are rejected before any upstream call.
    ///
    /// # Errors
    ///
    /// Only a fatal authentication error is returned.
    pub async fn normalize(
        &self,
        raw: &RawMessage,
        chat_id: &str,
        seen: &HashSet<String>,
        ctx: NormalizeContext<'_>,
    ) -> Result<Option<Normalized>> {
        if raw.id.is_empty() {
            warn!("Skipping upstream record without an id");
            return Ok(None);
        }
        if seen.contains(&raw.id) {
            debug!(message_id = %raw.id, "Already extracted");
            return Ok(None);
        }

        let mut message = to_message(raw, chat_id);
        let mut warnings = Vec::new();

        if raw.has_media && self.download_media {
            let description = format!("download media for {}", raw.id);
            match ctx
                .retry
                .execute(&description, ctx.shutdown, || {
                    ctx.upstream.download_media(&raw.id)
                })
                .await
            {
                Ok(blob) => message.media = Some(MediaInfo::from_blob(&blob)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(message_id = %raw.id, "Could not download media: {}", e);
                    warnings.push(GrexError::partial(&raw.id, "media", e.to_string()));
                    message.media = Some(MediaInfo::download_failed());
                }
            }
        }

        let reconciled = self
            .reconciler
            .reconcile(raw, ctx.upstream, ctx.retry, ctx.shutdown, ctx.monitor)
            .await?;
        message.reactions = reconciled.reactions;
        message.reaction_source = reconciled.source;
        warnings.extend(reconciled.warning);

        Ok(Some(Normalized { message, warnings }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MediaBlob, RawReaction, RawReactor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingUpstream {
        media_fails: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for CountingUpstream {
        async fn fetch_recent(&self, _chat_id: &str, _limit: usize) -> Result<Vec<RawMessage>> {
            Ok(Vec::new())
        }

        async fn fetch_reactions(&self, _message_id: &str) -> Result<Vec<RawReaction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawReaction {
                emoji: "👍".to_string(),
                reactors: vec![RawReactor {
                    id: "9@c.us".to_string(),
                    phone: None,
                }],
            }])
        }

        async fn download_media(&self, _message_id: &str) -> Result<MediaBlob> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.media_fails {
                Err(GrexError::transient("download media", "connection reset"))
            } else {
                Ok(MediaBlob {
                    mimetype: "image/jpeg".to_string(),
                    filename: Some("a.jpg".to_string()),
                    data: vec![0; 2048],
                })
            }
        }
    }

    fn raw(id: &str, kind: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            timestamp: 1_700_000_000,
            from: "g@g.us".to_string(),
            author: Some("15550001@c.us".to_string()),
            body: "see https://example.com/a.".to_string(),
            kind: kind.to_string(),
            ..RawMessage::default()
        }
    }

    async fn normalize(
        normalizer: Normalizer,
        raw: &RawMessage,
        seen: &HashSet<String>,
        upstream: &CountingUpstream,
    ) -> Result<Option<Normalized>> {
        let retry = RetryPolicy::new(2, Duration::from_millis(100), 2.0);
        let shutdown = ShutdownSignal::never();
        let monitor = MonitorIndex::default();
        let ctx = NormalizeContext {
            upstream,
            retry: &retry,
            shutdown: &shutdown,
            monitor: &monitor,
        };
        normalizer.normalize(raw, "g@g.us", seen, ctx).await
    }

    #[test]
    fn classification_covers_known_types() {
        assert_eq!(classify("chat", false), MessageType::Text);
        assert_eq!(classify("image", true), MessageType::Media);
        assert_eq!(classify("ptt", true), MessageType::Media);
        assert_eq!(classify("e2e_notification", false), MessageType::System);
        assert_eq!(classify("revoked", false), MessageType::System);
        assert_eq!(classify("poll_creation", false), MessageType::Other);
        assert_eq!(classify("mystery", true), MessageType::Media);
    }

    #[test]
    fn links_are_extracted_in_order_and_trimmed() {
        let links = extract_links(
            "Read https://a.example/x, then (see http://b.example/wiki/Foo_(bar)) and https://c.example/?q=1!",
        );
        assert_eq!(
            links,
            vec![
                "https://a.example/x",
                "http://b.example/wiki/Foo_(bar)",
                "https://c.example/?q=1",
            ]
        );
    }

    #[test]
    fn bodies_without_links_yield_nothing() {
        assert!(extract_links("no links here, just ftp://old.example").is_empty());
        assert!(extract_links("").is_empty());
    }

    #[test]
    fn to_message_copies_flags_and_author() {
        let mut record = raw("m1", "chat");
        record.is_forwarded = true;
        record.mentioned_ids = vec![
            "b@c.us".to_string(),
            "a@c.us".to_string(),
            "a@c.us".to_string(),
        ];
        let message = to_message(&record, "g@g.us");
        assert_eq!(message.author_id, "15550001@c.us");
        assert_eq!(message.author_phone.as_deref(), Some("15550001"));
        assert_eq!(message.kind, MessageType::Text);
        assert_eq!(message.links, vec!["https://example.com/a"]);
        assert_eq!(message.mentioned_ids.len(), 2);
        assert!(message.is_forwarded);
        assert_eq!(message.date, "2023-11-14T22:13:20Z");
    }

    #[tokio::test(start_paused = true)]
    async fn seen_ids_are_skipped_before_any_upstream_call() {
        let upstream = CountingUpstream::default();
        let mut record = raw("m1", "image");
        record.has_media = true;
        record.has_reaction = true;
        let seen: HashSet<String> = std::iter::once("m1".to_string()).collect();

        let result = normalize(Normalizer::default(), &record, &seen, &upstream)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ids_are_rejected() {
        let upstream = CountingUpstream::default();
        let record = raw("", "chat");
        let result = normalize(Normalizer::default(), &record, &HashSet::new(), &upstream)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn media_metadata_is_recorded() {
        let upstream = CountingUpstream::default();
        let mut record = raw("m1", "image");
        record.has_media = true;

        let normalized = normalize(Normalizer::default(), &record, &HashSet::new(), &upstream)
            .await
            .unwrap()
            .unwrap();
        let media = normalized.message.media.unwrap();
        assert_eq!(media.mimetype, "image/jpeg");
        assert_eq!(media.size, Some(2048));
        assert!(normalized.warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_degrades_to_marker() {
        let upstream = CountingUpstream {
            media_fails: true,
            ..CountingUpstream::default()
        };
        let mut record = raw("m1", "video");
        record.has_media = true;

        let normalized = normalize(Normalizer::default(), &record, &HashSet::new(), &upstream)
            .await
            .unwrap()
            .unwrap();
        assert!(normalized.message.media.unwrap().is_error());
        assert_eq!(normalized.warnings.len(), 1);
        assert!(matches!(
            &normalized.warnings[0],
            GrexError::PartialData { field: "media", message_id, .. } if message_id == "m1"
        ));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn media_download_can_be_disabled() {
        let upstream = CountingUpstream::default();
        let mut record = raw("m1", "image");
        record.has_media = true;

        let normalizer = Normalizer::new(ReactionReconciler::default(), false);
        let normalized = normalize(normalizer, &record, &HashSet::new(), &upstream)
            .await
            .unwrap()
            .unwrap();
        assert!(normalized.message.media.is_none());
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flagged_reactions_are_fetched() {
        let upstream = CountingUpstream::default();
        let mut record = raw("m1", "chat");
        record.has_reaction = true;

        let normalized = normalize(Normalizer::default(), &record, &HashSet::new(), &upstream)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(normalized.message.reaction_source, ReactionSource::Fetched);
        assert_eq!(normalized.message.reactions[0].reactors[0].phone, "9");
    }
}
