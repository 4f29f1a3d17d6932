//! Extraction state machine.
//!
//! ```text
//! ColdStart ──▶ Processing ──▶ Monitoring ──▶ ShuttingDown ──▶ Terminated
//!     │             │              │               ▲
//!     └─────────────┴──────────────┴── cancel / ───┘
//!                                     auth revoked
//! ```
//!
//! One [`Extractor`] drives everything sequentially: it owns the in-memory
//! message collection, the seen-id set, the roster and the current run, and
//! is the only caller of the checkpoint store. Every wait goes through the
//! shutdown signal, so cancellation is noticed at each pause and no new
//! batch or poll begins afterwards. Whatever was collected is flushed with
//! exactly one save on the way out.

use crate::checkpoint::{CheckpointStore, RunSummary, Snapshot, append_history};
use crate::error::{GrexError, Result};
use crate::logging::OperationGuard;
use crate::model::{ExtractionRun, Message, RawMessage};
use crate::negotiator::BatchNegotiator;
use crate::normalize::{NormalizeContext, Normalized, Normalizer};
use crate::reactions::{MonitorIndex, ReactionReconciler};
use crate::retry::RetryPolicy;
use crate::roster::Roster;
use crate::shutdown::ShutdownSignal;
use crate::upstream::UpstreamClient;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Runtime knobs for one extractor.
#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub chat_id: String,
    pub retry: RetryPolicy,
    pub negotiator: BatchNegotiator,
    pub message_delay: Duration,
    pub progress_every: usize,
    pub progress_pause: Duration,
    pub monitoring_interval: Duration,
    pub monitor_batch_size: usize,
    pub download_media: bool,
    pub prefer_live_reactions: bool,
    /// Reaction monitor dataset; `None` disables the fallback.
    pub reactions_path: Option<PathBuf>,
}

impl ExtractorSettings {
    /// Default pacing for `chat_id`, without a reaction dataset.
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            retry: RetryPolicy::default(),
            negotiator: BatchNegotiator::default(),
            message_delay: Duration::from_millis(50),
            progress_every: 50,
            progress_pause: Duration::from_secs(1),
            monitoring_interval: Duration::from_secs(30),
            monitor_batch_size: 20,
            download_media: true,
            prefer_live_reactions: false,
            reactions_path: None,
        }
    }
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ColdStart,
    Processing,
    Monitoring,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ColdStart => write!(f, "cold start"),
            Self::Processing => write!(f, "processing"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why the extractor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested.
    Cancelled,
    /// The upstream session is no longer authorized.
    AuthRevoked,
    /// An unexpected error escaped the processing loop.
    Failed(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "shutdown requested"),
            Self::AuthRevoked => write!(f, "upstream authentication revoked"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Final statistics of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub reason: ExitReason,
    pub run: ExtractionRun,
    /// Messages held in the store after the final flush.
    pub total_messages: usize,
    /// Phases entered, in order.
    pub transitions: Vec<Phase>,
    /// Whether the final flush reached disk.
    pub flushed: bool,
}

impl RunReport {
    /// Process exit status for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.reason {
            ExitReason::Cancelled => 0,
            ExitReason::AuthRevoked | ExitReason::Failed(_) => 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    added: usize,
    interrupted: bool,
}

/// The extraction orchestrator.
pub struct Extractor {
    upstream: Arc<dyn UpstreamClient>,
    store: Box<dyn CheckpointStore>,
    settings: ExtractorSettings,
    shutdown: ShutdownSignal,
    normalizer: Normalizer,
    phase: Phase,
    transitions: Vec<Phase>,
    messages: Vec<Message>,
    seen: HashSet<String>,
    run: ExtractionRun,
    history: Vec<RunSummary>,
    roster: Roster,
    monitor: MonitorIndex,
    dirty: bool,
}

impl Extractor {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        store: Box<dyn CheckpointStore>,
        settings: ExtractorSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let normalizer = Normalizer::new(
            ReactionReconciler::new(settings.prefer_live_reactions),
            settings.download_media,
        );
        Self {
            upstream,
            store,
            settings,
            shutdown,
            normalizer,
            phase: Phase::ColdStart,
            transitions: Vec::new(),
            messages: Vec::new(),
            seen: HashSet::new(),
            run: ExtractionRun::start(Utc::now(), None),
            history: Vec::new(),
            roster: Roster::default(),
            monitor: MonitorIndex::default(),
            dirty: false,
        }
    }

    /// Run until shutdown or a fatal upstream error, then flush.
    ///
    /// # Errors
    ///
    /// Fails only if the checkpoint cannot be loaded; nothing is written in
    /// that case.
    pub async fn run(mut self) -> Result<RunReport> {
        self.enter(Phase::ColdStart);
        self.restore()?;

        let outcome = match self.cold_start().await {
            Ok(()) => self.monitor_loop().await,
            Err(e) => Err(e),
        };

        let reason = match outcome {
            Ok(()) => ExitReason::Cancelled,
            Err(e) if e.is_fatal() => {
                error!("Stopping: {}", e);
                self.run.record_error(e.to_string());
                ExitReason::AuthRevoked
            }
            Err(e) => {
                error!("Stopping after unexpected error: {}", e);
                self.run.record_error(e.to_string());
                ExitReason::Failed(e.to_string())
            }
        };

        Ok(self.shut_down(reason))
    }

    fn enter(&mut self, phase: Phase) {
        if self.transitions.last() != Some(&phase) {
            debug!(from = %self.phase, to = %phase, "Phase change");
            self.phase = phase;
            self.transitions.push(phase);
        }
    }

    fn restore(&mut self) -> Result<()> {
        let loaded = self.store.load()?;
        let watermark = loaded.watermark();

        self.seen = loaded.messages.iter().map(|m| m.id.clone()).collect();
        self.messages = loaded.messages;
        self.history = loaded.history;
        self.roster = Roster::from_participants(loaded.participants);
        self.run = ExtractionRun::start(Utc::now(), watermark);

        if let Some(path) = &self.settings.reactions_path {
            self.monitor = MonitorIndex::load(path);
            info!(
                messages = self.monitor.message_count(),
                records = self.monitor.record_count(),
                "Loaded reaction monitor data"
            );
        }

        info!(
            messages = self.messages.len(),
            watermark = ?watermark,
            participants = self.roster.len(),
            "Resumed from checkpoint"
        );
        Ok(())
    }

    async fn refresh_roster(&mut self) -> Result<()> {
        let fetched = self
            .settings
            .retry
            .execute("fetch participants", &self.shutdown, || {
                self.upstream.fetch_participants(&self.settings.chat_id)
            })
            .await;

        match fetched {
            Ok(list) if list.is_empty() => {
                debug!("No participant list from upstream, keeping stored roster");
            }
            Ok(list) => {
                self.roster.merge_current(&list);
                info!(
                    participants = list.len(),
                    known = self.roster.len(),
                    "Updated roster"
                );
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not fetch participants: {}", e);
                self.run
                    .record_error(format!("Could not fetch participants: {e}"));
            }
        }
        Ok(())
    }

    async fn cold_start(&mut self) -> Result<()> {
        let guard = OperationGuard::new("cold start");
        self.refresh_roster().await?;
        debug!(ladder = ?self.settings.negotiator.sizes(), "Negotiating batch size");

        let negotiated = match self
            .settings
            .negotiator
            .negotiate(
                self.upstream.as_ref(),
                &self.settings.chat_id,
                &self.settings.retry,
                &self.shutdown,
            )
            .await
        {
            Ok(negotiated) => negotiated,
            Err(e) => {
                guard.fail(&e);
                return Err(e);
            }
        };

        for failure in negotiated.failures() {
            self.run.record_error(failure);
        }
        if negotiated.batch_size.is_none() {
            info!("Cold start produced no messages");
            guard.complete();
            return Ok(());
        }
        self.run.batches_fetched += 1;

        self.enter(Phase::Processing);
        let outcome = match self.process_batch(&negotiated.messages).await {
            Ok(outcome) => outcome,
            Err(e) => {
                guard.fail(&e);
                return Err(e);
            }
        };

        if outcome.interrupted {
            info!(
                added = outcome.added,
                "Cold start interrupted, leaving the save to shutdown"
            );
        } else {
            info!(added = outcome.added, "Cold start batch processed");
            self.persist();
        }
        guard.complete();
        Ok(())
    }

    async fn monitor_loop(&mut self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        self.enter(Phase::Monitoring);
        info!(
            interval_secs = self.settings.monitoring_interval.as_secs(),
            "Monitoring for new messages"
        );

        loop {
            if self
                .shutdown
                .pause(self.settings.monitoring_interval)
                .await
                .is_cancelled()
            {
                return Ok(());
            }

            if self.monitor.refresh_if_changed() {
                debug!(
                    messages = self.monitor.message_count(),
                    records = self.monitor.record_count(),
                    "Reloaded reaction monitor data"
                );
            }

            let fetched = self
                .settings
                .retry
                .execute("monitor fetch", &self.shutdown, || {
                    self.upstream
                        .fetch_recent(&self.settings.chat_id, self.settings.monitor_batch_size)
                })
                .await;

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Monitoring fetch failed: {}", e);
                    self.run
                        .record_error(format!("Monitoring fetch failed: {e}"));
                    if self
                        .shutdown
                        .pause(self.settings.monitoring_interval)
                        .await
                        .is_cancelled()
                    {
                        return Ok(());
                    }
                    continue;
                }
            };
            self.run.batches_fetched += 1;

            let fresh: Vec<RawMessage> = batch
                .into_iter()
                .filter(|raw| !self.seen.contains(&raw.id))
                .collect();
            if fresh.is_empty() {
                debug!("No new messages");
                if self.dirty {
                    self.persist();
                }
                continue;
            }

            info!(count = fresh.len(), "Found {} new messages", fresh.len());
            let outcome = self.process_batch(&fresh).await?;
            if outcome.interrupted {
                return Ok(());
            }
            if outcome.added > 0 || self.dirty {
                self.persist();
            }
        }
    }

    /// Normalize and append every unseen message of `batch`, in order.
    async fn process_batch(&mut self, batch: &[RawMessage]) -> Result<BatchOutcome> {
        let total = batch.len();
        let mut outcome = BatchOutcome::default();

        for (index, raw) in batch.iter().enumerate() {
            if self.shutdown.is_triggered() {
                outcome.interrupted = true;
                break;
            }

            let ctx = NormalizeContext {
                upstream: self.upstream.as_ref(),
                retry: &self.settings.retry,
                shutdown: &self.shutdown,
                monitor: &self.monitor,
            };
            let normalized = match self
                .normalizer
                .normalize(raw, &self.settings.chat_id, &self.seen, ctx)
                .await
            {
                Ok(Some(normalized)) => normalized,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(message_id = %raw.id, "Failed to process message: {}", e);
                    self.run
                        .record_error(format!("Failed to process message {}: {e}", raw.id));
                    continue;
                }
            };
            self.accept(normalized);
            outcome.added += 1;

            let processed = index + 1;
            let every = self.settings.progress_every;
            let pause = if every > 0 && processed % every == 0 {
                crate::log_progress!(
                    processed,
                    total,
                    "Processed {} of {} messages",
                    processed,
                    total
                );
                self.settings.progress_pause
            } else {
                self.settings.message_delay
            };
            if self.shutdown.pause(pause).await.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
        }

        Ok(outcome)
    }

    fn accept(&mut self, normalized: Normalized) {
        for warning in normalized.warnings {
            self.run.record_error(warning.to_string());
        }
        let message = normalized.message;
        if self.roster.observe_author(&message.author_id) {
            debug!(
                author_id = %message.author_id,
                "Author not in roster, recorded as former member"
            );
        }
        self.run.observe_timestamp(message.timestamp);
        self.run.messages_extracted += 1;
        self.seen.insert(message.id.clone());
        self.messages.push(message);
        self.dirty = true;
    }

    /// Save current state, retrying once. On a second failure the state is
    /// kept in memory and `dirty` stays set for the next cycle.
    fn persist(&mut self) -> bool {
        let participants = self.roster.participants();
        let mut last_error: Option<GrexError> = None;

        for attempt in 1..=2 {
            let snapshot = Snapshot {
                chat_id: &self.settings.chat_id,
                messages: &self.messages,
                run: &self.run,
                history: &self.history,
                participants: &participants,
            };
            match self.store.save(&snapshot) {
                Ok(()) => {
                    self.dirty = false;
                    debug!(messages = self.messages.len(), "Checkpoint written");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, "Checkpoint save failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            error!("Keeping state in memory after failed save: {}", e);
            self.run.record_error(e.to_string());
        }
        false
    }

    fn shut_down(mut self, reason: ExitReason) -> RunReport {
        self.enter(Phase::ShuttingDown);
        self.run.end_time = Some(Utc::now());
        append_history(&mut self.history, RunSummary::from(&self.run));
        let flushed = self.persist();

        let elapsed = self.run.elapsed(Utc::now());
        info!(
            reason = %reason,
            messages_extracted = self.run.messages_extracted,
            batches_fetched = self.run.batches_fetched,
            total_messages = self.messages.len(),
            elapsed_secs = elapsed.num_seconds(),
            errors = self.run.errors.len(),
            "Extraction finished"
        );

        self.enter(Phase::Terminated);
        RunReport {
            reason,
            total_messages: self.messages.len(),
            run: self.run,
            transitions: self.transitions,
            flushed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Loaded;
    use crate::model::{
        MediaBlob, Membership, Participant, RawParticipant, RawReaction, ReactionSource,
    };
    use crate::shutdown::{self, ShutdownTrigger};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MONITOR_LIMIT: usize = 20;

    fn raw(id: &str, timestamp: i64, author: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            timestamp,
            from: "g@g.us".to_string(),
            author: Some(author.to_string()),
            body: format!("message {id}"),
            kind: "chat".to_string(),
            ..RawMessage::default()
        }
    }

    /// Scripted upstream: the cold-start ladder sees `history`, monitor
    /// polls see `recent`.
    #[derive(Default)]
    struct Scripted {
        history: Vec<RawMessage>,
        recent: Mutex<Vec<RawMessage>>,
        participants: Vec<RawParticipant>,
        revoked: bool,
        trip_on_reactions_for: Option<String>,
        trip: Mutex<Option<ShutdownTrigger>>,
        /// Number of leading monitor fetches that fail transiently.
        failing_polls: usize,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for Scripted {
        async fn fetch_recent(&self, _chat_id: &str, limit: usize) -> Result<Vec<RawMessage>> {
            if self.revoked {
                return Err(GrexError::fatal_auth("session logged out"));
            }
            if limit == MONITOR_LIMIT {
                let poll = self.polls.fetch_add(1, Ordering::SeqCst);
                if poll < self.failing_polls {
                    return Err(GrexError::transient("fetch messages", "bridge restarting"));
                }
                return Ok(self.recent.lock().unwrap().clone());
            }
            Ok(self.history.iter().take(limit).cloned().collect())
        }

        async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<RawReaction>> {
            if self.trip_on_reactions_for.as_deref() == Some(message_id) {
                if let Some(trigger) = self.trip.lock().unwrap().take() {
                    trigger.trigger();
                }
            }
            Ok(Vec::new())
        }

        async fn download_media(&self, message_id: &str) -> Result<MediaBlob> {
            Err(GrexError::request(message_id, "no media"))
        }

        async fn fetch_participants(&self, _chat_id: &str) -> Result<Vec<RawParticipant>> {
            Ok(self.participants.clone())
        }
    }

    #[derive(Debug, Clone)]
    struct Saved {
        messages: Vec<Message>,
        run: ExtractionRun,
        participants: Vec<Participant>,
    }

    #[derive(Default)]
    struct StoreState {
        saves: Vec<Saved>,
        attempts: usize,
        fail_next: usize,
    }

    /// In-memory store that records every save.
    #[derive(Clone, Default)]
    struct MemoryStore(Arc<Mutex<StoreState>>);

    impl MemoryStore {
        fn failing(times: usize) -> Self {
            let store = Self::default();
            store.0.lock().unwrap().fail_next = times;
            store
        }

        fn saves(&self) -> Vec<Saved> {
            self.0.lock().unwrap().saves.clone()
        }

        fn attempts(&self) -> usize {
            self.0.lock().unwrap().attempts
        }
    }

    impl CheckpointStore for MemoryStore {
        fn load(&self) -> Result<Loaded> {
            let state = self.0.lock().unwrap();
            Ok(state
                .saves
                .last()
                .map(|saved| Loaded {
                    messages: saved.messages.clone(),
                    last_run: Some(saved.run.clone()),
                    history: Vec::new(),
                    participants: saved.participants.clone(),
                })
                .unwrap_or_default())
        }

        fn save(&mut self, snapshot: &Snapshot<'_>) -> Result<()> {
            let mut state = self.0.lock().unwrap();
            state.attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(GrexError::persistence("memory", "disk full"));
            }
            state.saves.push(Saved {
                messages: snapshot.messages.to_vec(),
                run: snapshot.run.clone(),
                participants: snapshot.participants.to_vec(),
            });
            Ok(())
        }
    }

    fn settings() -> ExtractorSettings {
        ExtractorSettings {
            retry: RetryPolicy::new(2, Duration::from_secs(1), 2.0),
            negotiator: BatchNegotiator::new(vec![100, 50], Duration::from_secs(5)),
            monitor_batch_size: MONITOR_LIMIT,
            ..ExtractorSettings::new("g@g.us")
        }
    }

    fn spawn(
        upstream: Arc<Scripted>,
        store: &MemoryStore,
        signal: ShutdownSignal,
    ) -> tokio::task::JoinHandle<Result<RunReport>> {
        let extractor = Extractor::new(upstream, Box::new(store.clone()), settings(), signal);
        tokio::spawn(extractor.run())
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_monitor_and_shutdown() {
        let history = vec![
            raw("m1", 100, "a@c.us"),
            raw("m2", 200, "a@c.us"),
            raw("m3", 150, "b@c.us"),
        ];
        let upstream = Arc::new(Scripted {
            recent: Mutex::new(history.clone()),
            history,
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(Arc::clone(&upstream), &store, signal);
        tokio::time::sleep(Duration::from_secs(45)).await;
        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.reason, ExitReason::Cancelled);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.transitions,
            vec![
                Phase::ColdStart,
                Phase::Processing,
                Phase::Monitoring,
                Phase::ShuttingDown,
                Phase::Terminated
            ]
        );
        assert!(report.flushed);
        assert_eq!(report.run.messages_extracted, 3);
        assert_eq!(report.run.last_message_timestamp, Some(200));
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 1);

        // Cold-start save, then the shutdown flush; the empty poll wrote nothing.
        let saves = store.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[1].messages.len(), 3);
        assert!(saves[1].run.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_appends_only_unseen_messages() {
        let history = vec![raw("m1", 100, "a@c.us"), raw("m2", 200, "a@c.us")];
        let mut recent = history.clone();
        recent.push(raw("m3", 300, "a@c.us"));
        let upstream = Arc::new(Scripted {
            history,
            recent: Mutex::new(recent),
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(Arc::clone(&upstream), &store, signal);
        tokio::time::sleep(Duration::from_secs(75)).await;
        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);
        let saves = store.saves();
        // Cold start, first poll (new message), shutdown flush.
        assert_eq!(saves.len(), 3);
        assert_eq!(saves[1].messages.len(), 3);
        assert_eq!(report.total_messages, 3);
        assert_eq!(report.run.last_message_timestamp, Some(300));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_duplicate_messages() {
        let history = vec![raw("m1", 100, "a@c.us"), raw("m2", 200, "a@c.us")];
        let store = MemoryStore::default();

        for _ in 0..2 {
            let upstream = Arc::new(Scripted {
                history: history.clone(),
                ..Scripted::default()
            });
            let (trigger, signal) = shutdown::channel();
            let task = spawn(upstream, &store, signal);
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.trigger();
            task.await.unwrap().unwrap();
        }

        let saves = store.saves();
        let last = saves.last().unwrap();
        assert_eq!(last.messages.len(), 2);
        assert_eq!(last.run.messages_extracted, 0);
        let mut ids: Vec<_> = last.messages.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn watermark_does_not_regress_on_older_history() {
        let store = MemoryStore::default();
        {
            let upstream = Arc::new(Scripted {
                history: vec![raw("new", 1_000, "a@c.us")],
                ..Scripted::default()
            });
            let (trigger, signal) = shutdown::channel();
            let task = spawn(upstream, &store, signal);
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.trigger();
            task.await.unwrap().unwrap();
        }

        let upstream = Arc::new(Scripted {
            history: vec![raw("old", 500, "a@c.us")],
            ..Scripted::default()
        });
        let (trigger, signal) = shutdown::channel();
        let task = spawn(upstream, &store, signal);
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.run.messages_extracted, 1);
        assert_eq!(report.run.last_message_timestamp, Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_batch_saves_exactly_once() {
        let history: Vec<RawMessage> = (0..10)
            .map(|i| RawMessage {
                has_reaction: true,
                ..raw(&format!("m{i}"), 100 + i, "a@c.us")
            })
            .collect();
        let (trigger, signal) = shutdown::channel();
        let upstream = Arc::new(Scripted {
            history,
            trip_on_reactions_for: Some("m3".to_string()),
            trip: Mutex::new(Some(trigger)),
            ..Scripted::default()
        });
        let store = MemoryStore::default();

        let report = spawn(upstream, &store, signal).await.unwrap().unwrap();

        assert_eq!(report.reason, ExitReason::Cancelled);
        assert!(!report.transitions.contains(&Phase::Monitoring));
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        let ids: Vec<_> = saves[0].messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3"]);
        assert!(saves[0].messages.iter().all(|m| m.reaction_source == ReactionSource::None));
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_session_flushes_and_exits_nonzero() {
        let upstream = Arc::new(Scripted {
            revoked: true,
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (_trigger, signal) = shutdown::channel();

        let report = spawn(upstream, &store, signal).await.unwrap().unwrap();

        assert_eq!(report.reason, ExitReason::AuthRevoked);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(store.saves().len(), 1);
        assert!(report.run.errors.iter().any(|e| e.message.contains("authentication")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_saves_are_retried_once_then_kept_in_memory() {
        let upstream = Arc::new(Scripted {
            history: vec![raw("m1", 100, "a@c.us")],
            ..Scripted::default()
        });
        let store = MemoryStore::failing(2);
        let (trigger, signal) = shutdown::channel();

        let task = spawn(upstream, &store, signal);
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert_eq!(store.attempts(), 3);
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].messages.len(), 1);
        assert!(report.flushed);
        assert!(report.run.errors.iter().any(|e| e.message.contains("disk full")));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_authors_join_roster_as_former_members() {
        let upstream = Arc::new(Scripted {
            history: vec![raw("m1", 100, "a@c.us"), raw("m2", 101, "gone@c.us")],
            participants: vec![RawParticipant {
                id: "a@c.us".to_string(),
                name: Some("Ann".to_string()),
                ..RawParticipant::default()
            }],
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(upstream, &store, signal);
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
        task.await.unwrap().unwrap();

        let saves = store.saves();
        let roster = &saves.last().unwrap().participants;
        assert_eq!(roster.len(), 2);
        let gone = roster.iter().find(|p| p.id == "gone@c.us").unwrap();
        assert_eq!(gone.membership, Membership::Former);
        let ann = roster.iter().find(|p| p.id == "a@c.us").unwrap();
        assert_eq!(ann.membership, Membership::Current);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ladder_goes_straight_to_monitoring() {
        let upstream = Arc::new(Scripted::default());
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(upstream, &store, signal);
        tokio::time::sleep(Duration::from_secs(40)).await;
        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert!(!report.transitions.contains(&Phase::Processing));
        assert!(report.transitions.contains(&Phase::Monitoring));
        assert_eq!(store.saves().len(), 1);
        assert_eq!(report.run.errors.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_monitor_fetch_waits_an_extra_interval() {
        // Ladder finishes at t=5s; polls then run every 30s.
        let upstream = Arc::new(Scripted {
            failing_polls: 2,
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(Arc::clone(&upstream), &store, signal);

        // t=35 fails, retried at t=36 and fails again. The next poll is due
        // at t=96 rather than t=66.
        tokio::time::sleep(Duration::from_secs(80)).await;
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 3);

        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.reason, ExitReason::Cancelled);
        assert_eq!(report.run.batches_fetched, 1);
        let failures: Vec<_> = report
            .run
            .errors
            .iter()
            .filter(|e| e.message.starts_with("Monitoring fetch failed"))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("bridge restarting"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_saves_state_left_by_failed_saves() {
        let history = vec![raw("m1", 100, "a@c.us")];
        let upstream = Arc::new(Scripted {
            recent: Mutex::new(history.clone()),
            history,
            ..Scripted::default()
        });
        let store = MemoryStore::failing(2);
        let (trigger, signal) = shutdown::channel();

        let task = spawn(Arc::clone(&upstream), &store, signal);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.attempts(), 2);
        assert!(store.saves().is_empty());

        // The first poll finds nothing new but still writes the pending state.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 1);
        assert_eq!(store.attempts(), 3);
        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].messages.len(), 1);

        // Once clean, empty polls write nothing.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);
        assert_eq!(store.attempts(), 3);

        trigger.trigger();
        let report = task.await.unwrap().unwrap();
        assert!(report.flushed);
        assert_eq!(store.saves().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_that_adds_nothing_does_not_save() {
        let history = vec![raw("m1", 100, "a@c.us")];
        let nameless = raw("", 500, "a@c.us");
        let upstream = Arc::new(Scripted {
            history,
            recent: Mutex::new(vec![nameless]),
            ..Scripted::default()
        });
        let store = MemoryStore::default();
        let (trigger, signal) = shutdown::channel();

        let task = spawn(Arc::clone(&upstream), &store, signal);
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(upstream.polls.load(Ordering::SeqCst), 2);
        assert_eq!(store.saves().len(), 1);

        trigger.trigger();
        let report = task.await.unwrap().unwrap();

        // Cold start and the shutdown flush only.
        assert_eq!(store.saves().len(), 2);
        assert_eq!(report.total_messages, 1);
        assert_eq!(report.run.last_message_timestamp, Some(100));
    }
}
