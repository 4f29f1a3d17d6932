//! Cold-start batch-size discovery.
//!
//! The upstream gives no hint about how much history it will return for a
//! single request, and large requests sometimes fail outright. The
//! negotiator walks a descending ladder of sizes and keeps the first
//! non-empty answer. A fixed safety delay separates attempts no matter how
//! the previous one ended.

use crate::error::Result;
use crate::model::RawMessage;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::upstream::UpstreamClient;
use std::time::Duration;
use tracing::{info, warn};

/// Default cold-start ladder.
pub const DEFAULT_BATCH_SIZES: &[usize] = &[5000, 2000, 1000, 500, 200, 100];

/// What happened at one rung of the ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Fetched(usize),
    Empty,
    Failed(String),
}

/// One rung of the ladder and how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAttempt {
    pub batch_size: usize,
    pub outcome: AttemptOutcome,
}

/// Result of a negotiation.
#[derive(Debug, Clone, Default)]
pub struct Negotiated {
    /// Messages of the first successful rung; empty if none succeeded.
    pub messages: Vec<RawMessage>,
    /// Size that produced `messages`.
    pub batch_size: Option<usize>,
    /// Every rung that was tried, in order.
    pub attempts: Vec<BatchAttempt>,
    /// Set when shutdown cut the ladder short.
    pub cancelled: bool,
}

impl Negotiated {
    /// Failure descriptions for the run error log.
    pub fn failures(&self) -> impl Iterator<Item = String> + '_ {
        self.attempts
            .iter()
            .filter_map(|attempt| match &attempt.outcome {
                AttemptOutcome::Failed(reason) => Some(format!(
                    "Failed to fetch {} messages: {}",
                    attempt.batch_size, reason
                )),
                _ => None,
            })
    }
}

/// Batch-size negotiator.
#[derive(Debug, Clone)]
pub struct BatchNegotiator {
    sizes: Vec<usize>,
    safety_delay: Duration,
}

impl BatchNegotiator {
    pub fn new(sizes: impl Into<Vec<usize>>, safety_delay: Duration) -> Self {
        Self {
            sizes: sizes.into(),
            safety_delay,
        }
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Walk the ladder and return the largest batch the upstream delivered.
    ///
    /// # Errors
    ///
    /// Only a fatal authentication error aborts the cascade; every other
    /// failure moves on to the next size.
    pub async fn negotiate(
        &self,
        upstream: &dyn UpstreamClient,
        chat_id: &str,
        retry: &RetryPolicy,
        shutdown: &ShutdownSignal,
    ) -> Result<Negotiated> {
        let mut negotiated = Negotiated::default();

        for (index, &batch_size) in self.sizes.iter().enumerate() {
            if index > 0 && shutdown.pause(self.safety_delay).await.is_cancelled() {
                negotiated.cancelled = true;
                break;
            }
            if shutdown.is_triggered() {
                negotiated.cancelled = true;
                break;
            }

            info!(batch_size, "Attempting to fetch {} messages", batch_size);
            let description = format!("fetch {batch_size} messages");
            let result = retry
                .execute(&description, shutdown, || {
                    upstream.fetch_recent(chat_id, batch_size)
                })
                .await;

            let outcome = match result {
                Ok(messages) if !messages.is_empty() => {
                    info!(
                        batch_size,
                        fetched = messages.len(),
                        "Fetched {} messages with limit {}",
                        messages.len(),
                        batch_size
                    );
                    negotiated.attempts.push(BatchAttempt {
                        batch_size,
                        outcome: AttemptOutcome::Fetched(messages.len()),
                    });
                    negotiated.messages = messages;
                    negotiated.batch_size = Some(batch_size);
                    return Ok(negotiated);
                }
                Ok(_) => {
                    warn!(batch_size, "No messages returned with limit {}", batch_size);
                    AttemptOutcome::Empty
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(batch_size, "Failed to fetch {} messages: {}", batch_size, e);
                    AttemptOutcome::Failed(e.to_string())
                }
            };
            negotiated.attempts.push(BatchAttempt {
                batch_size,
                outcome,
            });
        }

        if negotiated.batch_size.is_none() && !negotiated.cancelled {
            warn!("Every batch size failed or came back empty");
        }
        Ok(negotiated)
    }
}

impl Default for BatchNegotiator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZES, Duration::from_secs(5))
    }
}
