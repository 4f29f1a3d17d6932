//! Upstream client facade.
//!
//! [`UpstreamClient`] is the only seam through which the extractor talks to
//! the messaging provider. The production implementation, [`HttpUpstream`],
//! talks to a session bridge: a sidecar that owns the authenticated
//! messaging session and exposes it over plain HTTP/JSON.
//!
//! Every failure is classified into one of three kinds so callers can react
//! without knowing about HTTP: transient (retry), fatal auth (stop), or a
//! plain request error (skip this operation).

use crate::error::{GrexError, Result, ResultExt};
use crate::model::{MediaBlob, RawMessage, RawParticipant, RawReaction};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

/// Capabilities required from the messaging provider.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch up to `limit` recent messages of a chat, in no particular order.
    async fn fetch_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<RawMessage>>;

    /// Fetch the reactions of one message. May be empty even when the
    /// message is flagged as having reactions.
    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<RawReaction>>;

    /// Download the media attached to a message.
    async fn download_media(&self, message_id: &str) -> Result<MediaBlob>;

    /// Fetch the current roster. Providers without roster access return an
    /// empty list.
    async fn fetch_participants(&self, _chat_id: &str) -> Result<Vec<RawParticipant>> {
        Ok(Vec::new())
    }
}

/// Header the bridge uses to pass the original media filename.
pub const FILENAME_HEADER: &str = "x-filename";

/// HTTP statuses worth retrying.
#[must_use]
pub const fn should_retry_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429) || status >= 500
}

/// Session bridge client.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpUpstream {
    /// Build a client for the bridge at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("grex/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, operation: &str, path: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        debug!(operation, path, "Upstream request");
        request
            .send()
            .await
            .map_err(|e| classify_transport_error(operation, &e))
    }

    async fn get_records<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<Vec<T>> {
        let response = self.send(operation, path).await?;
        read_records(operation, check_status(operation, response)?).await
    }
}

/// Decode a JSON array one record at a time. Records that do not fit `T`
/// are logged and skipped so one bad entry does not lose the whole page.
async fn read_records<T: DeserializeOwned>(
    operation: &str,
    response: reqwest::Response,
) -> Result<Vec<T>> {
    let values: Vec<serde_json::Value> = response
        .json()
        .await
        .map_err(|e| classify_body_error(operation, &e))?;
    Ok(decode_records(operation, values))
}

fn decode_records<T: DeserializeOwned>(operation: &str, values: Vec<serde_json::Value>) -> Vec<T> {
    let total = values.len();
    let records: Vec<T> = values
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(operation, index, "Skipping malformed record: {}", e);
                None
            }
        })
        .collect();
    if records.len() < total {
        debug!(
            operation,
            kept = records.len(),
            total,
            "Decoded records with skips"
        );
    }
    records
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn fetch_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<RawMessage>> {
        let operation = format!("fetch {limit} messages");
        let path = format!("chats/{}/messages?limit={limit}", encode_segment(chat_id));
        self.get_records(&operation, &path).await
    }

    async fn fetch_reactions(&self, message_id: &str) -> Result<Vec<RawReaction>> {
        let operation = "fetch reactions";
        let path = format!("messages/{}/reactions", encode_segment(message_id));
        let response = self.send(operation, &path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        read_records(operation, check_status(operation, response)?).await
    }

    async fn download_media(&self, message_id: &str) -> Result<MediaBlob> {
        let operation = "download media";
        let path = format!("messages/{}/media", encode_segment(message_id));
        let response = check_status(operation, self.send(operation, &path).await?)?;

        let headers = response.headers();
        let mimetype = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = headers
            .get(FILENAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(String::from);
        let data = response
            .bytes()
            .await
            .map_err(|e| classify_body_error(operation, &e))?;

        Ok(MediaBlob {
            mimetype,
            filename,
            data: data.to_vec(),
        })
    }

    async fn fetch_participants(&self, chat_id: &str) -> Result<Vec<RawParticipant>> {
        let path = format!("chats/{}/participants", encode_segment(chat_id));
        self.get_records("fetch participants", &path).await
    }
}

fn check_status(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let reason = format!("HTTP {status}");
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(GrexError::fatal_auth(format!("{operation}: {reason}")))
    } else if should_retry_status(status.as_u16()) {
        Err(GrexError::transient(operation, reason))
    } else {
        Err(GrexError::request(operation, reason))
    }
}

fn classify_transport_error(operation: &str, error: &reqwest::Error) -> GrexError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        GrexError::transient(operation, error.to_string())
    } else {
        GrexError::request(operation, error.to_string())
    }
}

fn classify_body_error(operation: &str, error: &reqwest::Error) -> GrexError {
    if error.is_decode() {
        GrexError::request(operation, format!("malformed response: {error}"))
    } else {
        classify_transport_error(operation, error)
    }
}

/// Percent-encode characters that would break a single path segment.
fn encode_segment(raw: &str) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'@' => {
                out.push(byte as char);
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}
