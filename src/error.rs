//! Custom error types for grex.
//!
//! Errors are grouped by how the extractor reacts to them: transient upstream
//! failures are retried, revoked sessions stop the process, partial data
//! degrades a single field, and persistence failures are retried on the next
//! cycle while the in-memory state is kept.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for grex operations.
#[derive(Error, Debug)]
pub enum GrexError {
    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// Network or session hiccup; worth retrying with backoff.
    #[error("Transient upstream failure during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// The upstream session was revoked or rejected.
    #[error("Upstream authentication failed: {reason}")]
    FatalAuth { reason: String },

    /// The upstream rejected the request or answered with something unusable.
    #[error("Upstream request for {operation} failed: {reason}")]
    Request { operation: String, reason: String },

    // =========================================================================
    // Data Errors
    // =========================================================================
    /// A single field of a record could not be populated.
    #[error("Could not populate {field} for message {message_id}: {reason}")]
    PartialData {
        message_id: String,
        field: &'static str,
        reason: String,
    },

    // =========================================================================
    // Checkpoint Errors
    // =========================================================================
    /// Checkpoint write failed.
    #[error("Failed to persist checkpoint '{path}': {reason}")]
    Persistence { path: PathBuf, reason: String },

    /// Existing checkpoint cannot be parsed.
    #[error("Checkpoint '{path}' is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    // =========================================================================
    // IO Errors
    // =========================================================================
    /// File read/write error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Path-specific IO error with context.
    #[error("Failed to {operation} '{path}': {source}")]
    PathError {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file parsing error.
    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigError { path: PathBuf, reason: String },

    /// A required setting is missing or out of range.
    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Catch-all for other errors with context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Wrapped anyhow error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for grex operations.
pub type Result<T> = std::result::Result<T, GrexError>;

impl GrexError {
    /// Create a transient upstream error.
    pub fn transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a fatal authentication error.
    pub fn fatal_auth(reason: impl Into<String>) -> Self {
        Self::FatalAuth {
            reason: reason.into(),
        }
    }

    /// Create a non-retryable request error.
    pub fn request(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a partial data error.
    pub fn partial(
        message_id: impl Into<String>,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::PartialData {
            message_id: message_id.into(),
            field,
            reason: reason.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a path error with context.
    pub fn path_error(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::PathError {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with additional context.
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether another attempt of the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this error must stop the extractor.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalAuth { .. })
    }

    /// Get a suggestion for how to fix this error, if applicable.
    #[must_use]
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::FatalAuth { .. } => {
                Some("Re-authenticate the session bridge, then run 'grex run' again.")
            }
            Self::CheckpointCorrupt { .. } => {
                Some("Restore the file from a backup or move it aside; grex will not overwrite it.")
            }
            Self::Persistence { .. } => {
                Some("Check free disk space and permissions on the data directory.")
            }
            Self::ConfigError { .. } | Self::InvalidSetting { .. } => {
                Some("Run 'grex config --show' to inspect the effective configuration.")
            }
            _ => None,
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily (only evaluated on error).
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped with additional context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| GrexError::with_context(context, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| GrexError::with_context(f(), e))
    }
}

// =============================================================================
// CLI Error Formatting
// =============================================================================

use colored::Colorize;

/// Format a structured CLI error with explanation and suggestions.
#[must_use]
pub fn format_error(title: &str, explanation: &str, suggestions: &[&str]) -> String {
    use std::fmt::Write;

    let mut output = format!("{} {}", "✗".red().bold(), title.bold());

    if !explanation.is_empty() {
        let _ = write!(output, "\n\n   {explanation}");
    }

    if !suggestions.is_empty() {
        output.push_str("\n\n   ");
        if suggestions.len() == 1 {
            let _ = write!(output, "{} {}", "Hint:".cyan(), suggestions[0]);
        } else {
            let _ = write!(output, "{}:", "Try".cyan());
            for suggestion in suggestions {
                let _ = write!(output, "\n     {} {}", "•".dimmed(), suggestion);
            }
        }
    }

    output
}
