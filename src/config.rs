//! Configuration system for grex.
//!
//! Provides layered configuration from multiple sources:
//!
//! 1. **Compiled defaults** - Pacing values tuned for a single group chat
//! 2. **User config file** - `~/.config/grex/config.toml` (or `--config`)
//! 3. **Environment variables** - `GREX_*` prefix
//! 4. **CLI arguments** - Highest priority, always wins
//!
//! # Example Configuration File
//!
//! ```toml
//! [paths]
//! data_dir = "~/.local/share/grex"
//! reactions_file = "reactions_data.json"
//!
//! [upstream]
//! base_url = "http://127.0.0.1:3000"
//! chat_id = "120363000000000000@g.us"
//!
//! [extraction]
//! batch_sizes = [5000, 2000, 1000, 500, 200, 100]
//! safety_delay_ms = 5000
//! monitoring_interval_secs = 30
//! prefer_live_reactions = false
//! ```

use crate::checkpoint::{
    CheckpointFiles, DEFAULT_MESSAGES_FILE, DEFAULT_METADATA_FILE, DEFAULT_PARTICIPANTS_FILE,
};
use crate::cli::OutputFormat;
use crate::error::{GrexError, Result};
use crate::negotiator::{BatchNegotiator, DEFAULT_BATCH_SIZES};
use crate::orchestrator::ExtractorSettings;
use crate::retry::RetryPolicy;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default name of the reaction monitor dataset.
pub const DEFAULT_REACTIONS_FILE: &str = "reactions_data.json";

/// Main configuration structure for grex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where checkpoints and the reaction dataset live.
    pub paths: PathsConfig,
    /// Session bridge connection.
    pub upstream: UpstreamConfig,
    /// Pacing, retries and feature toggles.
    pub extraction: ExtractionConfig,
    /// Output formatting configuration.
    pub output: OutputConfig,
}

/// Data file locations. Relative file names resolve against `data_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory.
    /// Environment variable: `GREX_DATA_DIR`
    pub data_dir: Option<PathBuf>,

    pub messages_file: PathBuf,
    pub metadata_file: PathBuf,
    pub participants_file: PathBuf,

    /// Reaction monitor dataset written by the observer.
    /// Environment variable: `GREX_REACTIONS_FILE`
    pub reactions_file: PathBuf,
}

/// Session bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Environment variable: `GREX_UPSTREAM_URL`
    pub base_url: String,

    /// Bearer token for the bridge.
    /// Environment variable: `GREX_UPSTREAM_TOKEN`
    pub token: Option<String>,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Chat to extract.
    /// Environment variable: `GREX_CHAT_ID`
    pub chat_id: Option<String>,
}

/// Extraction behaviour. Delays are in milliseconds unless named otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Cold-start ladder, largest first.
    pub batch_sizes: Vec<usize>,
    /// Pause between ladder rungs.
    pub safety_delay_ms: u64,
    /// Pause between processed messages.
    pub message_delay_ms: u64,
    /// Log progress (and pause longer) every this many messages.
    pub progress_every: usize,
    /// Pause taken at each progress point.
    pub progress_pause_ms: u64,
    /// Total attempts per upstream operation.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Environment variable: `GREX_MONITOR_INTERVAL_SECS`
    pub monitoring_interval_secs: u64,
    /// Messages requested per monitor tick.
    pub monitor_batch_size: usize,
    /// Environment variable: `GREX_DOWNLOAD_MEDIA`
    pub download_media: bool,
    /// Try a live reaction fetch before the inline list.
    /// Environment variable: `GREX_PREFER_LIVE_REACTIONS`
    pub prefer_live_reactions: bool,
}

/// Output formatting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Default output format for `status`: text, json or json-pretty.
    /// Environment variable: `GREX_FORMAT`
    pub format: String,

    /// Enable colored output.
    pub colors: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            messages_file: PathBuf::from(DEFAULT_MESSAGES_FILE),
            metadata_file: PathBuf::from(DEFAULT_METADATA_FILE),
            participants_file: PathBuf::from(DEFAULT_PARTICIPANTS_FILE),
            reactions_file: PathBuf::from(DEFAULT_REACTIONS_FILE),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            token: None,
            request_timeout_secs: 30,
            chat_id: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_sizes: DEFAULT_BATCH_SIZES.to_vec(),
            safety_delay_ms: 5000,
            message_delay_ms: 50,
            progress_every: 50,
            progress_pause_ms: 1000,
            max_retries: 3,
            retry_base_delay_ms: 5000,
            backoff_multiplier: 2.0,
            monitoring_interval_secs: 30,
            monitor_batch_size: 20,
            download_media: true,
            prefer_live_reactions: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            colors: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `explicit` file, or the user config file (~/.config/grex/config.toml)
    /// 3. Compiled defaults
    ///
    /// # Errors
    ///
    /// An explicitly requested file that is missing or malformed is an
    /// error; a malformed user file is only logged.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        match explicit {
            Some(path) => config.merge(Self::read_file(path)?),
            None => {
                if let Some(user_config) = Self::load_user_config() {
                    config.merge(user_config);
                }
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());

        debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }

    /// Load configuration from a specific file, logging any problem.
    #[must_use]
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            debug!("Config file not found: {}", path.display());
            return None;
        }

        match Self::read_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GrexError::path_error("read config", path, e))?;
        let config = toml::from_str(&content).map_err(|e| GrexError::ConfigError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Load the user configuration file from the standard location.
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Get the path to the user configuration file.
    #[must_use]
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("grex").join("config.toml"))
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("GREX_DATA_DIR") {
            self.paths.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(file) = lookup("GREX_REACTIONS_FILE") {
            self.paths.reactions_file = PathBuf::from(file);
        }

        if let Some(url) = lookup("GREX_UPSTREAM_URL") {
            self.upstream.base_url = url;
        }
        if let Some(token) = lookup("GREX_UPSTREAM_TOKEN") {
            self.upstream.token = Some(token);
        }
        if let Some(chat) = lookup("GREX_CHAT_ID") {
            self.upstream.chat_id = Some(chat);
        }

        if let Some(secs) = lookup("GREX_MONITOR_INTERVAL_SECS") {
            if let Ok(n) = secs.parse() {
                self.extraction.monitoring_interval_secs = n;
            }
        }
        if let Some(flag) = lookup("GREX_DOWNLOAD_MEDIA") {
            if let Some(b) = parse_bool(&flag) {
                self.extraction.download_media = b;
            }
        }
        if let Some(flag) = lookup("GREX_PREFER_LIVE_REACTIONS") {
            if let Some(b) = parse_bool(&flag) {
                self.extraction.prefer_live_reactions = b;
            }
        }

        if let Some(format) = lookup("GREX_FORMAT") {
            self.output.format = format;
        }
        if lookup("GREX_NO_COLOR").is_some() || lookup("NO_COLOR").is_some() {
            self.output.colors = false;
        }
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(&mut self, other: Self) {
        // Paths
        if other.paths.data_dir.is_some() {
            self.paths.data_dir = other.paths.data_dir;
        }
        self.paths.messages_file = other.paths.messages_file;
        self.paths.metadata_file = other.paths.metadata_file;
        self.paths.participants_file = other.paths.participants_file;
        self.paths.reactions_file = other.paths.reactions_file;

        // Upstream
        self.upstream.base_url = other.upstream.base_url;
        if other.upstream.token.is_some() {
            self.upstream.token = other.upstream.token;
        }
        self.upstream.request_timeout_secs = other.upstream.request_timeout_secs;
        if other.upstream.chat_id.is_some() {
            self.upstream.chat_id = other.upstream.chat_id;
        }

        // Extraction (always override if present in other)
        if !other.extraction.batch_sizes.is_empty() {
            self.extraction.batch_sizes = other.extraction.batch_sizes;
        }
        self.extraction.safety_delay_ms = other.extraction.safety_delay_ms;
        self.extraction.message_delay_ms = other.extraction.message_delay_ms;
        self.extraction.progress_every = other.extraction.progress_every;
        self.extraction.progress_pause_ms = other.extraction.progress_pause_ms;
        self.extraction.max_retries = other.extraction.max_retries;
        self.extraction.retry_base_delay_ms = other.extraction.retry_base_delay_ms;
        self.extraction.backoff_multiplier = other.extraction.backoff_multiplier;
        self.extraction.monitoring_interval_secs = other.extraction.monitoring_interval_secs;
        self.extraction.monitor_batch_size = other.extraction.monitor_batch_size;
        self.extraction.download_media = other.extraction.download_media;
        self.extraction.prefer_live_reactions = other.extraction.prefer_live_reactions;

        // Output
        self.output.format = other.output.format;
        self.output.colors = other.output.colors;
    }

    /// Reject settings the extractor cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`GrexError::InvalidSetting`] naming the first bad key.
    pub fn validate(&self) -> Result<()> {
        let invalid = |key: &'static str, reason: &str| -> Result<()> {
            Err(GrexError::InvalidSetting {
                key,
                reason: reason.to_string(),
            })
        };
        let sizes = &self.extraction.batch_sizes;
        if sizes.is_empty() || sizes.contains(&0) {
            return invalid("extraction.batch_sizes", "must list positive sizes");
        }
        if self.extraction.monitor_batch_size == 0 {
            return invalid("extraction.monitor_batch_size", "must be positive");
        }
        if self.extraction.monitoring_interval_secs == 0 {
            return invalid("extraction.monitoring_interval_secs", "must be positive");
        }
        if !self.extraction.backoff_multiplier.is_finite()
            || self.extraction.backoff_multiplier < 1.0
        {
            return invalid("extraction.backoff_multiplier", "must be at least 1.0");
        }
        if self.upstream.base_url.trim().is_empty() {
            return invalid("upstream.base_url", "must not be empty");
        }
        self.output_format().map(|_| ())
    }

    /// Output format used when `--format` is not given.
    ///
    /// # Errors
    ///
    /// Returns [`GrexError::InvalidSetting`] for an unknown format name.
    pub fn output_format(&self) -> Result<OutputFormat> {
        let name = self.output.format.trim();
        OutputFormat::from_str(name, true).map_err(|_| GrexError::InvalidSetting {
            key: "output.format",
            reason: format!("unknown format '{name}' (expected text, json or json-pretty)"),
        })
    }

    /// Get the data directory, using defaults if not configured.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.paths
            .data_dir
            .clone()
            .unwrap_or_else(crate::default_data_dir)
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.data_dir().join(file)
        }
    }

    /// Locations of the checkpoint documents.
    #[must_use]
    pub fn checkpoint_files(&self) -> CheckpointFiles {
        CheckpointFiles {
            messages: self.resolve(&self.paths.messages_file),
            metadata: self.resolve(&self.paths.metadata_file),
            participants: self.resolve(&self.paths.participants_file),
        }
    }

    /// Location of the reaction monitor dataset.
    #[must_use]
    pub fn reactions_path(&self) -> PathBuf {
        self.resolve(&self.paths.reactions_file)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs.max(1))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.extraction.max_retries,
            Duration::from_millis(self.extraction.retry_base_delay_ms),
            self.extraction.backoff_multiplier,
        )
    }

    #[must_use]
    pub fn negotiator(&self) -> BatchNegotiator {
        BatchNegotiator::new(
            self.extraction.batch_sizes.clone(),
            Duration::from_millis(self.extraction.safety_delay_ms),
        )
    }

    /// Extractor settings for `chat_id`.
    #[must_use]
    pub fn extractor_settings(&self, chat_id: &str) -> ExtractorSettings {
        let extraction = &self.extraction;
        ExtractorSettings {
            chat_id: chat_id.to_string(),
            retry: self.retry_policy(),
            negotiator: self.negotiator(),
            message_delay: Duration::from_millis(extraction.message_delay_ms),
            progress_every: extraction.progress_every,
            progress_pause: Duration::from_millis(extraction.progress_pause_ms),
            monitoring_interval: Duration::from_secs(extraction.monitoring_interval_secs),
            monitor_batch_size: extraction.monitor_batch_size,
            download_media: extraction.download_media,
            prefer_live_reactions: extraction.prefer_live_reactions,
            reactions_path: Some(self.reactions_path()),
        }
    }

    /// Save the current configuration to the user config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined,
    /// the parent directory cannot be created, or the file cannot be written.
    pub fn save(&self) -> std::io::Result<PathBuf> {
        let config_path = Self::user_config_path().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            )
        })?;

        // Create parent directory if needed
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(config_path)
    }

    /// Generate a default configuration file content.
    #[must_use]
    pub fn default_config_content() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.extraction.batch_sizes,
            vec![5000, 2000, 1000, 500, 200, 100]
        );
        assert_eq!(config.extraction.safety_delay_ms, 5000);
        assert_eq!(config.extraction.monitor_batch_size, 20);
        assert!(config.extraction.download_media);
        assert!(!config.extraction.prefer_live_reactions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            "[upstream]\nchat_id = \"g@g.us\"\n\n[extraction]\nprefer_live_reactions = true\n",
        )
        .unwrap();
        assert_eq!(parsed.upstream.chat_id.as_deref(), Some("g@g.us"));
        assert!(parsed.extraction.prefer_live_reactions);
        assert_eq!(parsed.extraction.max_retries, 3);
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.upstream.token = Some("keep".to_string());
        let mut other = Config::default();
        other.extraction.monitoring_interval_secs = 5;
        other.paths.data_dir = Some(PathBuf::from("/custom/path"));

        base.merge(other);

        assert_eq!(base.extraction.monitoring_interval_secs, 5);
        assert_eq!(base.paths.data_dir, Some(PathBuf::from("/custom/path")));
        assert_eq!(base.upstream.token.as_deref(), Some("keep"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GREX_DATA_DIR", "/data"),
            ("GREX_CHAT_ID", "g@g.us"),
            ("GREX_DOWNLOAD_MEDIA", "off"),
            ("GREX_MONITOR_INTERVAL_SECS", "not a number"),
            ("NO_COLOR", "1"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.data_dir(), PathBuf::from("/data"));
        assert_eq!(config.upstream.chat_id.as_deref(), Some("g@g.us"));
        assert!(!config.extraction.download_media);
        assert_eq!(config.extraction.monitoring_interval_secs, 30);
        assert!(!config.output.colors);
    }

    #[test]
    fn test_paths_resolve_against_data_dir() {
        let mut config = Config::default();
        config.paths.data_dir = Some(PathBuf::from("/data"));
        config.paths.reactions_file = PathBuf::from("/elsewhere/reactions.json");

        let files = config.checkpoint_files();
        assert_eq!(files.messages, PathBuf::from("/data/messages_full.json"));
        assert_eq!(
            config.reactions_path(),
            PathBuf::from("/elsewhere/reactions.json")
        );
    }

    #[test]
    fn test_extractor_settings_follow_config() {
        let mut config = Config::default();
        config.extraction.batch_sizes = vec![300, 30];
        config.extraction.monitoring_interval_secs = 12;

        let settings = config.extractor_settings("g@g.us");
        assert_eq!(settings.chat_id, "g@g.us");
        assert_eq!(settings.negotiator.sizes(), &[300, 30]);
        assert_eq!(settings.monitoring_interval, Duration::from_secs(12));
    }

    #[test]
    fn test_validation_rejects_bad_ladder() {
        let mut config = Config::default();
        config.extraction.batch_sizes = vec![100, 0];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_sizes"));
    }

    #[test]
    fn test_output_format_from_config() {
        let env: HashMap<&str, &str> = [("GREX_FORMAT", "json-pretty")].into_iter().collect();
        let mut config = Config::default();
        assert_eq!(config.output_format().unwrap(), OutputFormat::Text);

        config.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.output_format().unwrap(), OutputFormat::JsonPretty);

        config.output.format = "JSON".to_string();
        assert_eq!(config.output_format().unwrap(), OutputFormat::Json);

        config.output.format = "yaml".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output.format"));
    }

    #[test]
    fn test_explicit_file_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[extraction\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(GrexError::ConfigError { .. })
        ));
        assert!(Config::load_from_file(&path).is_none());
    }

    #[test]
    fn test_default_config_content() {
        let content = Config::default_config_content();
        assert!(content.contains("[paths]"));
        assert!(content.contains("[upstream]"));
        assert!(content.contains("[extraction]"));
        assert!(content.contains("[output]"));
    }
}
