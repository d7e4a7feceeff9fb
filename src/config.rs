//! Configuration file parser for firefeed.toml.
//!
//! The config file is optional — a missing file yields `Config::default()`.
//! Every section and key has a default, so any subset can be specified.
//! Environment variables (e.g. `RSS_MAX_CONCURRENT_FEEDS`) override file
//! values, matching how the pipeline is configured in deployment.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnvValue { key: String, value: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Feed fetching and validation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RssConfig {
    /// Maximum number of feeds fetched concurrently.
    pub max_concurrent_feeds: usize,
    /// Maximum entries taken from a single feed document per pass.
    pub max_entries_per_feed: usize,
    /// Per-fetch HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// TTL for cached feed-validation verdicts, in seconds.
    pub validation_cache_ttl_secs: u64,
    /// Entries with fewer title words than this are dropped.
    pub min_title_words: usize,
    /// Entries with fewer content words than this are dropped.
    pub min_content_words: usize,
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            max_concurrent_feeds: 10,
            max_entries_per_feed: 50,
            request_timeout_secs: 15,
            validation_cache_ttl_secs: 300,
            min_title_words: 3,
            min_content_words: 10,
        }
    }
}

impl RssConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.validation_cache_ttl_secs)
    }
}

/// Near-duplicate detection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Cosine similarity at or above this value marks a duplicate.
    pub similarity_threshold: f32,
    /// Only items created within this window are compared against.
    pub lookback_hours: i64,
    /// Maximum number of nearest candidates examined per check.
    pub candidate_limit: usize,
    /// Expected embedding vector dimension.
    pub embedding_dimension: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            lookback_hours: 24,
            candidate_limit: 5,
            embedding_dimension: 384,
        }
    }
}

/// Translation stack settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    /// Bound on concurrently awaited translation requests across language pairs.
    pub max_concurrent: usize,
    /// Maximum resident translation models before LRU eviction.
    pub max_cached_models: usize,
    /// Interval for the idle-model sweeper, in seconds.
    pub model_cleanup_interval_secs: u64,
    /// Languages every accepted item is translated into.
    pub target_languages: Vec<String>,
    /// Retry budget for a failed translation before original-language fallback.
    pub max_retries: u32,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 3,
            max_cached_models: 15,
            model_cleanup_interval_secs: 1800,
            target_languages: vec![
                "en".to_string(),
                "ru".to_string(),
                "de".to_string(),
                "fr".to_string(),
            ],
            max_retries: 2,
        }
    }
}

impl TranslationConfig {
    pub fn model_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.model_cleanup_interval_secs)
    }
}

/// In-process cache settings (translation cache, validation cache).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub max_size: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            max_size: 10_000,
            cleanup_interval_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Translation task queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue capacity; enqueues past this fail with a backpressure error.
    pub max_size: usize,
    /// Number of worker tasks pulling from the queue.
    pub workers: usize,
    /// Per-task execution timeout in seconds.
    pub task_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 30,
            workers: 1,
            task_timeout_secs: 300,
        }
    }
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Inference server settings (embeddings + translation models).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base URL of the inference server.
    pub base_url: String,
    /// API key sent as a bearer token (env `INFERENCE_API_KEY` takes precedence).
    pub api_key: Option<String>,
    /// Sentence-embedding model name.
    pub embedding_model: String,
    /// Prefix composed with a language pair to form a translation model name,
    /// e.g. "opus-mt" + (en, ru) -> "opus-mt-en-ru".
    pub translation_model_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            embedding_model: "paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            translation_model_prefix: "opus-mt".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Mask api_key in Debug output to prevent secret leakage.
impl std::fmt::Debug for InferenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("embedding_model", &self.embedding_model)
            .field("translation_model_prefix", &self.translation_model_prefix)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Publication settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PublicationConfig {
    /// Webhook endpoint items are posted to after admission. `None` disables
    /// external publication (items are still persisted and translated).
    pub webhook_url: Option<String>,
    /// Per-language channel recipient ids.
    pub channels: std::collections::HashMap<String, String>,
}

/// Storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "firefeed.db".to_string(),
        }
    }
}

/// Top-level pipeline configuration.
///
/// All sections use `#[serde(default)]` so any subset of keys can be
/// specified; missing keys fall back to defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rss: RssConfig,
    pub dedup: DedupConfig,
    pub translation: TranslationConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub inference: InferenceConfig,
    pub publication: PublicationConfig,
    pub database: DatabaseConfig,
    /// Interval between pipeline passes in watch mode, in seconds.
    pub watch_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rss: RssConfig::default(),
            dedup: DedupConfig::default(),
            translation: TranslationConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            inference: InferenceConfig::default(),
            publication: PublicationConfig::default(),
            database: DatabaseConfig::default(),
            watch_interval_secs: 180,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB). Guards against a corrupted or
    /// maliciously large file exhausting memory before parse.
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// - Missing file → `Ok` with defaults
    /// - Empty file → `Ok` with defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as a warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        // Parse as a raw table first to warn on likely typos
        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_sections = [
                "rss",
                "dedup",
                "translation",
                "cache",
                "queue",
                "inference",
                "publication",
                "database",
                "watch_interval_secs",
            ];
            for key in raw.keys() {
                if !known_sections.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply environment variable overrides over file/default values.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        override_usize("RSS_MAX_CONCURRENT_FEEDS", &mut self.rss.max_concurrent_feeds)?;
        override_usize("RSS_MAX_ENTRIES_PER_FEED", &mut self.rss.max_entries_per_feed)?;
        override_u64("RSS_REQUEST_TIMEOUT", &mut self.rss.request_timeout_secs)?;
        override_u64(
            "RSS_VALIDATION_CACHE_TTL",
            &mut self.rss.validation_cache_ttl_secs,
        )?;
        override_f32(
            "NEWS_SIMILARITY_THRESHOLD",
            &mut self.dedup.similarity_threshold,
        )?;
        override_usize(
            "TRANSLATION_MAX_CONCURRENT",
            &mut self.translation.max_concurrent,
        )?;
        override_usize(
            "TRANSLATION_MAX_CACHED_MODELS",
            &mut self.translation.max_cached_models,
        )?;
        override_u64(
            "TRANSLATION_MODEL_CLEANUP_INTERVAL",
            &mut self.translation.model_cleanup_interval_secs,
        )?;
        override_u64("CACHE_DEFAULT_TTL", &mut self.cache.default_ttl_secs)?;
        override_usize("CACHE_MAX_SIZE", &mut self.cache.max_size)?;
        override_u64("CACHE_CLEANUP_INTERVAL", &mut self.cache.cleanup_interval_secs)?;
        override_usize("QUEUE_MAX_SIZE", &mut self.queue.max_size)?;
        override_usize("QUEUE_DEFAULT_WORKERS", &mut self.queue.workers)?;
        override_u64("QUEUE_TASK_TIMEOUT", &mut self.queue.task_timeout_secs)?;

        if let Ok(url) = std::env::var("INFERENCE_BASE_URL") {
            self.inference.base_url = url;
        }
        if let Ok(key) = std::env::var("INFERENCE_API_KEY") {
            self.inference.api_key = Some(key);
        }
        if let Ok(path) = std::env::var("FIREFEED_DB_PATH") {
            self.database.path = path;
        }
        Ok(())
    }
}

fn override_usize(key: &str, target: &mut usize) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(key) {
        *target = raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
            key: key.to_string(),
            value: raw,
        })?;
    }
    Ok(())
}

fn override_u64(key: &str, target: &mut u64) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(key) {
        *target = raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
            key: key.to_string(),
            value: raw,
        })?;
    }
    Ok(())
}

fn override_f32(key: &str, target: &mut f32) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(key) {
        *target = raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
            key: key.to_string(),
            value: raw,
        })?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
