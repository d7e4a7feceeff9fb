use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::InferenceConfig;

/// Errors from a translation backend.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Translation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Translation API error: status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Translation request timed out")]
    Timeout,
    #[error("Model load failed for {model}: {reason}")]
    ModelLoad { model: String, reason: String },
    #[error("Backend returned {got} translations for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },
}

/// A directed source-to-target language pair, e.g. en -> ru.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Model name for this pair, e.g. "opus-mt-en-ru".
    pub fn model_name(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.source, self.target)
    }
}

impl std::fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

/// Loads, runs, and unloads per-pair translation models.
///
/// [`ModelManager`] is the only caller of `load`/`unload`; everything else
/// goes through the manager so residency stays bounded.
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    async fn load(&self, pair: &LanguagePair) -> Result<(), TranslateError>;

    /// Translate a batch of texts, one output per input, in order.
    async fn translate_batch(
        &self,
        pair: &LanguagePair,
        texts: &[String],
    ) -> Result<Vec<String>, TranslateError>;

    async fn unload(&self, pair: &LanguagePair) -> Result<(), TranslateError>;
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<String>,
}

/// [`TranslationBackend`] talking to an inference server over HTTP.
///
/// Model lifecycle maps to `POST /models/{name}/load` and
/// `POST /models/{name}/unload`; translation to `POST /translate`.
pub struct HttpTranslationBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model_prefix: String,
    request_timeout: Duration,
}

impl HttpTranslationBackend {
    pub fn new(client: reqwest::Client, config: &InferenceConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_prefix: config.translation_model_prefix.clone(),
            request_timeout: config.request_timeout(),
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn post_lifecycle(&self, model: &str, action: &str) -> Result<(), TranslateError> {
        let url = format!("{}/models/{}/{}", self.base_url, model, action);
        let response = tokio::time::timeout(
            self.request_timeout,
            self.authorized(self.client.post(&url)).send(),
        )
        .await
        .map_err(|_| TranslateError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(TranslateError::ModelLoad {
                model: model.to_string(),
                reason: format!("status {}: {}", status.as_u16(), reason),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TranslationBackend for HttpTranslationBackend {
    async fn load(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        self.post_lifecycle(&pair.model_name(&self.model_prefix), "load")
            .await
    }

    async fn translate_batch(
        &self,
        pair: &LanguagePair,
        texts: &[String],
    ) -> Result<Vec<String>, TranslateError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/translate", self.base_url);
        let body = serde_json::json!({
            "model": pair.model_name(&self.model_prefix),
            "source": pair.source,
            "target": pair.target,
            "texts": texts,
        });
        let response = tokio::time::timeout(
            self.request_timeout,
            self.authorized(self.client.post(&url)).json(&body).send(),
        )
        .await
        .map_err(|_| TranslateError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TranslateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: TranslateResponse = response.json().await?;
        if parsed.translations.len() != texts.len() {
            return Err(TranslateError::CountMismatch {
                expected: texts.len(),
                got: parsed.translations.len(),
            });
        }
        Ok(parsed.translations)
    }

    async fn unload(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        self.post_lifecycle(&pair.model_name(&self.model_prefix), "unload")
            .await
    }
}

// ============================================================================
// Echo backend
// ============================================================================

/// In-memory [`TranslationBackend`] that tags text with the target
/// language. Backs tests and `--dry-run` pipelines.
#[derive(Default)]
pub struct EchoBackend {
    load_delay: Duration,
    loads: AtomicU64,
    unloads: AtomicU64,
    translations: AtomicU64,
    failing: std::sync::Mutex<std::collections::HashSet<LanguagePair>>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate slow model loads.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Make one pair fail both loads and translations.
    pub fn fail_pair(&self, pair: LanguagePair) {
        self.failing
            .lock()
            .expect("failing lock poisoned")
            .insert(pair);
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> u64 {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn translation_count(&self) -> u64 {
        self.translations.load(Ordering::SeqCst)
    }

    fn check_failing(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        if self
            .failing
            .lock()
            .expect("failing lock poisoned")
            .contains(pair)
        {
            return Err(TranslateError::Api {
                status: 503,
                message: format!("pair {} unavailable", pair),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TranslationBackend for EchoBackend {
    async fn load(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        self.check_failing(pair)?;
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn translate_batch(
        &self,
        pair: &LanguagePair,
        texts: &[String],
    ) -> Result<Vec<String>, TranslateError> {
        self.check_failing(pair)?;
        self.translations.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| format!("[{}] {}", pair.target, text))
            .collect())
    }

    async fn unload(&self, _pair: &LanguagePair) -> Result<(), TranslateError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Model Manager
// ============================================================================

/// Residency and usage counters.
#[derive(Debug, Clone)]
pub struct ModelStats {
    pub resident: usize,
    pub loads: u64,
    pub evictions: u64,
}

struct Resident {
    last_used: Instant,
}

/// Bounds how many translation models are resident at once.
///
/// Loads are single-flight per pair: concurrent requests for a missing
/// model wait on one load instead of issuing duplicates. When the bound
/// is hit the least recently used model is unloaded first. A background
/// sweeper unloads models that sit idle for a full cleanup interval.
pub struct ModelManager {
    backend: Arc<dyn TranslationBackend>,
    max_cached: usize,
    idle_timeout: Duration,
    resident: Mutex<HashMap<LanguagePair, Resident>>,
    load_locks: Mutex<HashMap<LanguagePair, Arc<Mutex<()>>>>,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl ModelManager {
    pub fn new(backend: Arc<dyn TranslationBackend>, max_cached: usize, idle_timeout: Duration) -> Self {
        Self {
            backend,
            max_cached: max_cached.max(1),
            idle_timeout,
            resident: Mutex::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Translate a batch through the model for `pair`, loading it first if
    /// needed.
    pub async fn translate_batch(
        &self,
        pair: &LanguagePair,
        texts: &[String],
    ) -> Result<Vec<String>, TranslateError> {
        self.ensure_loaded(pair).await?;
        let result = self.backend.translate_batch(pair, texts).await;
        if result.is_ok() {
            if let Some(entry) = self.resident.lock().await.get_mut(pair) {
                entry.last_used = Instant::now();
            }
        }
        result
    }

    /// Load a model ahead of use, e.g. at startup for hot pairs.
    pub async fn preload(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        self.ensure_loaded(pair).await
    }

    async fn ensure_loaded(&self, pair: &LanguagePair) -> Result<(), TranslateError> {
        // Fast path: already resident
        if let Some(entry) = self.resident.lock().await.get_mut(pair) {
            entry.last_used = Instant::now();
            return Ok(());
        }

        let load_lock = {
            let mut locks = self.load_locks.lock().await;
            locks
                .entry(pair.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = load_lock.lock().await;

        // A concurrent caller may have finished the load while we waited
        if let Some(entry) = self.resident.lock().await.get_mut(pair) {
            entry.last_used = Instant::now();
            return Ok(());
        }

        tracing::info!(pair = %pair, "Loading translation model");
        self.backend.load(pair).await?;
        self.loads.fetch_add(1, Ordering::Relaxed);

        let mut resident = self.resident.lock().await;
        while resident.len() >= self.max_cached {
            let oldest = resident
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(pair, _)| pair.clone());
            let Some(victim) = oldest else { break };
            resident.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(pair = %victim, "Evicting least recently used model");
            if let Err(e) = self.backend.unload(&victim).await {
                tracing::warn!(pair = %victim, error = %e, "Model unload failed");
            }
        }
        resident.insert(
            pair.clone(),
            Resident {
                last_used: Instant::now(),
            },
        );
        Ok(())
    }

    /// Unload models idle for longer than the cleanup interval.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let victims: Vec<LanguagePair> = {
            let resident = self.resident.lock().await;
            resident
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_used) >= self.idle_timeout)
                .map(|(pair, _)| pair.clone())
                .collect()
        };

        for pair in &victims {
            self.resident.lock().await.remove(pair);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(pair = %pair, "Unloading idle model");
            if let Err(e) = self.backend.unload(pair).await {
                tracing::warn!(pair = %pair, error = %e, "Model unload failed");
            }
        }
        victims.len()
    }

    /// Deterministically unload every resident model. Called at shutdown.
    pub async fn unload_all(&self) {
        let pairs: Vec<LanguagePair> = self.resident.lock().await.keys().cloned().collect();
        for pair in pairs {
            self.resident.lock().await.remove(&pair);
            if let Err(e) = self.backend.unload(&pair).await {
                tracing::warn!(pair = %pair, error = %e, "Model unload failed during shutdown");
            }
        }
    }

    pub async fn stats(&self) -> ModelStats {
        ModelStats {
            resident: self.resident.lock().await.len(),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic idle sweeper. Aborted by the caller at shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // First tick fires immediately
            loop {
                ticker.tick().await;
                let unloaded = manager.sweep_idle().await;
                if unloaded > 0 {
                    tracing::debug!(unloaded = unloaded, "Idle model sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(backend: Arc<EchoBackend>, max_cached: usize) -> ModelManager {
        ModelManager::new(backend, max_cached, Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn test_load_once_then_reuse() {
        let backend = Arc::new(EchoBackend::new());
        let m = manager(backend.clone(), 4);
        let pair = LanguagePair::new("en", "ru");

        let out = m
            .translate_batch(&pair, &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec!["[ru] hello"]);
        m.translate_batch(&pair, &["again".to_string()]).await.unwrap();

        assert_eq!(backend.load_count(), 1);
        assert_eq!(m.stats().await.resident, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_load() {
        let backend = Arc::new(EchoBackend::new().with_load_delay(Duration::from_millis(50)));
        let m = Arc::new(manager(backend.clone(), 4));
        let pair = LanguagePair::new("en", "de");

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                let pair = pair.clone();
                tokio::spawn(async move {
                    m.translate_batch(&pair, &[format!("text {i}")]).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(backend.load_count(), 1, "load must be single-flight");
    }

    #[tokio::test]
    async fn test_lru_eviction_at_capacity() {
        let backend = Arc::new(EchoBackend::new());
        let m = manager(backend.clone(), 2);

        m.translate_batch(&LanguagePair::new("en", "ru"), &["a".to_string()])
            .await
            .unwrap();
        m.translate_batch(&LanguagePair::new("en", "de"), &["b".to_string()])
            .await
            .unwrap();
        // Touch en->ru so en->de becomes the LRU victim
        m.translate_batch(&LanguagePair::new("en", "ru"), &["c".to_string()])
            .await
            .unwrap();
        m.translate_batch(&LanguagePair::new("en", "fr"), &["d".to_string()])
            .await
            .unwrap();

        let stats = m.stats().await;
        assert_eq!(stats.resident, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(backend.unload_count(), 1);

        // en->ru survived the eviction: no new load needed
        let loads_before = backend.load_count();
        m.translate_batch(&LanguagePair::new("en", "ru"), &["e".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.load_count(), loads_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_models_swept() {
        let backend = Arc::new(EchoBackend::new());
        let m = ModelManager::new(backend.clone(), 4, Duration::from_secs(60));

        m.translate_batch(&LanguagePair::new("en", "ru"), &["a".to_string()])
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(m.sweep_idle().await, 0, "not idle long enough");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(m.sweep_idle().await, 1);
        assert_eq!(m.stats().await.resident, 0);
        assert_eq!(backend.unload_count(), 1);
    }

    #[tokio::test]
    async fn test_unload_all() {
        let backend = Arc::new(EchoBackend::new());
        let m = manager(backend.clone(), 4);
        m.translate_batch(&LanguagePair::new("en", "ru"), &["a".to_string()])
            .await
            .unwrap();
        m.translate_batch(&LanguagePair::new("en", "de"), &["b".to_string()])
            .await
            .unwrap();

        m.unload_all().await;
        assert_eq!(m.stats().await.resident, 0);
        assert_eq!(backend.unload_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_propagates() {
        let backend = Arc::new(EchoBackend::new());
        let pair = LanguagePair::new("xx", "yy");
        backend.fail_pair(pair.clone());
        let m = manager(backend.clone(), 4);

        let result = m.translate_batch(&pair, &["a".to_string()]).await;
        assert!(result.is_err());
        assert_eq!(m.stats().await.resident, 0, "failed load must not stay resident");
    }
}
