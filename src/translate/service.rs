use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::TtlCache;
use crate::config::{CacheConfig, TranslationConfig};
use crate::translate::models::LanguagePair;
use crate::translate::queue::{TaskQueue, TranslationJob};
use crate::util::RetryPolicy;

// Language pairs with no usable direct model; translated through English.
const CASCADE_PAIRS: &[(&str, &str)] = &[("ru", "de"), ("de", "ru")];

/// Result of translating one item into one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedText {
    pub title: String,
    pub content: String,
    /// True when translation failed and the original text was kept.
    pub fallback: bool,
}

/// Translates accepted items into the configured target languages.
///
/// Order of gates per request: same-language short circuit, translation
/// cache, then the queue. Failures after the retry budget fall back to the
/// original text so an item is never lost to a translation outage.
pub struct TranslationService {
    queue: Arc<TaskQueue>,
    cache: TtlCache<String, (String, String)>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    enabled: bool,
    target_languages: Vec<String>,
}

impl TranslationService {
    pub fn new(
        queue: Arc<TaskQueue>,
        translation: &TranslationConfig,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            queue,
            cache: TtlCache::new(cache.max_size, cache.default_ttl()),
            semaphore: Arc::new(Semaphore::new(translation.max_concurrent.max(1))),
            retry: RetryPolicy::with_attempts(translation.max_retries + 1),
            enabled: translation.enabled,
            target_languages: translation.target_languages.clone(),
        }
    }

    /// Languages an item in `source_language` gets translated into.
    /// Empty when translation is disabled.
    pub fn targets_for(&self, source_language: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.target_languages
            .iter()
            .filter(|lang| lang.as_str() != source_language)
            .cloned()
            .collect()
    }

    /// Spawn the periodic cache sweeper. Aborted by the caller at shutdown.
    pub fn spawn_cache_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper(interval)
    }

    /// Translate one item's title and content into `target_language`.
    ///
    /// Never returns an error: after the retry budget is exhausted the
    /// original text comes back with the `fallback` flag set, logged once.
    pub async fn translate_item(
        &self,
        source_language: &str,
        target_language: &str,
        title: &str,
        content: &str,
    ) -> TranslatedText {
        if source_language == target_language {
            return TranslatedText {
                title: title.to_string(),
                content: content.to_string(),
                fallback: false,
            };
        }

        let key = cache_key(source_language, target_language, title, content);
        if let Some((title, content)) = self.cache.get(&key) {
            tracing::debug!(
                source = source_language,
                target = target_language,
                "Translation cache hit"
            );
            return TranslatedText {
                title,
                content,
                fallback: false,
            };
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("translation semaphore closed");

        match self
            .translate_with_retries(source_language, target_language, title, content)
            .await
        {
            Some((translated_title, translated_content)) => {
                self.cache
                    .insert(key, (translated_title.clone(), translated_content.clone()));
                TranslatedText {
                    title: translated_title,
                    content: translated_content,
                    fallback: false,
                }
            }
            None => {
                tracing::warn!(
                    source = source_language,
                    target = target_language,
                    attempts = self.retry.max_attempts,
                    "Translation failed, publishing original text"
                );
                TranslatedText {
                    title: title.to_string(),
                    content: content.to_string(),
                    fallback: true,
                }
            }
        }
    }

    async fn translate_with_retries(
        &self,
        source: &str,
        target: &str,
        title: &str,
        content: &str,
    ) -> Option<(String, String)> {
        let hops = hops_for(source, target);
        let mut texts = vec![title.to_string(), content.to_string()];

        for pair in hops {
            texts = self.translate_hop(&pair, texts).await?;
        }

        let mut iter = texts.into_iter();
        Some((iter.next()?, iter.next()?))
    }

    async fn translate_hop(&self, pair: &LanguagePair, texts: Vec<String>) -> Option<Vec<String>> {
        self.retry
            .run("translate", || {
                self.queue.submit_and_wait(TranslationJob {
                    pair: pair.clone(),
                    texts: texts.clone(),
                })
            })
            .await
            .ok()
    }

    /// Every model pair needed to cover this source language's targets,
    /// cascade hops included. Deduplicated, used for model warmup.
    pub fn pairs_for(&self, source_language: &str) -> Vec<LanguagePair> {
        let mut pairs = Vec::new();
        for target in self.targets_for(source_language) {
            for pair in hops_for(source_language, &target) {
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        pairs
    }
}

/// Hop sequence for a pair: one direct hop, or two through English for
/// pairs without a direct model.
fn hops_for(source: &str, target: &str) -> Vec<LanguagePair> {
    if CASCADE_PAIRS.contains(&(source, target)) {
        vec![
            LanguagePair::new(source, "en"),
            LanguagePair::new("en", target),
        ]
    } else {
        vec![LanguagePair::new(source, target)]
    }
}

fn cache_key(source: &str, target: &str, title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    format!("{}_{}_{:x}", source, target, digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::translate::models::{EchoBackend, ModelManager};

    fn service_with_queue(backend: Arc<EchoBackend>) -> (TranslationService, Arc<TaskQueue>) {
        let manager = Arc::new(ModelManager::new(backend, 15, Duration::from_secs(1800)));
        let queue = Arc::new(TaskQueue::new(manager, &QueueConfig::default()));
        let service = TranslationService::new(
            Arc::clone(&queue),
            &TranslationConfig::default(),
            &CacheConfig::default(),
        );
        (service, queue)
    }

    fn service_with(backend: Arc<EchoBackend>) -> TranslationService {
        service_with_queue(backend).0
    }

    #[tokio::test]
    async fn test_same_language_short_circuit() {
        let backend = Arc::new(EchoBackend::new());
        let service = service_with(backend.clone());

        let out = service.translate_item("en", "en", "Title", "Content").await;
        assert_eq!(out.title, "Title");
        assert!(!out.fallback);
        assert_eq!(backend.translation_count(), 0, "no backend call");
    }

    #[tokio::test]
    async fn test_direct_translation() {
        let backend = Arc::new(EchoBackend::new());
        let service = service_with(backend);

        let out = service.translate_item("en", "ru", "Title", "Content").await;
        assert_eq!(out.title, "[ru] Title");
        assert_eq!(out.content, "[ru] Content");
        assert!(!out.fallback);
    }

    #[tokio::test]
    async fn test_cache_prevents_second_backend_call() {
        let backend = Arc::new(EchoBackend::new());
        let service = service_with(backend.clone());

        service.translate_item("en", "ru", "Title", "Content").await;
        let count_after_first = backend.translation_count();
        let out = service.translate_item("en", "ru", "Title", "Content").await;

        assert_eq!(out.title, "[ru] Title");
        assert_eq!(backend.translation_count(), count_after_first);
    }

    #[tokio::test]
    async fn test_cascade_goes_through_english() {
        let backend = Arc::new(EchoBackend::new());
        let service = service_with(backend.clone());

        let out = service.translate_item("ru", "de", "Заголовок", "Текст").await;
        // Two hops: ru->en then en->de
        assert_eq!(out.title, "[de] [en] Заголовок");
        assert!(!out.fallback);
        assert_eq!(backend.translation_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_falls_back_to_original() {
        let backend = Arc::new(EchoBackend::new());
        backend.fail_pair(LanguagePair::new("en", "ru"));
        let service = service_with(backend);

        let out = service.translate_item("en", "ru", "Title", "Content").await;
        assert_eq!(out.title, "Title");
        assert_eq!(out.content, "Content");
        assert!(out.fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_pair_exhausts_the_retry_budget() {
        let backend = Arc::new(EchoBackend::new());
        backend.fail_pair(LanguagePair::new("en", "ru"));
        let (service, queue) = service_with_queue(backend);

        let out = service.translate_item("en", "ru", "Title", "Content").await;
        assert!(out.fallback);
        // Default budget is 2 retries after the first attempt, each
        // resubmitted to the queue after a backoff delay
        assert_eq!(queue.stats().failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cascade_hop_falls_back() {
        let backend = Arc::new(EchoBackend::new());
        backend.fail_pair(LanguagePair::new("en", "de"));
        let service = service_with(backend);

        let out = service.translate_item("ru", "de", "Заголовок", "Текст").await;
        assert!(out.fallback);
        assert_eq!(out.title, "Заголовок");
    }

    #[tokio::test]
    async fn test_targets_exclude_source_language() {
        let backend = Arc::new(EchoBackend::new());
        let service = service_with(backend);

        let targets = service.targets_for("ru");
        assert!(!targets.contains(&"ru".to_string()));
        assert!(targets.contains(&"en".to_string()));
    }

    #[tokio::test]
    async fn test_pairs_for_include_cascade_hops() {
        let service = service_with(Arc::new(EchoBackend::new()));

        let pairs = service.pairs_for("ru");
        assert!(pairs.contains(&LanguagePair::new("ru", "en")));
        // ru -> de goes through English, so the second hop is needed too
        assert!(pairs.contains(&LanguagePair::new("en", "de")));
        assert!(!pairs.contains(&LanguagePair::new("ru", "de")));
    }

    #[test]
    fn test_cache_key_distinguishes_pairs_and_texts() {
        let a = cache_key("en", "ru", "Title", "Content");
        let b = cache_key("en", "de", "Title", "Content");
        let c = cache_key("en", "ru", "Title", "Different");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key("en", "ru", "Title", "Content"));
    }
}
