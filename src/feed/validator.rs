use std::time::Duration;

use crate::cache::TtlCache;
use crate::config::RssConfig;
use crate::feed::fetcher::{read_limited_bytes, MAX_FEED_SIZE};
use crate::util::validate_url;

// Bounded: one verdict per configured feed URL plus manual checks
const VERDICT_CACHE_SIZE: usize = 256;

/// Outcome of validating one feed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub ok: bool,
    /// Human-readable rejection reason; `None` when ok.
    pub reason: Option<String>,
}

impl ValidationVerdict {
    fn accept() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Validates feed URLs before they enter the fetch rotation.
///
/// A URL passes three gates: the URL policy (scheme and host checks that
/// keep fetches off internal networks), reachability, and a structural
/// parse of the response body. Verdicts are cached with a TTL so repeated
/// checks of the same URL stay cheap.
pub struct FeedValidator {
    client: reqwest::Client,
    cache: TtlCache<String, ValidationVerdict>,
    request_timeout: Duration,
    allow_private_hosts: bool,
}

impl FeedValidator {
    pub fn new(client: reqwest::Client, config: &RssConfig) -> Self {
        Self {
            client,
            cache: TtlCache::new(
                VERDICT_CACHE_SIZE,
                Duration::from_secs(config.validation_cache_ttl_secs),
            ),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            allow_private_hosts: false,
        }
    }

    /// Permit loopback and private-range hosts. For local development and
    /// tests only.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    /// Validate a feed URL, returning a cached verdict when fresh.
    ///
    /// Never returns an error: every failure mode becomes a rejection
    /// verdict with a reason.
    pub async fn validate(&self, url: &str) -> ValidationVerdict {
        if let Some(verdict) = self.cache.get(&url.to_string()) {
            tracing::debug!(url = %url, ok = verdict.ok, "Validation verdict from cache");
            return verdict;
        }

        let verdict = self.check(url).await;
        if let Some(reason) = &verdict.reason {
            tracing::info!(url = %url, reason = %reason, "Feed URL rejected");
        }
        self.cache.insert(url.to_string(), verdict.clone());
        verdict
    }

    async fn check(&self, url: &str) -> ValidationVerdict {
        if !self.allow_private_hosts {
            if let Err(e) = validate_url(url) {
                return ValidationVerdict::reject(e.to_string());
            }
        } else if url::Url::parse(url).is_err() {
            return ValidationVerdict::reject("not a valid URL");
        }

        let response = match tokio::time::timeout(self.request_timeout, self.client.get(url).send())
            .await
        {
            Err(_) => return ValidationVerdict::reject("request timed out"),
            Ok(Err(e)) => return ValidationVerdict::reject(format!("request failed: {e}")),
            Ok(Ok(response)) => response,
        };

        if !response.status().is_success() {
            return ValidationVerdict::reject(format!("HTTP status {}", response.status().as_u16()));
        }

        let bytes = match read_limited_bytes(response, MAX_FEED_SIZE).await {
            Ok(bytes) => bytes,
            Err(e) => return ValidationVerdict::reject(e.to_string()),
        };

        match feed_rs::parser::parse(bytes.as_slice()) {
            Ok(_) => ValidationVerdict::accept(),
            Err(e) => ValidationVerdict::reject(format!("not a parseable feed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title></channel></rss>"#;

    fn validator() -> FeedValidator {
        // wiremock binds to loopback
        FeedValidator::new(reqwest::Client::new(), &RssConfig::default()).allow_private_hosts()
    }

    #[tokio::test]
    async fn test_valid_feed_accepted() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let verdict = validator().validate(&format!("{}/feed", mock_server.uri())).await;
        assert!(verdict.ok, "reason: {:?}", verdict.reason);
    }

    #[tokio::test]
    async fn test_non_feed_body_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hello</html>"))
            .mount(&mock_server)
            .await;

        let verdict = validator().validate(&format!("{}/page", mock_server.uri())).await;
        assert!(!verdict.ok);
        assert!(verdict.reason.unwrap().contains("not a parseable feed"));
    }

    #[tokio::test]
    async fn test_http_error_rejected() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&mock_server)
            .await;

        let verdict = validator().validate(&format!("{}/feed", mock_server.uri())).await;
        assert!(!verdict.ok);
        assert!(verdict.reason.unwrap().contains("403"));
    }

    #[tokio::test]
    async fn test_internal_host_rejected_without_network() {
        let validator = FeedValidator::new(reqwest::Client::new(), &RssConfig::default());
        let verdict = validator.validate("http://127.0.0.1:8080/feed").await;
        assert!(!verdict.ok);

        let verdict = validator.validate("http://192.168.1.5/feed").await;
        assert!(!verdict.ok);

        let verdict = validator.validate("ftp://example.com/feed").await;
        assert!(!verdict.ok);
    }

    #[tokio::test]
    async fn test_verdict_cached() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1) // Second validate must hit the cache
            .mount(&mock_server)
            .await;

        let validator = validator();
        let url = format!("{}/feed", mock_server.uri());
        assert!(validator.validate(&url).await.ok);
        assert!(validator.validate(&url).await.ok);
    }
}
