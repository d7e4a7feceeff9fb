use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use thiserror::Error;

use crate::config::RssConfig;
use crate::feed::parser::{parse_feed, RawEntry};
use crate::storage::FeedSource;
use crate::util::word_count;

const MAX_RETRIES: u32 = 3;
pub(crate) const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching one feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed document could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Entries from one successfully fetched feed.
#[derive(Debug)]
pub struct FetchedFeed {
    /// Kept entries, in feed-document order, capped per config.
    pub entries: Vec<RawEntry>,
    /// Entries dropped for falling under the word-count floors.
    pub dropped_short: usize,
}

/// Result of fetching one feed, keyed by feed id for correlation.
pub struct FetchOutcome {
    pub feed_id: i64,
    pub result: Result<FetchedFeed, FetchError>,
}

/// Concurrent feed fetcher.
///
/// Fetching is read-only: entries come back to the caller and all
/// bookkeeping (last-fetch timestamps, dedup, persistence) happens in the
/// pipeline. An error on one feed never affects the others.
pub struct FeedFetcher {
    client: reqwest::Client,
    max_concurrent: usize,
    max_entries: usize,
    min_title_words: usize,
    min_content_words: usize,
    request_timeout: Duration,
    backoff_base: Duration,
}

impl FeedFetcher {
    pub fn new(client: reqwest::Client, config: &RssConfig) -> Self {
        Self {
            client,
            max_concurrent: config.max_concurrent_feeds.max(1),
            max_entries: config.max_entries_per_feed,
            min_title_words: config.min_title_words,
            min_content_words: config.min_content_words,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            backoff_base: Duration::from_secs(2),
        }
    }

    /// Override the retry backoff base (2s in production).
    #[cfg(test)]
    fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Fetch all feeds with bounded concurrency.
    ///
    /// At most `max_concurrent_feeds` requests are in flight at any time.
    /// Outcomes are returned in completion order, not input order; every
    /// input feed appears exactly once.
    pub async fn fetch_all(&self, feeds: &[FeedSource]) -> Vec<FetchOutcome> {
        if feeds.is_empty() {
            return Vec::new();
        }

        stream::iter(feeds.iter().cloned())
            .map(|feed| async move {
                let feed_id = feed.id;
                let result = self.fetch_one(&feed).await;
                if let Err(e) = &result {
                    tracing::warn!(feed_id = feed_id, url = %feed.url, error = %e, "Feed fetch failed");
                }
                FetchOutcome { feed_id, result }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }

    /// Fetch and parse a single feed.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] when the request exceeds the configured timeout
    /// - [`FetchError::RateLimited`] on 429 after backoff retries are exhausted
    /// - [`FetchError::HttpStatus`] on other non-2xx responses (5xx after retries)
    /// - [`FetchError::ResponseTooLarge`] when the body exceeds 10MB
    /// - [`FetchError::Parse`] when the document is not RSS/Atom
    pub async fn fetch_one(&self, feed: &FeedSource) -> Result<FetchedFeed, FetchError> {
        let mut retry_count = 0;

        let bytes = loop {
            let response = tokio::time::timeout(self.request_timeout, self.client.get(&feed.url).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            // 429 backs off and retries; other 4xx fail immediately
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::RateLimited(MAX_RETRIES));
                }
                let delay = self.backoff_base * 2u32.pow(retry_count);
                tracing::warn!(
                    feed = %feed.url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if response.status().is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(FetchError::HttpStatus(response.status().as_u16()));
                }
                let delay = self.backoff_base * 2u32.pow(retry_count);
                tracing::warn!(
                    feed = %feed.url,
                    status = %response.status(),
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => break bytes,
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= MAX_RETRIES {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    let delay = self.backoff_base * 2u32.pow(retry_count);
                    tracing::debug!(
                        feed = %feed.url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        let parsed = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

        let total = parsed.len();
        let mut dropped_short = 0;
        let entries: Vec<RawEntry> = parsed
            .into_iter()
            .filter(|entry| {
                let keep = word_count(&entry.title) >= self.min_title_words
                    && word_count(&entry.content) >= self.min_content_words;
                if !keep {
                    dropped_short += 1;
                    tracing::debug!(feed = %feed.url, guid = %entry.guid, "Dropping thin entry");
                }
                keep
            })
            .take(self.max_entries)
            .collect();

        tracing::debug!(
            feed = %feed.url,
            parsed = total,
            kept = entries.len(),
            dropped_short = dropped_short,
            "Feed fetched"
        );

        Ok(FetchedFeed {
            entries,
            dropped_short,
        })
    }
}

pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: Content-Length already over the cap
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
