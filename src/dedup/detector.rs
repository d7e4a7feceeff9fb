use std::sync::Arc;

use crate::config::DedupConfig;
use crate::dedup::embedding::{cosine_similarity, Embedder};
use crate::storage::Database;
use crate::util::truncate_chars;

// Content contribution to the embedded text is capped so one very long
// article body cannot drown out the title signal.
const EMBED_CONTENT_CHARS: usize = 500;

/// What the detector decided about one candidate item.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    /// Not a duplicate. Carries the embedding when one was computed, so
    /// the pipeline can store it for future comparisons. `None` means the
    /// backend failed and the item was admitted without a vector.
    Unique { embedding: Option<Vec<f32>> },
    /// Near-duplicate of an already stored item.
    Duplicate { news_id: i64, similarity: f32 },
}

/// Embedding-based near-duplicate detector.
///
/// Compares each candidate against every stored embedding inside the
/// lookback window. Detection fails open: an embedding backend or storage
/// error admits the item rather than dropping news on infrastructure
/// trouble.
pub struct DuplicateDetector {
    embedder: Arc<dyn Embedder>,
    db: Database,
    config: DedupConfig,
}

impl DuplicateDetector {
    pub fn new(embedder: Arc<dyn Embedder>, db: Database, config: DedupConfig) -> Self {
        Self {
            embedder,
            db,
            config,
        }
    }

    /// Decide whether a candidate duplicates a recently stored item.
    ///
    /// The embedded text is the title plus the first 500 characters of the
    /// content. A stored item matches when cosine similarity reaches the
    /// configured threshold; among several matches the most similar wins,
    /// with ties going to the most recently stored item.
    pub async fn check(&self, title: &str, content: &str) -> DedupDecision {
        if !self.config.enabled {
            return DedupDecision::Unique { embedding: None };
        }

        let text = embed_text(title, content);
        let embedding = match self.embedder.embed(&[text]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.swap_remove(0),
            Ok(_) => {
                tracing::warn!("Embedding backend returned no vectors, admitting item");
                return DedupDecision::Unique { embedding: None };
            }
            Err(e) => {
                tracing::warn!(error = %e, "Embedding failed, admitting item without vector");
                return DedupDecision::Unique { embedding: None };
            }
        };

        let stored = match self.db.recent_embeddings(self.config.lookback_hours).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Embedding lookback query failed, admitting item");
                return DedupDecision::Unique {
                    embedding: Some(embedding),
                };
            }
        };

        // Stored rows arrive newest first, so on equal similarity the most
        // recent item is kept as the match.
        let mut scored: Vec<(i64, f32)> = stored
            .iter()
            .map(|s| (s.news_id, cosine_similarity(&embedding, &s.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.config.candidate_limit);

        if let Some(&(news_id, similarity)) = scored.first() {
            if similarity >= self.config.similarity_threshold {
                tracing::info!(
                    matched_news_id = news_id,
                    similarity = similarity,
                    threshold = self.config.similarity_threshold,
                    "Duplicate detected"
                );
                return DedupDecision::Duplicate {
                    news_id,
                    similarity,
                };
            }
            tracing::debug!(
                nearest_news_id = news_id,
                similarity = similarity,
                candidates = scored.len(),
                "No duplicate within threshold"
            );
        }

        DedupDecision::Unique {
            embedding: Some(embedding),
        }
    }

    /// Embed an item's text without a duplicate check.
    ///
    /// Used to backfill rows that were admitted fail-open without a vector
    /// once the embedding backend recovers. `None` when detection is
    /// disabled or the backend is still failing.
    pub async fn embed(&self, title: &str, content: &str) -> Option<Vec<f32>> {
        if !self.config.enabled {
            return None;
        }
        let text = embed_text(title, content);
        match self.embedder.embed(&[text]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.swap_remove(0)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "Backfill embedding failed");
                None
            }
        }
    }
}

/// The text fed to the embedder for one item.
pub fn embed_text(title: &str, content: &str) -> String {
    format!("{} {}", title, truncate_chars(content, EMBED_CONTENT_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::embedding::HashEmbedder;
    use crate::storage::{NewFeedSource, NewNewsItem};

    async fn db_with_feed() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .add_feed(&NewFeedSource {
                source: "Example".to_string(),
                url: "https://example.com/rss".to_string(),
                category: "world".to_string(),
                language: "en".to_string(),
                cooldown_minutes: 10,
                max_news_per_hour: 10,
            })
            .await
            .unwrap();
        (db, feed_id)
    }

    async fn store_item(db: &Database, feed_id: i64, title: &str, embedding: Vec<f32>) -> i64 {
        db.save_item(&NewNewsItem {
            original_title: title.to_string(),
            original_content: "stored content".to_string(),
            original_language: "en".to_string(),
            category: "world".to_string(),
            embedding: Some(embedding),
            rss_feed_id: feed_id,
            source_url: None,
            image_filename: None,
            video_filename: None,
        })
        .await
        .unwrap()
    }

    fn detector(embedder: Arc<HashEmbedder>, db: Database, config: DedupConfig) -> DuplicateDetector {
        DuplicateDetector::new(embedder, db, config)
    }

    #[tokio::test]
    async fn test_first_item_is_unique() {
        let (db, _) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(16));
        let d = detector(embedder, db, DedupConfig::default());

        match d.check("Fresh headline", "Nothing like it stored").await {
            DedupDecision::Unique { embedding: Some(v) } => assert_eq!(v.len(), 16),
            other => panic!("Expected Unique with embedding, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identical_text_is_duplicate() {
        let (db, feed_id) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(16));

        let text = embed_text("Same headline", "Same body text");
        let vector = embedder.embed(&[text]).await.unwrap().swap_remove(0);
        let stored_id = store_item(&db, feed_id, "Same headline", vector).await;

        let d = detector(embedder, db, DedupConfig::default());
        match d.check("Same headline", "Same body text").await {
            DedupDecision::Duplicate { news_id, similarity } => {
                assert_eq!(news_id, stored_id);
                assert!(similarity > 0.99);
            }
            other => panic!("Expected Duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_most_similar_match_wins() {
        let (db, feed_id) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(4));
        embedder.set_vector(embed_text("Candidate", "body"), vec![1.0, 0.0, 0.0, 0.0]);

        let _near = store_item(&db, feed_id, "near", vec![0.9, 0.1, 0.0, 0.0]).await;
        let exact = store_item(&db, feed_id, "exact", vec![1.0, 0.0, 0.0, 0.0]).await;

        let d = detector(embedder, db, DedupConfig::default());
        match d.check("Candidate", "body").await {
            DedupDecision::Duplicate { news_id, .. } => assert_eq!(news_id, exact),
            other => panic!("Expected Duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_similarity_exactly_at_threshold_is_duplicate() {
        let (db, feed_id) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(4));
        let candidate = vec![1.0, 0.0, 0.0, 0.0];
        let stored = vec![0.5, 0.5, 0.0, 0.0];
        embedder.set_vector(embed_text("Candidate", "body"), candidate.clone());
        let stored_id = store_item(&db, feed_id, "stored", stored.clone()).await;

        // Pin the threshold to the exact similarity of the pair; the
        // boundary must classify as duplicate
        let threshold = cosine_similarity(&candidate, &stored);
        let config = DedupConfig {
            similarity_threshold: threshold,
            ..DedupConfig::default()
        };
        let d = detector(embedder, db, config);
        match d.check("Candidate", "body").await {
            DedupDecision::Duplicate { news_id, similarity } => {
                assert_eq!(news_id, stored_id);
                assert_eq!(similarity, threshold);
            }
            other => panic!("Expected Duplicate at the boundary, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_below_threshold_is_unique() {
        let (db, feed_id) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(4));
        embedder.set_vector(embed_text("Candidate", "body"), vec![1.0, 0.0, 0.0, 0.0]);
        store_item(&db, feed_id, "other", vec![0.0, 1.0, 0.0, 0.0]).await;

        let d = detector(embedder, db, DedupConfig::default());
        match d.check("Candidate", "body").await {
            DedupDecision::Unique { embedding: Some(_) } => {}
            other => panic!("Expected Unique, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_embedder_failure_fails_open() {
        let (db, feed_id) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(16));

        let text = embed_text("Same headline", "Same body text");
        let vector = embedder.embed(&[text]).await.unwrap().swap_remove(0);
        store_item(&db, feed_id, "Same headline", vector).await;

        embedder.fail_requests(true);
        let d = detector(embedder, db, DedupConfig::default());
        match d.check("Same headline", "Same body text").await {
            DedupDecision::Unique { embedding: None } => {}
            other => panic!("Expected fail-open Unique, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_detector_admits_everything() {
        let (db, _) = db_with_feed().await;
        let embedder = Arc::new(HashEmbedder::new(16));
        embedder.fail_requests(true); // Must never be called

        let config = DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        };
        let d = detector(embedder, db, config);
        match d.check("Anything", "at all").await {
            DedupDecision::Unique { embedding: None } => {}
            other => panic!("Expected Unique, got {:?}", other),
        }
    }

    #[test]
    fn test_embed_text_truncates_content() {
        let long_content = "x".repeat(2000);
        let text = embed_text("Title", &long_content);
        assert_eq!(text.chars().count(), "Title ".len() + EMBED_CONTENT_CHARS);
    }
}
