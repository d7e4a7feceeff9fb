use anyhow::Result;

use super::schema::Database;
use super::types::FeedSource;

/// Insert payload for a new feed source.
#[derive(Debug, Clone)]
pub struct NewFeedSource {
    pub source: String,
    pub url: String,
    pub category: String,
    pub language: String,
    pub cooldown_minutes: i64,
    pub max_news_per_hour: i64,
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Add a feed source; on URL conflict updates the metadata in place.
    ///
    /// Returns the feed's id.
    pub async fn add_feed(&self, feed: &NewFeedSource) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rss_feeds (source, url, category, language, cooldown_minutes, max_news_per_hour)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                source = excluded.source,
                category = excluded.category,
                language = excluded.language,
                cooldown_minutes = excluded.cooldown_minutes,
                max_news_per_hour = excluded.max_news_per_hour
            RETURNING id
        "#,
        )
        .bind(&feed.source)
        .bind(&feed.url)
        .bind(&feed.category)
        .bind(&feed.language)
        .bind(feed.cooldown_minutes)
        .bind(feed.max_news_per_hour)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Get all active feed sources, ordered by category.
    pub async fn get_active_feeds(&self) -> Result<Vec<FeedSource>> {
        let feeds = sqlx::query_as::<_, FeedSource>(
            r#"
            SELECT id, source, url, category, language, cooldown_minutes,
                   max_news_per_hour, is_active, last_fetched_at
            FROM rss_feeds
            WHERE is_active = 1
            ORDER BY category, id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    /// Get one feed source by id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<FeedSource>> {
        let feed = sqlx::query_as::<_, FeedSource>(
            r#"
            SELECT id, source, url, category, language, cooldown_minutes,
                   max_news_per_hour, is_active, last_fetched_at
            FROM rss_feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Activate or deactivate a feed.
    pub async fn set_feed_active(&self, feed_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE rss_feeds SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Update the last-fetch bookkeeping timestamp for a feed.
    pub async fn update_feed_fetched(&self, feed_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE rss_feeds SET last_fetched_at = ? WHERE id = ?")
            .bind(now)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_feed(url: &str) -> NewFeedSource {
        NewFeedSource {
            source: "Example News".to_string(),
            url: url.to_string(),
            category: "world".to_string(),
            language: "en".to_string(),
            cooldown_minutes: 10,
            max_news_per_hour: 10,
        }
    }

    #[tokio::test]
    async fn test_add_and_get_active_feeds() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed("https://a.example.com/rss")).await.unwrap();

        let feeds = db.get_active_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, id);
        assert_eq!(feeds[0].url, "https://a.example.com/rss");
        assert_eq!(feeds[0].cooldown_minutes, 10);
        assert!(feeds[0].is_active);
        assert!(feeds[0].last_fetched_at.is_none());
    }

    #[tokio::test]
    async fn test_add_feed_conflict_updates_in_place() {
        let db = test_db().await;
        let first = db.add_feed(&test_feed("https://a.example.com/rss")).await.unwrap();

        let mut updated = test_feed("https://a.example.com/rss");
        updated.category = "technology".to_string();
        updated.max_news_per_hour = 3;
        let second = db.add_feed(&updated).await.unwrap();

        assert_eq!(first, second);
        let feed = db.get_feed(first).await.unwrap().unwrap();
        assert_eq!(feed.category, "technology");
        assert_eq!(feed.max_news_per_hour, 3);
    }

    #[tokio::test]
    async fn test_inactive_feed_excluded() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed("https://a.example.com/rss")).await.unwrap();
        db.set_feed_active(id, false).await.unwrap();

        assert!(db.get_active_feeds().await.unwrap().is_empty());
        // Still retrievable directly
        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert!(!feed.is_active);
    }

    #[tokio::test]
    async fn test_update_feed_fetched() {
        let db = test_db().await;
        let id = db.add_feed(&test_feed("https://a.example.com/rss")).await.unwrap();
        db.update_feed_fetched(id).await.unwrap();

        let feed = db.get_feed(id).await.unwrap().unwrap();
        assert!(feed.last_fetched_at.is_some());
    }
}
