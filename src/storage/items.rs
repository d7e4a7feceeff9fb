use anyhow::Result;

use super::schema::Database;
use super::types::{decode_embedding, encode_embedding, NewNewsItem, NewsItem};

/// A stored embedding paired with the item it belongs to, as consulted by
/// the duplicate detector.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub news_id: i64,
    pub embedding: Vec<f32>,
}

type ItemRow = (
    i64,
    String,
    String,
    String,
    String,
    Option<Vec<u8>>,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
);

fn item_from_row(row: ItemRow) -> Result<NewsItem> {
    let (
        news_id,
        original_title,
        original_content,
        original_language,
        category,
        embedding,
        rss_feed_id,
        source_url,
        image_filename,
        video_filename,
        created_at,
    ) = row;
    let embedding = embedding
        .map(|bytes| decode_embedding(news_id, &bytes))
        .transpose()?;
    Ok(NewsItem {
        news_id,
        original_title,
        original_content,
        original_language,
        category,
        embedding,
        rss_feed_id,
        source_url,
        image_filename,
        video_filename,
        created_at,
    })
}

impl Database {
    // ========================================================================
    // News Item Operations
    // ========================================================================

    /// Persist an accepted unique story. Returns the assigned news id.
    ///
    /// The item must be durably stored before any translation or publication
    /// may reference it.
    pub async fn save_item(&self, item: &NewNewsItem) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let embedding_bytes = item.embedding.as_deref().map(encode_embedding);

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO published_news_data
                (original_title, original_content, original_language, category,
                 embedding, rss_feed_id, source_url, image_filename, video_filename, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING news_id
        "#,
        )
        .bind(&item.original_title)
        .bind(&item.original_content)
        .bind(&item.original_language)
        .bind(&item.category)
        .bind(embedding_bytes)
        .bind(item.rss_feed_id)
        .bind(&item.source_url)
        .bind(&item.image_filename)
        .bind(&item.video_filename)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Get one news item by id.
    pub async fn get_item(&self, news_id: i64) -> Result<Option<NewsItem>> {
        let row: Option<ItemRow> = sqlx::query_as(
            r#"
            SELECT news_id, original_title, original_content, original_language, category,
                   embedding, rss_feed_id, source_url, image_filename, video_filename, created_at
            FROM published_news_data
            WHERE news_id = ?
        "#,
        )
        .bind(news_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(item_from_row).transpose()
    }

    /// Backfill the embedding of an already-persisted item.
    pub async fn set_item_embedding(&self, news_id: i64, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE published_news_data SET embedding = ? WHERE news_id = ?")
            .bind(encode_embedding(embedding))
            .bind(news_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Items for a feed with no delivery logged yet, oldest first.
    ///
    /// The pipeline revisits these each pass, so an item held back by the
    /// rate limiter is published later instead of being lost.
    pub async fn unpublished_items(&self, feed_id: i64) -> Result<Vec<NewsItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT news_id, original_title, original_content, original_language, category,
                   embedding, rss_feed_id, source_url, image_filename, video_filename, created_at
            FROM published_news_data
            WHERE rss_feed_id = ?
              AND news_id NOT IN (SELECT news_id FROM publications)
            ORDER BY created_at, news_id
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(item_from_row).collect()
    }

    /// Embeddings of items created within the last `window_hours`, newest
    /// first. This is the duplicate detector's comparison index.
    pub async fn recent_embeddings(&self, window_hours: i64) -> Result<Vec<StoredEmbedding>> {
        let cutoff = chrono::Utc::now().timestamp() - window_hours * 3600;
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT news_id, embedding
            FROM published_news_data
            WHERE embedding IS NOT NULL AND created_at >= ?
            ORDER BY created_at DESC
        "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(news_id, bytes)| {
                Ok(StoredEmbedding {
                    news_id,
                    embedding: decode_embedding(news_id, &bytes)?,
                })
            })
            .collect()
    }
}
