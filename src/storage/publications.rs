use anyhow::Result;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{PublicationRecord, RecipientType};

/// Insert payload for a publication record.
#[derive(Debug, Clone)]
pub struct NewPublication {
    pub news_id: i64,
    /// `None` when the original-language text was published.
    pub translation_id: Option<i64>,
    pub recipient_type: RecipientType,
    pub recipient_id: String,
    pub message_ref: String,
}

impl Database {
    // ========================================================================
    // Publication Log Operations
    // ========================================================================

    /// Append one delivery to the publication log.
    ///
    /// The log is append-only and unique per (news, translation, recipient);
    /// re-recording the same delivery is a no-op returning the existing id.
    pub async fn record_publication(&self, publication: &NewPublication) -> Result<i64> {
        self.record_publication_at(publication, Utc::now()).await
    }

    /// As [`record_publication`] with an explicit timestamp.
    ///
    /// [`record_publication`]: Database::record_publication
    pub async fn record_publication_at(
        &self,
        publication: &NewPublication,
        sent_at: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO publications (news_id, translation_id, recipient_type, recipient_id, message_ref, sent_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
        "#,
        )
        .bind(publication.news_id)
        .bind(publication.translation_id)
        .bind(publication.recipient_type.as_str())
        .bind(&publication.recipient_id)
        .bind(&publication.message_ref)
        .bind(sent_at.timestamp())
        .execute(&self.pool)
        .await?;

        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT id FROM publications
            WHERE news_id = ? AND COALESCE(translation_id, -1) = COALESCE(?, -1)
              AND recipient_type = ? AND recipient_id = ?
        "#,
        )
        .bind(publication.news_id)
        .bind(publication.translation_id)
        .bind(publication.recipient_type.as_str())
        .bind(&publication.recipient_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Count distinct items published for a feed with `sent_at >= since`.
    ///
    /// One item delivered to several language channels counts once; the
    /// hourly budget is per story, not per delivery. Publications reference
    /// items, not feeds, so the count joins through `published_news_data`.
    pub async fn count_publications(&self, feed_id: i64, since: DateTime<Utc>) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT p.news_id)
            FROM publications p
            JOIN published_news_data n ON p.news_id = n.news_id
            WHERE n.rss_feed_id = ? AND p.sent_at >= ?
        "#,
        )
        .bind(feed_id)
        .bind(since.timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// Timestamp of the most recent publication for a feed, if any.
    pub async fn last_publication_time(&self, feed_id: i64) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT MAX(p.sent_at)
            FROM publications p
            JOIN published_news_data n ON p.news_id = n.news_id
            WHERE n.rss_feed_id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.and_then(|ts| DateTime::from_timestamp(ts, 0)))
    }

    /// All deliveries logged for one item, oldest first.
    pub async fn publications_for_item(&self, news_id: i64) -> Result<Vec<PublicationRecord>> {
        let rows: Vec<(i64, i64, Option<i64>, String, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, news_id, translation_id, recipient_type, recipient_id, message_ref, sent_at
            FROM publications
            WHERE news_id = ?
            ORDER BY sent_at, id
        "#,
        )
        .bind(news_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, news_id, translation_id, recipient_type, recipient_id, message_ref, sent_at)| {
                    PublicationRecord {
                        id,
                        news_id,
                        translation_id,
                        // CHECK constraint limits the column to known values
                        recipient_type: RecipientType::parse(&recipient_type)
                            .unwrap_or(RecipientType::Channel),
                        recipient_id,
                        message_ref,
                        sent_at,
                    }
                },
            )
            .collect())
    }
}
