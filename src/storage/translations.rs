use anyhow::Result;

use super::schema::Database;
use super::types::Translation;

impl Database {
    // ========================================================================
    // Translation Operations
    // ========================================================================

    /// Store a translation, unique per (news item, language).
    ///
    /// A retried translation overwrites the previous text and bumps
    /// `updated_at`. Returns the translation id.
    pub async fn save_translation(
        &self,
        news_id: i64,
        language: &str,
        title: &str,
        content: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO news_translations (news_id, language, translated_title, translated_content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(news_id, language) DO UPDATE SET
                translated_title = excluded.translated_title,
                translated_content = excluded.translated_content,
                updated_at = excluded.updated_at
            RETURNING id
        "#,
        )
        .bind(news_id)
        .bind(language)
        .bind(title)
        .bind(content)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// All stored translations for an item. The pipeline loads these when
    /// it revisits an undelivered item in a later pass.
    pub async fn translations_for_item(&self, news_id: i64) -> Result<Vec<Translation>> {
        let translations = sqlx::query_as::<_, Translation>(
            r#"
            SELECT id, news_id, language, translated_title, translated_content, created_at, updated_at
            FROM news_translations
            WHERE news_id = ?
            ORDER BY language
        "#,
        )
        .bind(news_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(translations)
    }
}
