use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN), and
    /// `DatabaseError::Migration`/`Other` for everything else.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: SQLite waits up to 5 seconds for locks to release
        // before returning SQLITE_BUSY. Handles transient contention between
        // the fetch pass and publication bookkeeping automatically.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers peak concurrent
        // readers (dedup lookups + rate-limit queries + fetch bookkeeping).
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
                || error_string.contains("sqlite_busy")
                || error_string.contains("sqlite_locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. A failure mid-migration rolls the schema back to
    /// its previous consistent state.
    async fn migrate(&self) -> Result<()> {
        // Per-connection setting, must run outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rss_feeds (
                id INTEGER PRIMARY KEY,
                source TEXT NOT NULL,
                url TEXT UNIQUE NOT NULL,
                category TEXT NOT NULL,
                language TEXT NOT NULL,
                cooldown_minutes INTEGER NOT NULL DEFAULT 10,
                max_news_per_hour INTEGER NOT NULL DEFAULT 10,
                is_active INTEGER NOT NULL DEFAULT 1,
                last_fetched_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS published_news_data (
                news_id INTEGER PRIMARY KEY,
                original_title TEXT NOT NULL,
                original_content TEXT NOT NULL,
                original_language TEXT NOT NULL,
                category TEXT NOT NULL,
                embedding BLOB,
                rss_feed_id INTEGER NOT NULL REFERENCES rss_feeds(id) ON DELETE CASCADE,
                source_url TEXT,
                image_filename TEXT,
                video_filename TEXT,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS news_translations (
                id INTEGER PRIMARY KEY,
                news_id INTEGER NOT NULL REFERENCES published_news_data(news_id) ON DELETE CASCADE,
                language TEXT NOT NULL,
                translated_title TEXT NOT NULL,
                translated_content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(news_id, language)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS publications (
                id INTEGER PRIMARY KEY,
                news_id INTEGER NOT NULL REFERENCES published_news_data(news_id) ON DELETE CASCADE,
                translation_id INTEGER REFERENCES news_translations(id) ON DELETE SET NULL,
                recipient_type TEXT NOT NULL CHECK (recipient_type IN ('channel', 'user')),
                recipient_id TEXT NOT NULL,
                message_ref TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Uniqueness per (news, translation, recipient). SQLite treats NULLs
        // as distinct in plain UNIQUE constraints, so original-language rows
        // (translation_id NULL) need the COALESCE form to dedupe.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_publications_unique
            ON publications(news_id, COALESCE(translation_id, -1), recipient_type, recipient_id)
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Indexes for the hot paths: dedup lookback scan and rate-limit queries
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_news_created ON published_news_data(created_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_news_feed ON published_news_data(rss_feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_translations_news ON news_translations(news_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_publications_sent ON publications(sent_at DESC)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_publications_news ON publications(news_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
