use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the pipeline has locked the database
    #[error("Another instance of firefeed appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Stored embedding BLOB is not a whole number of f32 values
    #[error("Corrupt embedding for news item {news_id}: {len} bytes")]
    CorruptEmbedding { news_id: i64, len: usize },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A configured RSS/Atom source with its publication limits.
///
/// Owned by configuration; the pipeline only reads it, except for
/// last-fetch bookkeeping.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedSource {
    pub id: i64,
    pub source: String,
    pub url: String,
    pub category: String,
    pub language: String,
    /// Minimum minutes between allowed publications for this feed.
    pub cooldown_minutes: i64,
    /// Publication count cap inside the effective interval.
    pub max_news_per_hour: i64,
    pub is_active: bool,
    pub last_fetched_at: Option<i64>,
}

/// A deduplicated, persisted story.
#[derive(Debug, Clone)]
pub struct NewsItem {
    pub news_id: i64,
    pub original_title: String,
    pub original_content: String,
    pub original_language: String,
    pub category: String,
    pub embedding: Option<Vec<f32>>,
    pub rss_feed_id: i64,
    pub source_url: Option<String>,
    pub image_filename: Option<String>,
    pub video_filename: Option<String>,
    pub created_at: i64,
}

/// Insert payload for a news item; the id and timestamp are assigned by
/// the storage layer.
#[derive(Debug, Clone)]
pub struct NewNewsItem {
    pub original_title: String,
    pub original_content: String,
    pub original_language: String,
    pub category: String,
    pub embedding: Option<Vec<f32>>,
    pub rss_feed_id: i64,
    pub source_url: Option<String>,
    pub image_filename: Option<String>,
    pub video_filename: Option<String>,
}

/// A stored translation, unique per (news item, language).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Translation {
    pub id: i64,
    pub news_id: i64,
    pub language: String,
    pub translated_title: String,
    pub translated_content: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Who a publication was delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientType {
    Channel,
    User,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::Channel => "channel",
            RecipientType::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "channel" => Some(RecipientType::Channel),
            "user" => Some(RecipientType::User),
            _ => None,
        }
    }
}

/// Append-only record of one delivery; the authoritative log consulted by
/// the publication rate limiter.
#[derive(Debug, Clone)]
pub struct PublicationRecord {
    pub id: i64,
    pub news_id: i64,
    /// `None` means the original-language text was published.
    pub translation_id: Option<i64>,
    pub recipient_type: RecipientType,
    pub recipient_id: String,
    pub message_ref: String,
    pub sent_at: i64,
}

// ============================================================================
// Embedding Encoding
// ============================================================================

/// Encode an embedding as a little-endian f32 BLOB.
pub(crate) fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 BLOB back into an embedding vector.
pub(crate) fn decode_embedding(news_id: i64, bytes: &[u8]) -> Result<Vec<f32>, DatabaseError> {
    if bytes.len() % 4 != 0 {
        return Err(DatabaseError::CorruptEmbedding {
            news_id,
            len: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
