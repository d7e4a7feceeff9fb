//! Storage gateway: persisted items, translations, and the publication log.
//!
//! Split per concern the way the schema is split:
//!
//! - [`schema`] - connection handling and migrations
//! - [`feeds`] - feed source configuration reads + last-fetch bookkeeping
//! - [`items`] - accepted news items and their embeddings
//! - [`translations`] - per-language translations
//! - [`publications`] - the append-only delivery log the rate limiter queries

mod feeds;
mod items;
mod publications;
mod schema;
mod translations;
mod types;

pub use feeds::NewFeedSource;
pub use items::StoredEmbedding;
pub use publications::NewPublication;
pub use schema::Database;
pub use types::{
    DatabaseError, FeedSource, NewNewsItem, NewsItem, PublicationRecord, RecipientType, Translation,
};
