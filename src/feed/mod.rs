//! Feed acquisition: parsing, validation, concurrent fetching, and media
//! selection.
//!
//! Fetching is side-effect free. The pipeline owns all persistence; this
//! module turns feed URLs into cleaned [`RawEntry`] values and nothing else.

mod fetcher;
mod media;
mod parser;
mod validator;

pub use fetcher::{FeedFetcher, FetchError, FetchOutcome, FetchedFeed};
pub use media::{extract_media, ExtractedMedia, MediaPolicy, MediaPreference};
pub use parser::{parse_feed, MediaCandidate, RawEntry};
pub use validator::{FeedValidator, ValidationVerdict};
