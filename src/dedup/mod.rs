//! Embedding-based near-duplicate detection.
//!
//! The [`Embedder`] trait hides the inference backend; [`DuplicateDetector`]
//! compares candidates against stored vectors inside a lookback window and
//! fails open when either side errors.

mod detector;
mod embedding;

pub use detector::{embed_text, DedupDecision, DuplicateDetector};
pub use embedding::{cosine_similarity, EmbedError, Embedder, HashEmbedder, HttpEmbedder};
