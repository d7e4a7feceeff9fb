//! News ingestion pipeline: fetch RSS/Atom feeds, drop near-duplicate
//! stories, persist the survivors, translate them into a configured set of
//! languages, and publish each under a per-feed rate limit.
//!
//! The [`pipeline::Pipeline`] is the assembled whole; everything else is a
//! component it wires together. The embedding and translation backends and
//! the delivery channel are trait seams, so the binary runs against an
//! inference server and a webhook while tests run fully in memory.

pub mod cache;
pub mod config;
pub mod dedup;
pub mod feed;
pub mod pipeline;
pub mod publish;
pub mod storage;
pub mod translate;
pub mod util;

pub use config::Config;
pub use pipeline::{PassStats, Pipeline};
pub use storage::Database;
