//! Multi-language translation: model lifecycle, the bounded work queue,
//! and the caching service the pipeline calls.
//!
//! Layering, bottom up:
//!
//! - [`TranslationBackend`] runs a model; [`ModelManager`] bounds how many
//!   stay resident
//! - [`TaskQueue`] serializes work through a fixed worker pool with
//!   backpressure
//! - [`TranslationService`] adds the cache, the concurrency bound, retry
//!   and the original-text fallback

mod models;
mod queue;
mod service;

pub use models::{
    EchoBackend, HttpTranslationBackend, LanguagePair, ModelManager, ModelStats,
    TranslateError, TranslationBackend,
};
pub use queue::{JobError, JobHandle, QueueError, QueueStats, TaskQueue, TranslationJob};
pub use service::{TranslatedText, TranslationService};
