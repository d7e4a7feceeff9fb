//! Utility functions shared across pipeline stages.
//!
//! - **URL validation**: security-focused validation to prevent SSRF attacks
//! - **Text processing**: HTML stripping and word counting for feed entries
//! - **Retry**: a reusable bounded-backoff policy parameterized per call site

mod retry;
mod text;
mod url_validator;

pub use retry::RetryPolicy;
pub use text::{clean_html, truncate_chars, word_count};
pub use url_validator::{validate_url, UrlValidationError};
