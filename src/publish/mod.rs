//! Publication: per-feed admission control and delivery channels.

mod channel;
mod rate_limiter;

pub use channel::{OutgoingMessage, PublicationChannel, PublishError, RecordingChannel, WebhookChannel};
pub use rate_limiter::RateLimiter;
