use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::PublicationConfig;
use crate::storage::RecipientType;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a publication channel.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Publish API error: status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Publish request timed out")]
    Timeout,
    #[error("No channel configured for language {0}")]
    NoChannel(String),
}

/// One message ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    #[serde(skip)]
    pub recipient_type: RecipientType,
    pub recipient_id: String,
    pub language: String,
    pub title: String,
    pub content: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
}

/// Delivers messages to the outside world.
///
/// `publish` returns an opaque message reference recorded in the
/// publication log for traceability.
#[async_trait]
pub trait PublicationChannel: Send + Sync {
    async fn publish(&self, message: &OutgoingMessage) -> Result<String, PublishError>;
}

// ============================================================================
// Webhook channel
// ============================================================================

#[derive(Deserialize)]
struct WebhookResponse {
    message_id: Option<String>,
}

/// [`PublicationChannel`] posting each message as JSON to a webhook.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    /// Build from config; `None` when no webhook is configured.
    pub fn from_config(client: reqwest::Client, config: &PublicationConfig) -> Option<Self> {
        config.webhook_url.as_ref().map(|url| Self {
            client,
            url: url.clone(),
        })
    }
}

#[async_trait]
impl PublicationChannel for WebhookChannel {
    async fn publish(&self, message: &OutgoingMessage) -> Result<String, PublishError> {
        let response = tokio::time::timeout(
            PUBLISH_TIMEOUT,
            self.client.post(&self.url).json(message).send(),
        )
        .await
        .map_err(|_| PublishError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        // Not every webhook returns a body; fall back to a synthetic ref
        let message_ref = response
            .json::<WebhookResponse>()
            .await
            .ok()
            .and_then(|r| r.message_id)
            .unwrap_or_else(|| format!("webhook-{}", chrono::Utc::now().timestamp_millis()));
        Ok(message_ref)
    }
}

// ============================================================================
// Recording channel
// ============================================================================

/// In-memory [`PublicationChannel`] that records instead of sending.
/// Backs tests and `--dry-run` pipelines.
#[derive(Default)]
pub struct RecordingChannel {
    sent: std::sync::Mutex<Vec<OutgoingMessage>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }
}

#[async_trait]
impl PublicationChannel for RecordingChannel {
    async fn publish(&self, message: &OutgoingMessage) -> Result<String, PublishError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PublishError::Api {
                status: 503,
                message: "channel unavailable".to_string(),
            });
        }
        let mut sent = self.sent.lock().expect("sent lock poisoned");
        sent.push(message.clone());
        Ok(format!("rec-{}", sent.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(language: &str) -> OutgoingMessage {
        OutgoingMessage {
            recipient_type: RecipientType::Channel,
            recipient_id: "-100123".to_string(),
            language: language.to_string(),
            title: "Title".to_string(),
            content: "Content".to_string(),
            source_url: Some("https://example.com/story".to_string()),
            image_url: None,
            video_url: None,
        }
    }

    #[tokio::test]
    async fn test_webhook_publish_uses_returned_message_id() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"message_id": "42"})),
            )
            .mount(&mock_server)
            .await;

        let channel = WebhookChannel {
            client: reqwest::Client::new(),
            url: format!("{}/hook", mock_server.uri()),
        };
        let message_ref = channel.publish(&message("en")).await.unwrap();
        assert_eq!(message_ref, "42");
    }

    #[tokio::test]
    async fn test_webhook_publish_synthesizes_ref_without_body() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;

        let channel = WebhookChannel {
            client: reqwest::Client::new(),
            url: format!("{}/hook", mock_server.uri()),
        };
        let message_ref = channel.publish(&message("en")).await.unwrap();
        assert!(message_ref.starts_with("webhook-"));
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&mock_server)
            .await;

        let channel = WebhookChannel {
            client: reqwest::Client::new(),
            url: format!("{}/hook", mock_server.uri()),
        };
        match channel.publish(&message("en")).await.unwrap_err() {
            PublishError::Api { status: 502, .. } => {}
            e => panic!("Expected Api error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_recording_channel_captures_messages() {
        let channel = RecordingChannel::new();
        let ref1 = channel.publish(&message("en")).await.unwrap();
        let ref2 = channel.publish(&message("ru")).await.unwrap();
        assert_ne!(ref1, ref2);

        let sent = channel.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].language, "ru");
    }

    #[tokio::test]
    async fn test_from_config_requires_url() {
        let client = reqwest::Client::new();
        assert!(WebhookChannel::from_config(client.clone(), &PublicationConfig::default()).is_none());

        let config = PublicationConfig {
            webhook_url: Some("https://example.com/hook".to_string()),
            ..PublicationConfig::default()
        };
        assert!(WebhookChannel::from_config(client, &config).is_some());
    }
}
