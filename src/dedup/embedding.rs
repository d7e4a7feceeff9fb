use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::InferenceConfig;

/// Errors from an embedding backend.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Embedding API error: status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Embedding request timed out")]
    Timeout,
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Produces sentence embeddings for duplicate detection.
///
/// Implementations must return one vector per input text, in input order,
/// all of [`dimension`] length.
///
/// [`dimension`]: Embedder::dimension
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Vector length this backend produces.
    fn dimension(&self) -> usize;
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// [`Embedder`] backed by an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    request_timeout: Duration,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: &InferenceConfig, dimension: usize) -> Self {
        Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.embedding_model.clone(),
            dimension,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.request_timeout, request.send())
            .await
            .map_err(|_| EmbedError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: EmbeddingResponse = response.json().await?;
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();

        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.dimension,
                    got: vector.len(),
                });
            }
        }

        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Offline backend
// ============================================================================

/// Deterministic offline [`Embedder`].
///
/// Hashes the text into a pseudo-random unit vector, so identical texts
/// embed identically and unrelated texts land near-orthogonal. Used by
/// tests and `--dry-run` pipelines where no inference server is available.
pub struct HashEmbedder {
    dimension: usize,
    overrides: std::sync::Mutex<std::collections::HashMap<String, Vec<f32>>>,
    fail: std::sync::atomic::AtomicBool,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: std::sync::Mutex::new(std::collections::HashMap::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pin the vector returned for an exact text.
    pub fn set_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.overrides
            .lock()
            .expect("overrides lock poisoned")
            .insert(text.into(), vector);
    }

    /// Make every subsequent `embed` call fail.
    pub fn fail_requests(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut vector = Vec::with_capacity(self.dimension);
        let mut counter: u32 = 0;
        while vector.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for byte in digest {
                if vector.len() == self.dimension {
                    break;
                }
                vector.push((byte as f32 - 127.5) / 127.5);
            }
            counter += 1;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(EmbedError::Api {
                status: 503,
                message: "embedder unavailable".to_string(),
            });
        }

        let overrides = self.overrides.lock().expect("overrides lock poisoned");
        Ok(texts
            .iter()
            .map(|text| {
                overrides
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| self.hash_vector(text))
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Similarity
// ============================================================================

/// Cosine similarity of two vectors.
///
/// Zero-magnitude vectors compare as 0.0 rather than NaN. Mismatched
/// lengths compare over the shorter prefix.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.3, 0.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite_vectors() {
        let a = vec![1.0, 2.0];
        let b = vec![-1.0, -2.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    fn inference_config(uri: &str) -> InferenceConfig {
        InferenceConfig {
            base_url: uri.to_string(),
            ..InferenceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_http_embedder_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [1.0, 0.0, 0.0]},
                    {"embedding": [0.0, 1.0, 0.0]}
                ]
            })))
            .mount(&mock_server)
            .await;

        let embedder = HttpEmbedder::new(reqwest::Client::new(), &inference_config(&mock_server.uri()), 3);
        let vectors = embedder
            .embed(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_http_embedder_api_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&mock_server)
            .await;

        let embedder = HttpEmbedder::new(reqwest::Client::new(), &inference_config(&mock_server.uri()), 3);
        let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
        match err {
            EmbedError::Api { status: 500, message } => assert!(message.contains("overloaded")),
            e => panic!("Expected Api error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_http_embedder_dimension_check() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"embedding": [1.0, 0.0]}]
            })))
            .mount(&mock_server)
            .await;

        let embedder = HttpEmbedder::new(reqwest::Client::new(), &inference_config(&mock_server.uri()), 3);
        let err = embedder.embed(&["text".to_string()]).await.unwrap_err();
        match err {
            EmbedError::DimensionMismatch { expected: 3, got: 2 } => {}
            e => panic!("Expected DimensionMismatch, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed(&["same text".to_string()]).await.unwrap();
        let b = embedder.embed(&["same text".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert!((cosine_similarity(&a[0], &b[0]) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_hash_embedder_unrelated_texts_dissimilar() {
        let embedder = HashEmbedder::new(384);
        let vectors = embedder
            .embed(&["first story".to_string(), "another story".to_string()])
            .await
            .unwrap();
        let similarity = cosine_similarity(&vectors[0], &vectors[1]);
        assert!(similarity < 0.5, "similarity was {}", similarity);
    }

    #[tokio::test]
    async fn test_hash_embedder_failure_mode() {
        let embedder = HashEmbedder::new(8);
        embedder.fail_requests(true);
        assert!(embedder.embed(&["x".to_string()]).await.is_err());
        embedder.fail_requests(false);
        assert!(embedder.embed(&["x".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_embedder_empty_input_skips_request() {
        let embedder = HttpEmbedder::new(
            reqwest::Client::new(),
            &inference_config("http://127.0.0.1:1"),
            3,
        );
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }
}
