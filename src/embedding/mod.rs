//! Embedding backends.
//!
//! Concrete [`Embedder`] implementations:
//! - **[`DisabledEmbedder`]**: always unavailable; used when
//!   `embedding.provider = "disabled"`.
//! - **[`HttpEmbedder`]**: calls a remote dual-encoder service.
//! - **`LocalEmbedder`**: runs CLIP ViT-B/32 text and image encoders
//!   locally via fastembed (feature `local-embeddings-fastembed`).
//!
//! Backends make exactly one attempt per call. Retries, backoff, and
//! timeouts are applied by the callers through [`crate::retry`].
//!
//! # Error mapping
//!
//! - HTTP 429, 5xx, network errors → [`EmbeddingError::Unavailable`] (retryable)
//! - other HTTP 4xx → [`EmbeddingError::InvalidContent`]
//! - image bytes the encoder cannot decode → [`EmbeddingError::InvalidContent`]

#[cfg(feature = "local-embeddings-fastembed")]
mod local;

#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;

use mmrag_core::embedding::{normalize, Embedder};
use mmrag_core::error::EmbeddingError;
use mmrag_core::models::SpaceVersion;

use crate::config::EmbeddingConfig;

// ============ Disabled ============

/// An embedder that always fails with a retryable error.
pub struct DisabledEmbedder {
    space: SpaceVersion,
    dims: usize,
}

impl DisabledEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            space: SpaceVersion::new(&config.model, config.dims),
            dims: config.dims,
        }
    }
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn space(&self) -> SpaceVersion {
        self.space.clone()
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
    async fn embed_image(&self, _bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Unavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP ============

/// Dual encoder behind an HTTP endpoint.
///
/// Sends `POST {url}/embed` with
/// `{"model": ..., "modality": "text" | "image", "input": ...}` where image
/// input is base64. Expects `{"embedding": [f32, ...]}` back.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let Some(url) = config.url.as_deref() else {
            bail!("embedding.url required for http provider");
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embed", url.trim_end_matches('/')),
            model: config.model.clone(),
            dims: config.dims,
        })
    }

    async fn call(&self, modality: &str, input: String) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "modality": modality,
            "input": input,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                EmbeddingError::Unavailable(format!(
                    "embedding service unreachable at {}: {}",
                    self.endpoint, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("embedding service error {}: {}", status, text);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                EmbeddingError::Unavailable(message)
            } else {
                EmbeddingError::InvalidContent(message)
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("unreadable response: {}", e)))?;
        parse_embedding_response(&json)
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let values = json
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            EmbeddingError::Unavailable("invalid response: missing embedding array".to_string())
        })?;
    Ok(values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn space(&self) -> SpaceVersion {
        SpaceVersion::new(&self.model, self.dims)
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(normalize(&self.call("text", text.to_string()).await?))
    }
    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(normalize(&self.call("image", encoded).await?))
    }
}

/// Create the [`Embedder`] selected by configuration.
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
/// | `"http"` | [`HttpEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder::new(config))),
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_config(url: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: "http".to_string(),
            model: "clip-test".to_string(),
            dims: 3,
            url: Some(url.to_string()),
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_is_retryable_unavailable() {
        let e = DisabledEmbedder::new(&EmbeddingConfig::default());
        let err = e.embed_text("x").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(e.space().as_str(), "clip-vit-b-32@512");
    }

    #[tokio::test]
    async fn test_http_text_and_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(body_partial_json(serde_json::json!({"modality": "text"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": [3.0, 0.0, 4.0]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .and(body_partial_json(
                serde_json::json!({"modality": "image", "input": "AQID"}),
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embedding": [0.0, 1.0, 0.0]})),
            )
            .mount(&server)
            .await;

        let e = HttpEmbedder::new(&http_config(&server.uri())).unwrap();
        let v = e.embed_text("hello").await.unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[2] - 0.8).abs() < 1e-6);
        assert_eq!(e.embed_image(&[1, 2, 3]).await.unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"modality": "text"})))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"modality": "image"})))
            .respond_with(ResponseTemplate::new(422).set_body_string("not an image"))
            .mount(&server)
            .await;

        let e = HttpEmbedder::new(&http_config(&server.uri())).unwrap();
        assert!(matches!(
            e.embed_text("x").await,
            Err(EmbeddingError::Unavailable(_))
        ));
        assert!(matches!(
            e.embed_image(b"x").await,
            Err(EmbeddingError::InvalidContent(_))
        ));
    }

    #[test]
    fn test_create_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "magic".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
