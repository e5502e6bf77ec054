//! Text generation backends.
//!
//! - **[`DisabledGenerator`]**: always unavailable.
//! - **[`OllamaGenerator`]**: `POST {url}/api/chat` on a local Ollama.
//! - **[`OpenAiGenerator`]**: `POST {url}/v1/chat/completions` on any
//!   OpenAI-compatible server; reads `OPENAI_API_KEY` from the environment.
//!
//! Like the embedding backends these make a single attempt per call; the
//! retrieval orchestrator wraps them in [`crate::retry::with_retry`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use mmrag_core::error::GenerationError;
use mmrag_core::generation::{GenerationRequest, Generator, PromptMessage};

use crate::config::GenerationConfig;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Map a non-success HTTP status to a generation error.
fn status_error(status: reqwest::StatusCode, body: String) -> GenerationError {
    let message = format!("generation service error {}: {}", status, body);
    if status.as_u16() == 429 || status.is_server_error() {
        GenerationError::Unavailable(message)
    } else {
        GenerationError::Rejected(message)
    }
}

fn http_client(config: &GenerationConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn chat_messages(messages: &[PromptMessage]) -> Vec<ChatMessage<'_>> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(
            "generation provider is disabled".to_string(),
        ))
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    http: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let url = config.url.as_deref().unwrap_or(DEFAULT_OLLAMA_URL);
        Ok(Self {
            http: http_client(config)?,
            url: format!("{}/api/chat", url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        debug!(model = %self.model, url = %self.url, "ollama chat");
        let resp = self
            .http
            .post(&self.url)
            .json(&OllamaRequest {
                model: &self.model,
                messages: chat_messages(&request.messages),
                stream: false,
                options: OllamaOptions {
                    temperature: request.temperature,
                },
            })
            .send()
            .await
            .map_err(|e| {
                GenerationError::Unavailable(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("unreadable response: {}", e)))?;
        Ok(body.message.content)
    }
}

// ============ OpenAI-compatible ============

pub struct OpenAiGenerator {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let Ok(api_key) = std::env::var("OPENAI_API_KEY") else {
            bail!("OPENAI_API_KEY environment variable not set");
        };
        let url = config.url.as_deref().unwrap_or(DEFAULT_OPENAI_URL);
        Ok(Self {
            http: http_client(config)?,
            url: format!("{}/v1/chat/completions", url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OllamaMessage,
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        debug!(model = %self.model, url = %self.url, "openai chat");
        let resp = self
            .http
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&OpenAiRequest {
                model: &self.model,
                messages: chat_messages(&request.messages),
                temperature: request.temperature,
            })
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("connection error: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body: OpenAiResponse = resp
            .json()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("unreadable response: {}", e)))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::Unavailable("response has no choices".to_string()))
    }
}

/// Create the [`Generator`] selected by configuration.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
