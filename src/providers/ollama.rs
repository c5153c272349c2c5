//! Ollama-backed embedding and chat clients.

use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::EmbeddingConfig;
use crate::providers::{ChatModel, EmbeddingProvider, GenerateOptions};
use crate::{RagError, Result};

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct OllamaEmbedding {
    base_url: Url,
    model: String,
    dimension: usize,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    model: String,
    #[serde(rename = "input")]
    inputs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateRequestOptions,
}

#[derive(Debug, Serialize)]
struct GenerateRequestOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaEmbedding {
    #[inline]
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.endpoint)
            .map_err(|e| RagError::Config(format!("Invalid embedding endpoint: {e}")))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            dimension: config.dimension,
            agent,
        })
    }

    fn embed_blocking(&self, texts: &[String]) -> AnyResult<Vec<Vec<f32>>> {
        let request = BatchEmbedRequest {
            model: self.model.clone(),
            inputs: texts.to_vec(),
        };

        let url = self
            .base_url
            .join("/api/embed")
            .context("Failed to build embedding URL")?;

        let request_json =
            serde_json::to_string(&request).context("Failed to serialize embedding request")?;

        let mut response = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .context("Embedding request failed")?;

        let response_text = response
            .body_mut()
            .read_to_string()
            .context("Failed to read embedding response")?;

        let batch_response: BatchEmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;

        debug!(
            "Embedded {} texts ({} vectors returned)",
            texts.len(),
            batch_response.embeddings.len()
        );
        Ok(batch_response.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    fn provider(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.clone();
        let batch: Vec<String> = texts.to_vec();
        let joined = tokio::task::spawn_blocking(move || client.embed_blocking(&batch))
            .await
            .map_err(|e| RagError::UpstreamFailure {
                component: "embedding".to_string(),
                reason: format!("worker task failed: {e}"),
            })?;

        joined.map_err(|e| RagError::UpstreamFailure {
            component: "embedding".to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OllamaChatModel {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
}

impl OllamaChatModel {
    #[inline]
    pub fn new(endpoint: &str, model: &str) -> Result<Self> {
        let base_url = Url::parse(endpoint)
            .map_err(|e| RagError::Config(format!("Invalid chat endpoint: {e}")))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: model.to_string(),
            agent,
        })
    }

    fn generate_blocking(&self, prompt: &str, options: &GenerateOptions) -> AnyResult<String> {
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: GenerateRequestOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let url = self
            .base_url
            .join("/api/generate")
            .context("Failed to build generate URL")?;

        let request_json =
            serde_json::to_string(&request).context("Failed to serialize generate request")?;

        let mut response = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .context("Generate request failed")?;

        let response_text = response
            .body_mut()
            .read_to_string()
            .context("Failed to read generate response")?;

        let parsed: GenerateResponse =
            serde_json::from_str(&response_text).context("Failed to parse generate response")?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl ChatModel for OllamaChatModel {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let client = self.clone();
        let prompt = prompt.to_string();
        let options = options.clone();

        let joined =
            tokio::task::spawn_blocking(move || client.generate_blocking(&prompt, &options))
                .await
                .map_err(|e| RagError::UpstreamFailure {
                    component: "chat".to_string(),
                    reason: format!("worker task failed: {e}"),
                })?;

        joined.map_err(|e| RagError::UpstreamFailure {
            component: "chat".to_string(),
            reason: e.to_string(),
        })
    }
}
