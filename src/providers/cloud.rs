//! Generic HTTP reranker endpoint client.

use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::RerankerConfig;
use crate::providers::CloudReranker;
use crate::{RagError, Result};

#[derive(Debug, Clone)]
pub struct HttpReranker {
    endpoint: Url,
    model: String,
    agent: ureq::Agent,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RerankRequest {
    model: String,
    query: String,
    documents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

impl HttpReranker {
    #[inline]
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.cloud_endpoint)
            .map_err(|e| RagError::Config(format!("Invalid reranker endpoint: {e}")))?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();

        Ok(Self {
            endpoint,
            model: config.cloud_model.clone(),
            agent,
            timeout,
        })
    }

    fn rerank_blocking(&self, query: &str, documents: &[String]) -> AnyResult<Vec<f32>> {
        let request = RerankRequest {
            model: self.model.clone(),
            query: query.to_string(),
            documents: documents.to_vec(),
        };

        let request_json =
            serde_json::to_string(&request).context("Failed to serialize rerank request")?;

        let mut response = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .context("Rerank request failed")?;

        let response_text = response
            .body_mut()
            .read_to_string()
            .context("Failed to read rerank response")?;

        let parsed: RerankResponse =
            serde_json::from_str(&response_text).context("Failed to parse rerank response")?;
        Ok(parsed.scores)
    }
}

#[async_trait]
impl CloudReranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.clone();
        let query = query.to_string();
        let documents: Vec<String> = documents.to_vec();
        let timeout = self.timeout;

        let work = tokio::task::spawn_blocking(move || client.rerank_blocking(&query, &documents));

        // The agent enforces its own transport timeout; this outer bound
        // covers queueing of the blocking task as well.
        let joined = tokio::time::timeout(timeout + Duration::from_millis(250), work)
            .await
            .map_err(|_| RagError::UpstreamTimeout {
                component: "cloud_reranker".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
            .map_err(|e| RagError::UpstreamFailure {
                component: "cloud_reranker".to_string(),
                reason: format!("worker task failed: {e}"),
            })?;

        let scores = joined.map_err(|e| RagError::UpstreamFailure {
            component: "cloud_reranker".to_string(),
            reason: e.to_string(),
        })?;

        Ok(scores)
    }
}
