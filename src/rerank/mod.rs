// Reranking module
// Cross-encoder reranking with a hot-swappable learned adapter

pub mod scorer;
pub mod swap;
pub mod watcher;


use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{RerankerConfig, RerankerMode};
use crate::providers::CloudReranker;
use crate::retriever::{ChunkMatch, MatchSource};
use crate::{RagError, Result};

use scorer::{Adapter, CrossEncoderBackend, LexicalCrossEncoder, LoadedModel};
use swap::ModelSlot;

/// Cross-encoder reranker over the fused candidate list.
///
/// Holds the active model behind a hot-swappable slot. Each request pins
/// one model version for all of its batches, so a swap mid-request can
/// never mix weights.
pub struct Reranker {
    config: RerankerConfig,
    backend: Arc<dyn CrossEncoderBackend>,
    slot: Arc<ModelSlot>,
    cloud: Option<Arc<dyn CloudReranker>>,
    watcher_cancel: Option<CancellationToken>,
}

impl Reranker {
    /// Build a reranker and, in `learned` mode, start the adapter
    /// watcher in the background.
    #[inline]
    pub fn new(config: RerankerConfig, cloud: Option<Arc<dyn CloudReranker>>) -> Self {
        let backend: Arc<dyn CrossEncoderBackend> =
            Arc::new(LexicalCrossEncoder::new(&config.local_model));
        let slot = Arc::new(ModelSlot::new());

        let watcher_cancel = if config.mode == RerankerMode::Learned {
            config.adapter_path.as_ref().map(|path| {
                let cancel = CancellationToken::new();
                tokio::spawn(watcher::watch(
                    slot.clone(),
                    backend.clone(),
                    watcher::WatcherConfig {
                        adapter_path: path.clone(),
                        poll_period: Duration::from_secs(config.reload_period_sec.max(1)),
                        min_reload_interval: Duration::from_secs(config.reload_period_sec),
                        unload_after: Duration::from_secs(config.unload_after_sec.max(1)),
                    },
                    cancel.clone(),
                ));
                cancel
            })
        } else {
            None
        };

        Self {
            config,
            backend,
            slot,
            cloud,
            watcher_cancel,
        }
    }

    #[inline]
    pub fn mode(&self) -> RerankerMode {
        self.config.mode
    }

    /// Re-score and reorder the fused matches, truncating to `top_n`.
    /// The input set is never extended; fusion scores survive in each
    /// match's `fused_score` sidecar.
    pub async fn rerank(
        &self,
        query: &str,
        matches: Vec<ChunkMatch>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkMatch>> {
        if matches.is_empty() || self.config.mode == RerankerMode::None {
            return Ok(matches);
        }
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let scores = match self.config.mode {
            RerankerMode::None => unreachable!("handled above"),
            RerankerMode::Local | RerankerMode::Learned => {
                self.score_local(query, &matches, cancel).await?
            }
            RerankerMode::Cloud => self.score_cloud(query, &matches).await?,
        };

        let (scores, version_tag) = scores;
        let mut rescored: Vec<ChunkMatch> = matches
            .into_iter()
            .zip(scores.into_iter())
            .map(|(mut m, score)| {
                m.fused_score = m.fused_score.or(Some(m.score));
                m.score = score;
                m.source = MatchSource::Reranked;
                m.metadata.insert(
                    "reranker_version".to_string(),
                    serde_json::Value::from(version_tag.clone()),
                );
                m
            })
            .collect();

        rescored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        rescored.truncate(self.config.top_n);
        for (i, m) in rescored.iter_mut().enumerate() {
            m.rank_within_source = i + 1;
        }

        debug!("Reranked down to {} matches", rescored.len());
        Ok(rescored)
    }

    /// Score with the resident model. The model `Arc` acquired here is
    /// held across every batch of this request.
    async fn score_local(
        &self,
        query: &str,
        matches: &[ChunkMatch],
        cancel: &CancellationToken,
    ) -> Result<(Vec<f32>, String)> {
        let model = self.slot.acquire(|| self.load_model()).await?;
        let version_tag = model.version_tag();

        let documents: Vec<String> = matches
            .iter()
            .map(|m| truncate_chars(&m.content, self.config.max_length))
            .collect();

        let mut scores = Vec::with_capacity(documents.len());
        for batch in documents.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            let batch_scores = model.score_batch(query, batch).await?;
            scores.extend(batch_scores);
        }
        Ok((scores, version_tag))
    }

    async fn score_cloud(
        &self,
        query: &str,
        matches: &[ChunkMatch],
    ) -> Result<(Vec<f32>, String)> {
        let cloud = self.cloud.as_ref().ok_or_else(|| {
            RagError::RerankerUnavailable("cloud reranker not configured".to_string())
        })?;

        let documents: Vec<String> = matches
            .iter()
            .map(|m| truncate_chars(&m.content, self.config.max_length))
            .collect();

        // One retry on a retryable failure, then give up.
        let scores = match cloud.rerank(query, &documents).await {
            Ok(scores) => scores,
            Err(e) if e.is_retryable() => cloud.rerank(query, &documents).await?,
            Err(e) => return Err(e),
        };

        if scores.len() != documents.len() {
            return Err(RagError::UpstreamFailure {
                component: "cloud_reranker".to_string(),
                reason: format!(
                    "returned {} scores for {} documents",
                    scores.len(),
                    documents.len()
                ),
            });
        }
        Ok((scores, self.config.cloud_model.clone()))
    }

    /// Cold-load path: base model for `local`, base plus adapter for
    /// `learned`. A missing or malformed adapter makes the reranker
    /// unavailable rather than silently serving the base model.
    fn load_model(&self) -> Result<LoadedModel> {
        match self.config.mode {
            RerankerMode::Learned => {
                let path = self.config.adapter_path.as_ref().ok_or_else(|| {
                    RagError::RerankerUnavailable("learned mode without adapter path".to_string())
                })?;
                let (adapter, fingerprint) = Adapter::load(path)?;
                Ok(LoadedModel {
                    backend: self.backend.clone(),
                    adapter: Some(adapter),
                    fingerprint: Some(fingerprint),
                })
            }
            _ => Ok(LoadedModel {
                backend: self.backend.clone(),
                adapter: None,
                fingerprint: None,
            }),
        }
    }

    /// Fingerprint of the resident model's adapter, for introspection.
    pub async fn active_fingerprint(&self) -> Option<String> {
        self.slot.active_fingerprint().await
    }
}

impl Drop for Reranker {
    fn drop(&mut self) {
        if let Some(cancel) = &self.watcher_cancel {
            cancel.cancel();
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}
