// Embedding module
// Batched embedding with retry, cancellation, and a content-addressed cache

pub mod cache;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::providers::EmbeddingProvider;
use crate::{RagError, Result};
use cache::EmbeddingCache;

const INITIAL_RETRY_DELAY_MS: u64 = 200;
const MAX_RETRY_DELAY_MS: u64 = 10_000;
const BACKOFF_FACTOR: f64 = 2.0;
const JITTER_PERCENT: f64 = 0.1;

/// Batching front-end over an [`EmbeddingProvider`].
///
/// Splits inputs into provider batches bounded by `batch_size` and the
/// per-call token budget, short-circuits through the content-addressed
/// cache, and retries transient provider failures with exponential
/// backoff. Persistent failure is fatal to the caller.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    config: EmbeddingConfig,
}

impl Embedder {
    #[inline]
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache_dir: PathBuf,
        config: EmbeddingConfig,
    ) -> Self {
        let cache = EmbeddingCache::new(cache_dir, provider.provider(), provider.model());
        Self {
            provider,
            cache,
            config,
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    #[inline]
    pub fn provider_name(&self) -> &str {
        self.provider.provider()
    }

    #[inline]
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Embed one query string, bypassing the cache write path.
    pub async fn embed_query(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let vectors = self.embed(&[text.to_string()], cancel).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| RagError::UpstreamFailure {
                component: "embedding".to_string(),
                reason: "provider returned no vector".to_string(),
            })
    }

    /// Embed all texts, returning vectors in input order.
    pub async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];

        for batch_indices in self.plan_batches(texts) {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            self.embed_batch(texts, &batch_indices, &mut results, cancel)
                .await?;
        }

        results
            .into_iter()
            .map(|v| {
                v.ok_or_else(|| RagError::UpstreamFailure {
                    component: "embedding".to_string(),
                    reason: "missing vector in batch response".to_string(),
                })
            })
            .collect()
    }

    /// Group input indices into batches bounded by `batch_size` and the
    /// per-call token budget.
    fn plan_batches(&self, texts: &[String]) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_tokens = 0usize;

        for (i, text) in texts.iter().enumerate() {
            let tokens = crate::chunker::estimate_token_count(text).max(1);
            let over_budget = !current.is_empty()
                && (current.len() >= self.config.batch_size
                    || current_tokens + tokens > self.config.token_budget);
            if over_budget {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current.push(i);
            current_tokens += tokens;
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        indices: &[usize],
        results: &mut [Option<Vec<f32>>],
        cancel: &CancellationToken,
    ) -> Result<()> {
        // Cache pass: resolve hits, acquire single-flight locks for misses
        // in sorted key order.
        let mut missing: Vec<(usize, String)> = Vec::new();
        for &i in indices {
            let key = self.cache.key_for(&texts[i]);
            match self.cache.get(&key) {
                Some(vector) => results[i] = Some(vector),
                None => missing.push((i, key)),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        missing.sort_by(|a, b| a.1.cmp(&b.1));
        let mut guards = Vec::with_capacity(missing.len());
        for (_, key) in &missing {
            let lock = self.cache.lock_key(key).await;
            guards.push(lock);
        }
        let mut held = Vec::with_capacity(guards.len());
        for lock in &guards {
            held.push(lock.lock().await);
        }

        // Another flight may have filled some keys while we waited.
        let mut to_fetch: Vec<(usize, String)> = Vec::new();
        for (i, key) in missing {
            match self.cache.get(&key) {
                Some(vector) => results[i] = Some(vector),
                None => to_fetch.push((i, key)),
            }
        }
        if to_fetch.is_empty() {
            return Ok(());
        }

        let batch: Vec<String> = to_fetch.iter().map(|(i, _)| texts[*i].clone()).collect();
        let vectors = self.call_with_retry(&batch, cancel).await?;

        if vectors.len() != batch.len() {
            return Err(RagError::UpstreamFailure {
                component: "embedding".to_string(),
                reason: format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                ),
            });
        }

        for ((i, key), vector) in to_fetch.into_iter().zip(vectors.into_iter()) {
            if vector.len() != self.config.dimension {
                return Err(RagError::UpstreamFailure {
                    component: "embedding".to_string(),
                    reason: format!(
                        "vector dimension {} does not match configured {}",
                        vector.len(),
                        self.config.dimension
                    ),
                });
            }
            self.cache.put(&key, &vector)?;
            results[i] = Some(vector);
        }
        Ok(())
    }

    /// Exponential backoff with jitter, up to `retry_max` attempts.
    /// Cancellation is observed between attempts and during waits, and is
    /// never retried.
    async fn call_with_retry(
        &self,
        batch: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let mut delay = Duration::from_millis(INITIAL_RETRY_DELAY_MS);
        let mut last_error = None;

        for attempt in 0..=self.config.retry_max {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }

            let call = self.provider.embed(batch);
            tokio::select! {
                outcome = call => match outcome {
                    Ok(vectors) => return Ok(vectors),
                    Err(e) if e.is_retryable() && attempt < self.config.retry_max => {
                        warn!(
                            "Embedding attempt {}/{} failed: {}",
                            attempt + 1,
                            self.config.retry_max + 1,
                            e
                        );
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                },
                () = cancel.cancelled() => return Err(RagError::Cancelled),
            }

            let jittered = apply_jitter(delay);
            debug!("Backing off {:?} before retry", jittered);
            tokio::select! {
                () = tokio::time::sleep(jittered) => {}
                () = cancel.cancelled() => return Err(RagError::Cancelled),
            }
            delay = Duration::from_millis(
                ((delay.as_millis() as f64) * BACKOFF_FACTOR) as u64,
            )
            .min(Duration::from_millis(MAX_RETRY_DELAY_MS));
        }

        Err(last_error.unwrap_or_else(|| RagError::UpstreamFailure {
            component: "embedding".to_string(),
            reason: "retries exhausted".to_string(),
        }))
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let base = delay.as_millis() as f64;
    let jitter = base * JITTER_PERCENT;
    let offset = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_millis((base + offset).max(0.0) as u64)
}
