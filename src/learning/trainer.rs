//! Adapter training and evaluation.
//!
//! The trainer is a capability so the heavy model runtime can live
//! outside the crate; the in-crate implementation fits an additive
//! term-weight table, which is deterministic and cheap enough to run in
//! the background worker. Evaluation uses a deterministic held-out split
//! so a run's metric is reproducible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::SparseTokenizer;
use crate::rerank::scorer::{Adapter, CrossEncoderBackend, LexicalCrossEncoder, fingerprint};
use crate::store::bm25::tokenize;
use crate::store::ChunkStore;
use crate::{RagError, Result};

use super::Triplet;

/// A triplet with its chunk ids resolved to chunk text.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub query: String,
    pub positive: String,
    pub negative: String,
    pub confidence: f64,
}

/// Resolve mined triplets against the chunk store. Triplets referencing
/// a chunk that no longer exists are discarded.
pub async fn resolve_triplets(
    store: &Arc<dyn ChunkStore>,
    corpus_id: &str,
    triplets: &[Triplet],
) -> Result<Vec<TrainingExample>> {
    let mut examples = Vec::with_capacity(triplets.len());
    for triplet in triplets {
        let positive = store.get_chunk(corpus_id, &triplet.positive_chunk).await?;
        let negative = store.get_chunk(corpus_id, &triplet.negative_chunk).await?;
        match (positive, negative) {
            (Some(positive), Some(negative)) => examples.push(TrainingExample {
                query: triplet.query.clone(),
                positive: positive.content,
                negative: negative.content,
                confidence: triplet.confidence,
            }),
            _ => debug!(
                "Discarding triplet with unresolvable chunks ({} / {})",
                triplet.positive_chunk, triplet.negative_chunk
            ),
        }
    }
    Ok(examples)
}

/// Trains an adapter from resolved examples.
#[async_trait]
pub trait AdapterTrainer: Send + Sync {
    async fn train(&self, examples: &[TrainingExample], version: &str) -> Result<Adapter>;
}

/// In-crate trainer: every example nudges weights of query terms found
/// in the positive up and of those found in the negative down, scaled by
/// the example's confidence.
pub struct LexicalAdapterTrainer {
    pub learning_rate: f32,
}

impl Default for LexicalAdapterTrainer {
    fn default() -> Self {
        Self { learning_rate: 0.1 }
    }
}

#[async_trait]
impl AdapterTrainer for LexicalAdapterTrainer {
    async fn train(&self, examples: &[TrainingExample], version: &str) -> Result<Adapter> {
        let mut weights: HashMap<String, f32> = HashMap::new();

        for example in examples {
            let query_terms: std::collections::HashSet<String> =
                tokenize(&example.query, SparseTokenizer::Code)
                    .into_iter()
                    .collect();
            let positive_terms: std::collections::HashSet<String> =
                tokenize(&example.positive, SparseTokenizer::Code)
                    .into_iter()
                    .collect();
            let negative_terms: std::collections::HashSet<String> =
                tokenize(&example.negative, SparseTokenizer::Code)
                    .into_iter()
                    .collect();

            let step = self.learning_rate * example.confidence as f32;
            for term in &query_terms {
                if positive_terms.contains(term) {
                    *weights.entry(term.clone()).or_insert(0.0) += step;
                }
                if negative_terms.contains(term) {
                    *weights.entry(term.clone()).or_insert(0.0) -= step;
                }
            }
        }

        weights.retain(|_, w| w.abs() > f32::EPSILON);
        Ok(Adapter {
            version: version.to_string(),
            weights,
            bias: 0.0,
        })
    }
}

/// Deterministic holdout assignment: an example is held out when the
/// low byte of its query hash falls under the fraction.
pub fn is_holdout(example: &TrainingExample, holdout_fraction: f64) -> bool {
    let digest = Sha256::digest(example.query.as_bytes());
    f64::from(digest[0]) < holdout_fraction * 256.0
}

/// Mean reciprocal rank over pairwise examples: the positive either
/// outranks the negative (rr = 1.0) or it does not (rr = 0.5).
pub async fn evaluate_mrr(
    backend: &dyn CrossEncoderBackend,
    adapter: Option<&Adapter>,
    examples: &[TrainingExample],
) -> Result<f64> {
    if examples.is_empty() {
        return Ok(0.0);
    }

    let mut total = 0.0;
    for example in examples {
        let documents = vec![example.positive.clone(), example.negative.clone()];
        let mut scores = backend.score_batch(&example.query, &documents).await?;
        if let Some(adapter) = adapter {
            scores[0] += adapter.adjust(&example.query, &example.positive);
            scores[1] += adapter.adjust(&example.query, &example.negative);
        }
        total += if scores[0] > scores[1] { 1.0 } else { 0.5 };
    }
    Ok(total / examples.len() as f64)
}

/// Output of one completed training run, persisted to its run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub adapter_version: String,
    pub metric: f64,
    pub baseline_metric: f64,
    pub train_count: usize,
    pub holdout_count: usize,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl TrainingRun {
    #[inline]
    pub fn manifest_path(run_dir: &Path) -> PathBuf {
        run_dir.join("run.json")
    }

    #[inline]
    pub fn adapter_path(run_dir: &Path) -> PathBuf {
        run_dir.join("adapter.json")
    }

    pub fn load(run_dir: &Path) -> Result<Self> {
        let bytes = std::fs::read(Self::manifest_path(run_dir))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RagError::Store(format!("corrupt run manifest: {e}")))
    }
}

/// Train an adapter against the base model, evaluate it on the holdout
/// split, and persist everything under `runs_dir/<run_id>/`.
pub async fn run_training(
    trainer: &dyn AdapterTrainer,
    local_model: &str,
    examples: &[TrainingExample],
    holdout_fraction: f64,
    runs_dir: &Path,
    run_id: &str,
) -> Result<TrainingRun> {
    let (holdout, train): (Vec<TrainingExample>, Vec<TrainingExample>) = examples
        .iter()
        .cloned()
        .partition(|e| is_holdout(e, holdout_fraction));
    if train.is_empty() {
        return Err(RagError::Config(
            "not enough triplets to train after the holdout split".to_string(),
        ));
    }

    let version = format!("adapter-{run_id}");
    let adapter = trainer.train(&train, &version).await?;

    let backend = LexicalCrossEncoder::new(local_model);
    let baseline_metric = evaluate_mrr(&backend, None, &holdout).await?;
    let metric = evaluate_mrr(&backend, Some(&adapter), &holdout).await?;

    let run_dir = runs_dir.join(run_id);
    std::fs::create_dir_all(&run_dir)?;

    let adapter_bytes = serde_json::to_vec_pretty(&adapter)
        .map_err(|e| RagError::Store(format!("adapter serialization failed: {e}")))?;
    let adapter_path = TrainingRun::adapter_path(&run_dir);
    let staged = adapter_path.with_extension("json.staging");
    std::fs::write(&staged, &adapter_bytes)?;
    std::fs::rename(&staged, &adapter_path)?;

    let run = TrainingRun {
        run_id: run_id.to_string(),
        adapter_version: version,
        metric,
        baseline_metric,
        train_count: train.len(),
        holdout_count: holdout.len(),
        fingerprint: fingerprint(&adapter_bytes),
        created_at: Utc::now(),
    };
    let run_bytes = serde_json::to_vec_pretty(&run)
        .map_err(|e| RagError::Store(format!("run serialization failed: {e}")))?;
    let manifest_path = TrainingRun::manifest_path(&run_dir);
    let staged = manifest_path.with_extension("json.staging");
    std::fs::write(&staged, &run_bytes)?;
    std::fs::rename(&staged, &manifest_path)?;

    info!(
        "Training run {} complete: metric {:.4} (baseline {:.4}) over {} holdout triplets",
        run_id, metric, baseline_metric, run.holdout_count
    );
    Ok(run)
}
