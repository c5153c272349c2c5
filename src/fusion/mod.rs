// Fusion module
// Scatter/gather across the retrievers plus rank combination


use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{FusionConfig, FusionMethod};
use crate::retriever::{ChunkMatch, MatchSource, Modality, Retriever};
use crate::{RagError, Result};

/// Outcome of one modality's scatter leg.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ModalityStatus {
    Ok { count: usize },
    Disabled,
    Timeout,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct FusionOutcome {
    /// Fused matches, truncated to `final_k`, `source = Fused`.
    pub matches: Vec<ChunkMatch>,
    pub statuses: BTreeMap<Modality, ModalityStatus>,
}

/// Runs the enabled retrievers in parallel and fuses their rankings.
pub struct Fusion {
    retrievers: Vec<Arc<dyn Retriever>>,
    config: FusionConfig,
    modality_deadline: Duration,
}

impl Fusion {
    /// `retrievers` carries only the enabled modalities; a disabled
    /// modality is omitted entirely so it costs no latency.
    #[inline]
    pub fn new(
        retrievers: Vec<Arc<dyn Retriever>>,
        config: FusionConfig,
        modality_deadline: Duration,
    ) -> Self {
        Self {
            retrievers,
            config,
            modality_deadline,
        }
    }

    fn weight_for(&self, modality: Modality) -> f64 {
        match modality {
            Modality::Vector => self.config.vector_weight,
            Modality::Sparse => self.config.sparse_weight,
            Modality::Graph => self.config.graph_weight,
        }
    }

    /// Scatter, gather, and combine. A failing or late retriever is
    /// demoted to an empty contribution; if every leg demotes, the query
    /// fails with [`RagError::AllRetrieversFailed`].
    pub async fn run(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<FusionOutcome> {
        let mut statuses: BTreeMap<Modality, ModalityStatus> = BTreeMap::new();
        for modality in [Modality::Vector, Modality::Sparse, Modality::Graph] {
            statuses.insert(modality, ModalityStatus::Disabled);
        }

        let legs = self.retrievers.iter().map(|retriever| {
            let retriever = retriever.clone();
            let child_cancel = cancel.child_token();
            let deadline = self.modality_deadline;
            let corpus_id = corpus_id.to_string();
            let query = query.to_string();
            async move {
                let modality = retriever.modality();
                let outcome = tokio::select! {
                    outcome = tokio::time::timeout(
                        deadline,
                        retriever.retrieve(&corpus_id, &query, &child_cancel),
                    ) => outcome,
                    // Caller cancellation abandons the leg immediately,
                    // even when the retriever is stuck in blocking IO.
                    () = child_cancel.cancelled() => Ok(Err(RagError::Cancelled)),
                };
                // Late work is abandoned, not awaited.
                child_cancel.cancel();
                (modality, outcome)
            }
        });
        let gathered = futures::future::join_all(legs).await;

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        // Demoted legs still occupy their weight slot: "failed" means an
        // empty contribution, not a re-weighting of the survivors.
        let mut result_sets: Vec<(Modality, Vec<ChunkMatch>)> = Vec::new();
        let mut successes = 0usize;
        for (modality, outcome) in gathered {
            match outcome {
                Ok(Ok(matches)) => {
                    statuses.insert(
                        modality,
                        ModalityStatus::Ok {
                            count: matches.len(),
                        },
                    );
                    result_sets.push((modality, matches));
                    successes += 1;
                }
                Ok(Err(RagError::Cancelled)) => return Err(RagError::Cancelled),
                Ok(Err(e)) => {
                    warn!("{} retrieval failed, demoting to empty: {}", modality, e);
                    statuses.insert(
                        modality,
                        ModalityStatus::Failed {
                            reason: e.to_string(),
                        },
                    );
                    result_sets.push((modality, Vec::new()));
                }
                Err(_) => {
                    warn!(
                        "{} retrieval exceeded its {}ms sub-deadline",
                        modality,
                        self.modality_deadline.as_millis()
                    );
                    statuses.insert(modality, ModalityStatus::Timeout);
                    result_sets.push((modality, Vec::new()));
                }
            }
        }

        if successes == 0 {
            return Err(RagError::AllRetrieversFailed(
                "no retriever produced results".to_string(),
            ));
        }

        let matches = self.combine(&result_sets);
        debug!(
            "Fused {} modalities into {} matches",
            result_sets.len(),
            matches.len()
        );
        Ok(FusionOutcome { matches, statuses })
    }

    /// Rank combination over the gathered result sets. Deterministic:
    /// candidates accumulate keyed by chunk id and ties break on
    /// `(first_seen_rank, chunk_id)`.
    pub fn combine(&self, result_sets: &[(Modality, Vec<ChunkMatch>)]) -> Vec<ChunkMatch> {
        // Weights normalize over the modalities actually present.
        let weight_sum: f64 = result_sets
            .iter()
            .map(|(m, _)| self.weight_for(*m))
            .sum();
        if weight_sum <= 0.0 {
            return Vec::new();
        }

        struct Accum {
            template: ChunkMatch,
            fused: f64,
            first_seen_rank: usize,
        }
        let mut accum: BTreeMap<String, Accum> = BTreeMap::new();

        for (modality, matches) in result_sets {
            let weight = self.weight_for(*modality) / weight_sum;
            if weight <= 0.0 {
                continue;
            }

            // Weighted combination normalizes each list to [0, 1] first.
            let (list_min, list_max) = matches.iter().fold(
                (f32::INFINITY, f32::NEG_INFINITY),
                |(lo, hi), m| (lo.min(m.score), hi.max(m.score)),
            );
            let spread = (list_max - list_min).max(f32::EPSILON);

            for m in matches {
                let contribution = match self.config.method {
                    FusionMethod::Rrf => {
                        weight / (self.config.rrf_k + m.rank_within_source as f64)
                    }
                    FusionMethod::Weighted => {
                        let normalized = if matches.len() == 1 {
                            1.0
                        } else {
                            f64::from((m.score - list_min) / spread)
                        };
                        weight * normalized
                    }
                };

                let entry = accum.entry(m.chunk_id.clone()).or_insert_with(|| {
                    let mut template = m.clone();
                    template.source = MatchSource::Fused;
                    Accum {
                        template,
                        fused: 0.0,
                        first_seen_rank: m.rank_within_source,
                    }
                });
                entry.fused += contribution;
                entry.first_seen_rank = entry.first_seen_rank.min(m.rank_within_source);
                entry.template.metadata.insert(
                    format!("{modality}_rank"),
                    serde_json::Value::from(m.rank_within_source),
                );
                entry.template.metadata.insert(
                    format!("{modality}_score"),
                    serde_json::Value::from(f64::from(m.score)),
                );
            }
        }

        let mut fused: Vec<(f64, usize, ChunkMatch)> = accum
            .into_values()
            .map(|a| (a.fused, a.first_seen_rank, a.template))
            .collect();
        fused.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.chunk_id.cmp(&b.2.chunk_id))
        });
        fused.truncate(self.config.final_k);

        fused
            .into_iter()
            .enumerate()
            .map(|(i, (score, _, mut m))| {
                m.score = score as f32;
                m.fused_score = Some(score as f32);
                m.rank_within_source = i + 1;
                m
            })
            .collect()
    }
}
