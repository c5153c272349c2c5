// Search module
// Query entry point: validate, fuse, rerank, truncate

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{Config, FusionMethod};
use crate::embedder::Embedder;
use crate::fusion::{Fusion, ModalityStatus};
use crate::index::ManifestStore;
use crate::rerank::Reranker;
use crate::retriever::{
    ChunkMatch, GraphRetriever, Modality, Retriever, SparseRetriever, VectorRetriever,
};
use crate::store::{ChunkStore, GraphStore};
use crate::{RagError, Result};

/// One retrieval request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub corpus_id: String,
    /// Overrides `search.top_k` when set.
    pub top_k: Option<usize>,
    pub include_vector: bool,
    pub include_sparse: bool,
    pub include_graph: bool,
    /// Overrides `search.deadline_ms` when set.
    pub deadline_ms: Option<u64>,
}

impl SearchRequest {
    #[inline]
    pub fn new(query: impl Into<String>, corpus_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            corpus_id: corpus_id.into(),
            top_k: None,
            include_vector: true,
            include_sparse: true,
            include_graph: true,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<ChunkMatch>,
    pub fusion_method: FusionMethod,
    /// Mode that actually served the request; `degraded` when the
    /// reranker was configured but unavailable.
    pub reranker_mode: String,
    pub latency_ms: u64,
    pub per_modality_status: BTreeMap<Modality, ModalityStatus>,
}

/// Top-level query orchestrator: owns the deadline, the dimension and
/// tokenizer locks, and the fusion → rerank → truncate composition.
pub struct RetrievalOrchestrator {
    config: Config,
    manifests: ManifestStore,
    embedder: Arc<Embedder>,
    reranker: Arc<Reranker>,
    vector: Arc<dyn Retriever>,
    sparse: Arc<dyn Retriever>,
    graph: Arc<dyn Retriever>,
}

impl RetrievalOrchestrator {
    #[inline]
    pub fn new(
        config: Config,
        chunk_store: Arc<dyn ChunkStore>,
        graph_store: Arc<dyn GraphStore>,
        embedder: Arc<Embedder>,
        reranker: Arc<Reranker>,
    ) -> Self {
        let manifests = ManifestStore::new(config.manifests_dir());
        let vector: Arc<dyn Retriever> = Arc::new(VectorRetriever::new(
            chunk_store.clone(),
            embedder.clone(),
            config.vector_search.clone(),
        ));
        let sparse: Arc<dyn Retriever> = Arc::new(SparseRetriever::new(
            chunk_store.clone(),
            config.sparse_search.clone(),
        ));
        let graph: Arc<dyn Retriever> = Arc::new(GraphRetriever::new(
            chunk_store,
            graph_store,
            embedder.clone(),
            config.graph_search.clone(),
        ));

        Self {
            config,
            manifests,
            embedder,
            reranker,
            vector,
            sparse,
            graph,
        }
    }

    /// Run one query end to end. Fails fast on validation and manifest
    /// locks; individual retriever failures demote rather than fail.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse> {
        let started = Instant::now();

        if request.query.trim().is_empty() {
            return Err(RagError::Config("query must not be empty".to_string()));
        }
        if request.corpus_id.trim().is_empty() {
            return Err(RagError::Config("corpus_id must not be empty".to_string()));
        }

        // Manifest locks run before any retriever is called: a dimension
        // or tokenizer disagreement must fail loudly, never degrade.
        let manifest = self
            .manifests
            .load(&request.corpus_id)?
            .ok_or_else(|| RagError::Store(format!(
                "corpus '{}' has not been built",
                request.corpus_id
            )))?;
        if manifest.embedding_dimension != self.embedder.dimension() {
            return Err(RagError::ManifestMismatch {
                corpus_id: request.corpus_id.clone(),
                reason: format!(
                    "corpus built at dimension {} but embedder produces {}",
                    manifest.embedding_dimension,
                    self.embedder.dimension()
                ),
            });
        }
        if manifest.sparse_tokenizer != self.config.sparse_search.tokenizer {
            return Err(RagError::ManifestMismatch {
                corpus_id: request.corpus_id.clone(),
                reason: format!(
                    "corpus indexed with '{}' tokenizer but query configured for '{}'",
                    manifest.sparse_tokenizer, self.config.sparse_search.tokenizer
                ),
            });
        }

        let deadline =
            Duration::from_millis(request.deadline_ms.unwrap_or(self.config.search.deadline_ms));
        let modality_deadline =
            Duration::from_millis(self.config.search.modality_deadline_ms).min(deadline);

        let mut retrievers: Vec<Arc<dyn Retriever>> = Vec::new();
        if request.include_vector && self.config.vector_search.enabled {
            retrievers.push(self.vector.clone());
        }
        if request.include_sparse && self.config.sparse_search.enabled {
            retrievers.push(self.sparse.clone());
        }
        if request.include_graph && self.config.graph_search.enabled {
            retrievers.push(self.graph.clone());
        }
        if retrievers.is_empty() {
            return Err(RagError::AllRetrieversFailed(
                "every retrieval modality is disabled".to_string(),
            ));
        }

        let fusion = Fusion::new(retrievers, self.config.fusion.clone(), modality_deadline);
        let query_cancel = cancel.child_token();

        let pipeline = self.fuse_and_rerank(&fusion, request, &query_cancel);
        let outcome = match tokio::time::timeout(deadline, pipeline).await {
            Ok(result) => result?,
            Err(_) => {
                // Tear down whatever is still in flight.
                query_cancel.cancel();
                return Err(RagError::UpstreamTimeout {
                    component: "search".to_string(),
                    elapsed_ms: deadline.as_millis() as u64,
                });
            }
        };
        let (mut matches, statuses, reranker_mode) = outcome;

        let top_k = request.top_k.unwrap_or(self.config.search.top_k);
        matches.truncate(top_k);

        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Query on corpus {} served {} matches in {}ms (reranker: {})",
            request.corpus_id,
            matches.len(),
            latency_ms,
            reranker_mode
        );

        Ok(SearchResponse {
            matches,
            fusion_method: self.config.fusion.method,
            reranker_mode,
            latency_ms,
            per_modality_status: statuses,
        })
    }

    async fn fuse_and_rerank(
        &self,
        fusion: &Fusion,
        request: &SearchRequest,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ChunkMatch>, BTreeMap<Modality, ModalityStatus>, String)> {
        let outcome = fusion.run(&request.corpus_id, &request.query, cancel).await?;

        let fused = outcome.matches;
        let (matches, reranker_mode) = match self
            .reranker
            .rerank(&request.query, fused.clone(), cancel)
            .await
        {
            Ok(reranked) => (reranked, self.reranker.mode().to_string()),
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(RagError::RerankerUnavailable(reason)) => {
                warn!("Reranker unavailable, serving fused order: {}", reason);
                (fused, "degraded".to_string())
            }
            Err(e) => {
                warn!("Reranker failed, serving fused order: {}", e);
                (fused, "degraded".to_string())
            }
        };

        Ok((matches, outcome.statuses, reranker_mode))
    }
}
