//! Lexical (BM25) retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SparseSearchConfig;
use crate::store::ChunkStore;
use crate::{RagError, Result};

use super::{ChunkMatch, MatchSource, Modality, Retriever, hydrate_candidates};

pub struct SparseRetriever {
    store: Arc<dyn ChunkStore>,
    config: SparseSearchConfig,
}

impl SparseRetriever {
    #[inline]
    pub fn new(store: Arc<dyn ChunkStore>, config: SparseSearchConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl Retriever for SparseRetriever {
    fn modality(&self) -> Modality {
        Modality::Sparse
    }

    async fn retrieve(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkMatch>> {
        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        let candidates = self
            .store
            .fts_search(corpus_id, query, self.config.topk_sparse)
            .await?;

        debug!(
            "Sparse retrieval returned {} candidates for corpus {}",
            candidates.len(),
            corpus_id
        );
        hydrate_candidates(&self.store, corpus_id, candidates, MatchSource::Sparse).await
    }
}
