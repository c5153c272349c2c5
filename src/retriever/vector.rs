//! Dense vector retrieval.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::VectorSearchConfig;
use crate::embedder::Embedder;
use crate::store::ChunkStore;
use crate::Result;

use super::{ChunkMatch, MatchSource, Modality, Retriever, hydrate_candidates};

pub struct VectorRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<Embedder>,
    config: VectorSearchConfig,
}

impl VectorRetriever {
    #[inline]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<Embedder>,
        config: VectorSearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn modality(&self) -> Modality {
        Modality::Vector
    }

    async fn retrieve(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkMatch>> {
        let query_vector = self.embedder.embed_query(query, cancel).await?;

        let mut candidates = self
            .store
            .vector_search(corpus_id, &query_vector, self.config.topk_dense)
            .await?;
        candidates.retain(|c| c.score >= self.config.similarity_threshold);

        debug!(
            "Vector retrieval returned {} candidates for corpus {}",
            candidates.len(),
            corpus_id
        );
        hydrate_candidates(&self.store, corpus_id, candidates, MatchSource::Vector).await
    }
}
