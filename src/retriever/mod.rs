// Retrieval module
// The three query-side leaves: vector, sparse (BM25), and graph walk

pub mod graph;
pub mod sparse;
pub mod vector;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunk;
use crate::store::{ChunkCandidate, ChunkStore};
use crate::Result;

pub use graph::GraphRetriever;
pub use sparse::SparseRetriever;
pub use vector::VectorRetriever;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Vector,
    Sparse,
    Graph,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Vector => write!(f, "vector"),
            Modality::Sparse => write!(f, "sparse"),
            Modality::Graph => write!(f, "graph"),
        }
    }
}

/// Which stage produced a [`ChunkMatch`]'s score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Vector,
    Sparse,
    Graph,
    Fused,
    Reranked,
}

/// A query-time result row. The score lives in the score space of its
/// `source`; `fused_score` preserves the fusion score once a reranker
/// has replaced `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub language: Option<String>,
    pub content: String,
    pub score: f32,
    pub source: MatchSource,
    /// 1-based rank in the list its `source` produced.
    pub rank_within_source: usize,
    pub fused_score: Option<f32>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ChunkMatch {
    #[inline]
    pub fn from_chunk(chunk: &Chunk, score: f32, source: MatchSource, rank: usize) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            language: chunk.language.clone(),
            content: chunk.content.clone(),
            score,
            source,
            rank_within_source: rank,
            fused_score: None,
            metadata: serde_json::Map::new(),
        }
    }
}

/// One retrieval modality over the stores.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn modality(&self) -> Modality;

    /// Ranked matches for a query. Implementations must observe the
    /// cancellation token around their store and provider calls.
    async fn retrieve(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkMatch>>;
}

/// Hydrate scored candidates into matches, preserving candidate order
/// and dropping ids that no longer resolve to a stored chunk.
pub(crate) async fn hydrate_candidates(
    store: &Arc<dyn ChunkStore>,
    corpus_id: &str,
    candidates: Vec<ChunkCandidate>,
    source: MatchSource,
) -> Result<Vec<ChunkMatch>> {
    let ids: Vec<String> = candidates.iter().map(|c| c.chunk_id.clone()).collect();
    let chunks = store.get_chunks(corpus_id, &ids).await?;
    let by_id: std::collections::HashMap<&str, &Chunk> =
        chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

    let mut matches = Vec::with_capacity(candidates.len());
    let mut rank = 0usize;
    for candidate in &candidates {
        if let Some(chunk) = by_id.get(candidate.chunk_id.as_str()) {
            rank += 1;
            matches.push(ChunkMatch::from_chunk(chunk, candidate.score, source, rank));
        }
    }
    Ok(matches)
}
