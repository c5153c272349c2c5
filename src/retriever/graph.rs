//! Graph-walk retrieval.
//!
//! Seeds a candidate entity set from the query — by name-matching query
//! terms against entity names and descriptions, and by cosine similarity
//! of the query embedding against entity-description embeddings — then
//! walks typed edges out to `max_hops` with multiplicative weight decay
//! and maps the reached entities back to chunks through their
//! declaration positions. Each chunk scores as the best path weight that
//! reached it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::GraphSearchConfig;
use crate::embedder::Embedder;
use crate::store::{ChunkStore, Entity, GraphStore};
use crate::{RagError, Result};

use super::{ChunkMatch, MatchSource, Modality, Retriever};

/// Per-hop damping applied on top of edge weights so long paths score
/// below short ones even when every edge weight is 1.0.
const HOP_DECAY: f64 = 0.7;

const MAX_SEED_ENTITIES: usize = 16;

/// Description-similarity floor below which an embedding match does not
/// seed the walk.
const SEED_SIMILARITY_FLOOR: f32 = 0.2;

pub struct GraphRetriever {
    chunk_store: Arc<dyn ChunkStore>,
    graph_store: Arc<dyn GraphStore>,
    embedder: Arc<Embedder>,
    config: GraphSearchConfig,
}

impl GraphRetriever {
    #[inline]
    pub fn new(
        chunk_store: Arc<dyn ChunkStore>,
        graph_store: Arc<dyn GraphStore>,
        embedder: Arc<Embedder>,
        config: GraphSearchConfig,
    ) -> Self {
        Self {
            chunk_store,
            graph_store,
            embedder,
            config,
        }
    }

    /// Merge the two seeding paths: exact-ish name matches enter at full
    /// weight, description-embedding matches at their similarity. The
    /// best weight wins when both paths find the same entity.
    async fn seed_entities(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Entity, f64)>> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| t.len() > 1)
            .map(|t| t.to_string())
            .collect();

        let mut seeds: HashMap<String, (Entity, f64)> = HashMap::new();
        if !terms.is_empty() {
            for entity in self
                .graph_store
                .find_entities_by_terms(corpus_id, &terms, MAX_SEED_ENTITIES)
                .await?
            {
                seeds.insert(entity.entity_id.clone(), (entity, 1.0));
            }
        }

        let query_vector = self.embedder.embed_query(query, cancel).await?;
        for (entity, similarity) in self
            .graph_store
            .find_entities_by_embedding(corpus_id, &query_vector, MAX_SEED_ENTITIES)
            .await?
        {
            if similarity < SEED_SIMILARITY_FLOOR {
                continue;
            }
            let weight = f64::from(similarity.clamp(0.0, 1.0));
            let entry = seeds
                .entry(entity.entity_id.clone())
                .or_insert((entity, weight));
            if weight > entry.1 {
                entry.1 = weight;
            }
        }

        let mut seeds: Vec<(Entity, f64)> = seeds.into_values().collect();
        seeds.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entity_id.cmp(&b.0.entity_id))
        });
        seeds.truncate(MAX_SEED_ENTITIES);
        Ok(seeds)
    }

    /// Best path weight per entity, breadth-first out to `max_hops`.
    async fn walk(
        &self,
        corpus_id: &str,
        seeds: &[(Entity, f64)],
        cancel: &CancellationToken,
    ) -> Result<Vec<(Entity, f64)>> {
        let mut best: HashMap<String, (Entity, f64)> = HashMap::new();
        let mut frontier: Vec<(String, f64)> = Vec::new();

        for (seed, weight) in seeds {
            best.insert(seed.entity_id.clone(), (seed.clone(), *weight));
            frontier.push((seed.entity_id.clone(), *weight));
        }

        for _ in 0..self.config.max_hops {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            let mut next_frontier: Vec<(String, f64)> = Vec::new();

            for (entity_id, weight) in &frontier {
                let neighbors = self.graph_store.neighbors(corpus_id, entity_id).await?;
                for (relationship, peer) in neighbors {
                    let path_weight = weight * relationship.weight.clamp(0.0, 1.0) * HOP_DECAY;
                    if path_weight <= f64::EPSILON {
                        continue;
                    }
                    let improved = best
                        .get(&peer.entity_id)
                        .map(|(_, w)| path_weight > *w)
                        .unwrap_or(true);
                    if improved {
                        best.insert(peer.entity_id.clone(), (peer.clone(), path_weight));
                        next_frontier.push((peer.entity_id, path_weight));
                    }
                }
            }

            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(best.into_values().collect())
    }

    /// Map a reached entity to the stored chunk covering its declaration.
    async fn chunk_for_entity(&self, corpus_id: &str, entity: &Entity) -> Result<Option<String>> {
        let Some(file_path) = &entity.file_path else {
            return Ok(None);
        };
        let chunks = self
            .chunk_store
            .chunks_for_file(corpus_id, file_path)
            .await?;
        if chunks.is_empty() {
            return Ok(None);
        }

        let line = entity.start_line.unwrap_or(1);
        let covering = chunks
            .iter()
            .find(|c| c.start_line <= line && line <= c.end_line)
            .or_else(|| chunks.first());
        Ok(covering.map(|c| c.chunk_id.clone()))
    }
}

#[async_trait]
impl Retriever for GraphRetriever {
    fn modality(&self) -> Modality {
        Modality::Graph
    }

    async fn retrieve(
        &self,
        corpus_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkMatch>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let seeds = self.seed_entities(corpus_id, query, cancel).await?;
        if seeds.is_empty() {
            debug!("Graph retrieval found no seed entities for corpus {}", corpus_id);
            return Ok(Vec::new());
        }

        let reached = self.walk(corpus_id, &seeds, cancel).await?;

        // Fold entity weights down to chunk scores, best weight wins.
        let mut chunk_scores: HashMap<String, f64> = HashMap::new();
        for (entity, weight) in &reached {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            if let Some(chunk_id) = self.chunk_for_entity(corpus_id, entity).await? {
                let entry = chunk_scores.entry(chunk_id).or_insert(0.0);
                if *weight > *entry {
                    *entry = *weight;
                }
            }
        }

        let mut ranked: Vec<(String, f64)> = chunk_scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(self.config.topk_graph);

        let ids: Vec<String> = ranked.iter().map(|(id, _)| id.clone()).collect();
        let chunks = self.chunk_store.get_chunks(corpus_id, &ids).await?;
        let by_id: HashMap<&str, &crate::chunker::Chunk> =
            chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        let mut matches = Vec::with_capacity(ranked.len());
        let mut rank = 0usize;
        for (chunk_id, score) in &ranked {
            if let Some(chunk) = by_id.get(chunk_id.as_str()) {
                rank += 1;
                matches.push(ChunkMatch::from_chunk(
                    chunk,
                    *score as f32,
                    MatchSource::Graph,
                    rank,
                ));
            }
        }

        // Community summaries ride along as tagged non-code context.
        if self.config.include_communities {
            let communities = self.graph_store.communities(corpus_id).await?;
            let reached_ids: std::collections::HashSet<&str> =
                reached.iter().map(|(e, _)| e.entity_id.as_str()).collect();
            for community in communities {
                let Some(summary) = &community.summary else {
                    continue;
                };
                if !community
                    .member_ids
                    .iter()
                    .any(|id| reached_ids.contains(id.as_str()))
                {
                    continue;
                }
                rank += 1;
                let mut metadata = serde_json::Map::new();
                metadata.insert("community".to_string(), serde_json::Value::Bool(true));
                metadata.insert(
                    "level".to_string(),
                    serde_json::Value::from(community.level),
                );
                matches.push(ChunkMatch {
                    chunk_id: format!("community:{}", community.community_id),
                    file_path: String::new(),
                    start_line: 0,
                    end_line: 0,
                    language: None,
                    content: summary.clone(),
                    score: 0.1,
                    source: MatchSource::Graph,
                    rank_within_source: rank,
                    fused_score: None,
                    metadata,
                });
            }
        }

        debug!(
            "Graph retrieval returned {} matches for corpus {}",
            matches.len(),
            corpus_id
        );
        Ok(matches)
    }
}
