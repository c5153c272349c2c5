//! In-memory store backend.
//!
//! Implements both [`ChunkStore`] and [`GraphStore`] with the same
//! semantics as the SQLite backend, returning immediately-ready futures.
//! Used by unit and integration tests and by ephemeral corpora.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::chunker::Chunk;
use crate::config::SparseSearchConfig;
use crate::Result;

use super::bm25::Bm25Index;
use super::{
    ChunkCandidate, ChunkStore, ChunkStoreStats, Community, Entity, GraphStore, GraphStoreStats,
    Relationship, cosine_similarity,
};

#[derive(Default)]
struct CorpusChunks {
    chunks: HashMap<String, Chunk>,
    bm25: Option<Bm25Index>,
}

#[derive(Default)]
struct CorpusGraph {
    entities: HashMap<String, Entity>,
    relationships: HashMap<(String, String, super::RelKind), Relationship>,
    communities: Vec<Community>,
}

pub struct MemoryStore {
    sparse_config: SparseSearchConfig,
    chunks: RwLock<HashMap<String, CorpusChunks>>,
    graphs: RwLock<HashMap<String, CorpusGraph>>,
}

impl MemoryStore {
    #[inline]
    pub fn new(sparse_config: SparseSearchConfig) -> Self {
        Self {
            sparse_config,
            chunks: RwLock::new(HashMap::new()),
            graphs: RwLock::new(HashMap::new()),
        }
    }
}

impl CorpusChunks {
    fn bm25_mut(&mut self, config: &SparseSearchConfig) -> &mut Bm25Index {
        if self.bm25.is_none() {
            let mut index = Bm25Index::new(config);
            for chunk in self.chunks.values() {
                index.insert(&chunk.chunk_id, &chunk.content);
            }
            self.bm25 = Some(index);
        }
        self.bm25.as_mut().expect("just initialized")
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn upsert_chunks(&self, corpus_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut store = self.chunks.write().await;
        let corpus = store.entry(corpus_id.to_string()).or_default();
        for chunk in chunks {
            corpus
                .bm25_mut(&self.sparse_config)
                .insert(&chunk.chunk_id, &chunk.content);
            corpus.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        debug!("Upserted {} chunks into corpus {}", chunks.len(), corpus_id);
        Ok(())
    }

    async fn delete_file_chunks(&self, corpus_id: &str, file_path: &str) -> Result<()> {
        let mut store = self.chunks.write().await;
        if let Some(corpus) = store.get_mut(corpus_id) {
            let doomed: Vec<String> = corpus
                .chunks
                .values()
                .filter(|c| c.file_path == file_path)
                .map(|c| c.chunk_id.clone())
                .collect();
            for chunk_id in doomed {
                corpus.chunks.remove(&chunk_id);
                if let Some(index) = corpus.bm25.as_mut() {
                    index.remove(&chunk_id);
                }
            }
        }
        Ok(())
    }

    async fn delete_corpus(&self, corpus_id: &str) -> Result<()> {
        self.chunks.write().await.remove(corpus_id);
        Ok(())
    }

    async fn get_chunk(&self, corpus_id: &str, chunk_id: &str) -> Result<Option<Chunk>> {
        let store = self.chunks.read().await;
        Ok(store
            .get(corpus_id)
            .and_then(|c| c.chunks.get(chunk_id))
            .cloned())
    }

    async fn get_chunks(&self, corpus_id: &str, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let store = self.chunks.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };
        Ok(chunk_ids
            .iter()
            .filter_map(|id| corpus.chunks.get(id))
            .cloned()
            .collect())
    }

    async fn chunks_for_file(&self, corpus_id: &str, file_path: &str) -> Result<Vec<Chunk>> {
        let store = self.chunks.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };
        let mut chunks: Vec<Chunk> = corpus
            .chunks
            .values()
            .filter(|c| c.file_path == file_path)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.start_line);
        Ok(chunks)
    }

    async fn vector_search(
        &self,
        corpus_id: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let store = self.chunks.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ChunkCandidate> = corpus
            .chunks
            .values()
            .filter_map(|chunk| {
                chunk.embedding.as_ref().map(|embedding| ChunkCandidate {
                    chunk_id: chunk.chunk_id.clone(),
                    score: cosine_similarity(query, embedding),
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn fts_search(
        &self,
        corpus_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>> {
        let mut store = self.chunks.write().await;
        let Some(corpus) = store.get_mut(corpus_id) else {
            return Ok(Vec::new());
        };
        let hits = corpus.bm25_mut(&self.sparse_config).search(query, top_k);
        Ok(hits
            .into_iter()
            .map(|(chunk_id, score)| ChunkCandidate { chunk_id, score })
            .collect())
    }

    async fn stats(&self, corpus_id: &str) -> Result<ChunkStoreStats> {
        let store = self.chunks.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(ChunkStoreStats::default());
        };
        let files: std::collections::HashSet<&str> = corpus
            .chunks
            .values()
            .map(|c| c.file_path.as_str())
            .collect();
        Ok(ChunkStoreStats {
            chunk_count: corpus.chunks.len(),
            embedded_count: corpus
                .chunks
                .values()
                .filter(|c| c.embedding.is_some())
                .count(),
            file_count: files.len(),
        })
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn upsert_entities(&self, corpus_id: &str, entities: &[Entity]) -> Result<()> {
        let mut store = self.graphs.write().await;
        let corpus = store.entry(corpus_id.to_string()).or_default();
        for entity in entities {
            corpus
                .entities
                .insert(entity.entity_id.clone(), entity.clone());
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        corpus_id: &str,
        relationships: &[Relationship],
    ) -> Result<usize> {
        let mut store = self.graphs.write().await;
        let corpus = store.entry(corpus_id.to_string()).or_default();
        let mut written = 0;
        for rel in relationships {
            // Endpoints must exist at commit time; dangling edges from
            // best-effort extraction are dropped.
            if !corpus.entities.contains_key(&rel.source_entity_id)
                || !corpus.entities.contains_key(&rel.target_entity_id)
            {
                continue;
            }
            corpus.relationships.insert(
                (
                    rel.source_entity_id.clone(),
                    rel.target_entity_id.clone(),
                    rel.kind,
                ),
                rel.clone(),
            );
            written += 1;
        }
        Ok(written)
    }

    async fn delete_corpus(&self, corpus_id: &str) -> Result<()> {
        self.graphs.write().await.remove(corpus_id);
        Ok(())
    }

    async fn delete_file_entities(&self, corpus_id: &str, file_path: &str) -> Result<()> {
        let mut store = self.graphs.write().await;
        if let Some(corpus) = store.get_mut(corpus_id) {
            let doomed: Vec<String> = corpus
                .entities
                .values()
                .filter(|e| e.file_path.as_deref() == Some(file_path))
                .map(|e| e.entity_id.clone())
                .collect();
            for entity_id in &doomed {
                corpus.entities.remove(entity_id);
            }
            corpus.relationships.retain(|(source, target, _), _| {
                !doomed.contains(source) && !doomed.contains(target)
            });
        }
        Ok(())
    }

    async fn get_entity(&self, corpus_id: &str, entity_id: &str) -> Result<Option<Entity>> {
        let store = self.graphs.read().await;
        Ok(store
            .get(corpus_id)
            .and_then(|g| g.entities.get(entity_id))
            .cloned())
    }

    async fn find_entities_by_terms(
        &self,
        corpus_id: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };
        let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();

        let mut matches: Vec<Entity> = corpus
            .entities
            .values()
            .filter(|entity| {
                let name = entity.name.to_lowercase();
                let description = entity
                    .description
                    .as_deref()
                    .map(|d| d.to_lowercase())
                    .unwrap_or_default();
                lowered
                    .iter()
                    .any(|t| name.contains(t.as_str()) || description.contains(t.as_str()))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn find_entities_by_embedding(
        &self,
        corpus_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(Entity, f32)> = corpus
            .entities
            .values()
            .filter_map(|entity| {
                entity.embedding.as_ref().map(|embedding| {
                    (entity.clone(), cosine_similarity(query, embedding))
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entity_id.cmp(&b.0.entity_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn neighbors(
        &self,
        corpus_id: &str,
        entity_id: &str,
    ) -> Result<Vec<(Relationship, Entity)>> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for rel in corpus.relationships.values() {
            let peer_id = if rel.source_entity_id == entity_id {
                &rel.target_entity_id
            } else if rel.target_entity_id == entity_id {
                &rel.source_entity_id
            } else {
                continue;
            };
            if let Some(peer) = corpus.entities.get(peer_id) {
                out.push((rel.clone(), peer.clone()));
            }
        }
        Ok(out)
    }

    async fn all_entities(&self, corpus_id: &str) -> Result<Vec<Entity>> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };
        let mut entities: Vec<Entity> = corpus.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entities)
    }

    async fn all_relationships(&self, corpus_id: &str) -> Result<Vec<Relationship>> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(Vec::new());
        };
        let mut relationships: Vec<Relationship> = corpus.relationships.values().cloned().collect();
        relationships.sort_by(|a, b| {
            (&a.source_entity_id, &a.target_entity_id, a.kind.as_str()).cmp(&(
                &b.source_entity_id,
                &b.target_entity_id,
                b.kind.as_str(),
            ))
        });
        Ok(relationships)
    }

    async fn replace_communities(&self, corpus_id: &str, communities: &[Community]) -> Result<()> {
        let mut store = self.graphs.write().await;
        let corpus = store.entry(corpus_id.to_string()).or_default();
        corpus.communities = communities.to_vec();
        Ok(())
    }

    async fn communities(&self, corpus_id: &str) -> Result<Vec<Community>> {
        let store = self.graphs.read().await;
        Ok(store
            .get(corpus_id)
            .map(|g| g.communities.clone())
            .unwrap_or_default())
    }

    async fn stats(&self, corpus_id: &str) -> Result<GraphStoreStats> {
        let store = self.graphs.read().await;
        let Some(corpus) = store.get(corpus_id) else {
            return Ok(GraphStoreStats::default());
        };
        Ok(GraphStoreStats {
            entity_count: corpus.entities.len(),
            relationship_count: corpus.relationships.len(),
            community_count: corpus.communities.len(),
        })
    }
}
