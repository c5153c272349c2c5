// Storage abstraction
// ChunkStore and GraphStore contracts with in-memory and SQLite backends

pub mod bm25;
pub mod memory;
pub mod sqlite;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunker::Chunk;
use crate::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A named code element extracted from chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable hash of `corpus_id ∥ qualified_name ∥ kind`.
    pub entity_id: String,
    pub corpus_id: String,
    pub name: String,
    /// Qualified name (`parent.name` for methods), the identity input.
    pub qualified_name: String,
    pub kind: EntityKind,
    pub file_path: Option<String>,
    /// Line where the declaration starts, for mapping back to chunks.
    pub start_line: Option<usize>,
    pub description: Option<String>,
    /// Embedding of `description`, filled in during a build when one is
    /// present.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Class,
    Module,
    Variable,
    Concept,
}

impl EntityKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Class => "class",
            EntityKind::Module => "module",
            EntityKind::Variable => "variable",
            EntityKind::Concept => "concept",
        }
    }

    #[inline]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(EntityKind::Function),
            "class" => Some(EntityKind::Class),
            "module" => Some(EntityKind::Module),
            "variable" => Some(EntityKind::Variable),
            "concept" => Some(EntityKind::Concept),
            _ => None,
        }
    }
}

/// Stable entity identity across rebuilds.
#[inline]
pub fn compute_entity_id(corpus_id: &str, qualified_name: &str, kind: EntityKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(corpus_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(qualified_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_str().as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelKind {
    Calls,
    Imports,
    Inherits,
    Contains,
    References,
    RelatedTo,
}

impl RelKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            RelKind::Calls => "calls",
            RelKind::Imports => "imports",
            RelKind::Inherits => "inherits",
            RelKind::Contains => "contains",
            RelKind::References => "references",
            RelKind::RelatedTo => "related_to",
        }
    }

    #[inline]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "calls" => Some(RelKind::Calls),
            "imports" => Some(RelKind::Imports),
            "inherits" => Some(RelKind::Inherits),
            "contains" => Some(RelKind::Contains),
            "references" => Some(RelKind::References),
            "related_to" => Some(RelKind::RelatedTo),
            _ => None,
        }
    }
}

/// Directed typed edge between two entities. `(source, target, kind)` is
/// unique within a corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub kind: RelKind,
    pub weight: f64,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A detected cluster of entities, recomputed per build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub community_id: String,
    pub corpus_id: String,
    pub level: u32,
    pub member_ids: Vec<String>,
    pub summary: Option<String>,
}

/// A candidate row from vector or lexical search, scored in the backend's
/// native score space.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkStoreStats {
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub file_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphStoreStats {
    pub entity_count: usize,
    pub relationship_count: usize,
    pub community_count: usize,
}

/// Chunk persistence plus the two chunk-level search surfaces.
///
/// Single writer per corpus (enforced by the build lock), many readers
/// always.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or replace chunks by `chunk_id`.
    async fn upsert_chunks(&self, corpus_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Remove all chunks belonging to one file.
    async fn delete_file_chunks(&self, corpus_id: &str, file_path: &str) -> Result<()>;

    /// Remove every chunk in the corpus.
    async fn delete_corpus(&self, corpus_id: &str) -> Result<()>;

    async fn get_chunk(&self, corpus_id: &str, chunk_id: &str) -> Result<Option<Chunk>>;

    /// Fetch chunks by id; missing ids are skipped.
    async fn get_chunks(&self, corpus_id: &str, chunk_ids: &[String]) -> Result<Vec<Chunk>>;

    async fn chunks_for_file(&self, corpus_id: &str, file_path: &str) -> Result<Vec<Chunk>>;

    /// Cosine-similarity search over stored embeddings.
    async fn vector_search(
        &self,
        corpus_id: &str,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    /// BM25 full-text search over chunk content.
    async fn fts_search(
        &self,
        corpus_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ChunkCandidate>>;

    async fn stats(&self, corpus_id: &str) -> Result<ChunkStoreStats>;
}

/// Entity/relationship persistence with neighbor expansion for the
/// bounded graph walk.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert or replace entities by `entity_id`.
    async fn upsert_entities(&self, corpus_id: &str, entities: &[Entity]) -> Result<()>;

    /// Insert or replace relationships. Edges referencing an absent
    /// endpoint are dropped; returns the number actually written.
    async fn upsert_relationships(
        &self,
        corpus_id: &str,
        relationships: &[Relationship],
    ) -> Result<usize>;

    async fn delete_corpus(&self, corpus_id: &str) -> Result<()>;

    /// Remove entities declared in one file, and their edges.
    async fn delete_file_entities(&self, corpus_id: &str, file_path: &str) -> Result<()>;

    async fn get_entity(&self, corpus_id: &str, entity_id: &str) -> Result<Option<Entity>>;

    /// Case-insensitive name match over entity names and descriptions.
    async fn find_entities_by_terms(
        &self,
        corpus_id: &str,
        terms: &[String],
        limit: usize,
    ) -> Result<Vec<Entity>>;

    /// Cosine-similarity match of a query vector against stored
    /// entity-description embeddings. Entities without an embedding are
    /// skipped.
    async fn find_entities_by_embedding(
        &self,
        corpus_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>>;

    /// Outgoing and incoming edges of an entity, with the peer entity.
    async fn neighbors(
        &self,
        corpus_id: &str,
        entity_id: &str,
    ) -> Result<Vec<(Relationship, Entity)>>;

    async fn all_entities(&self, corpus_id: &str) -> Result<Vec<Entity>>;

    async fn all_relationships(&self, corpus_id: &str) -> Result<Vec<Relationship>>;

    /// Replace the community set for the corpus.
    async fn replace_communities(&self, corpus_id: &str, communities: &[Community]) -> Result<()>;

    async fn communities(&self, corpus_id: &str) -> Result<Vec<Community>>;

    async fn stats(&self, corpus_id: &str) -> Result<GraphStoreStats>;
}

/// Cosine similarity of two equal-length vectors; 0.0 when either norm
/// vanishes.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}
