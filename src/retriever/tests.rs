use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::chunker::Chunk;
use crate::config::{
    EmbeddingConfig, GraphSearchConfig, SparseSearchConfig, VectorSearchConfig,
};
use crate::embedder::Embedder;
use crate::providers::HashEmbedding;
use crate::store::{
    ChunkStore, Community, Entity, EntityKind, GraphStore, MemoryStore, RelKind, Relationship,
    compute_entity_id,
};

const DIM: usize = 64;

fn chunk(id: &str, file: &str, lines: (usize, usize), content: &str) -> Chunk {
    let embedding = HashEmbedding::new(DIM).embed_one(content);
    Chunk {
        chunk_id: id.to_string(),
        corpus_id: "c".to_string(),
        file_path: file.to_string(),
        start_line: lines.0,
        end_line: lines.1,
        language: Some("python".to_string()),
        content: content.to_string(),
        token_count: crate::chunker::estimate_token_count(content).max(1),
        content_hash: crate::chunker::sha256_hex(content.as_bytes()),
        embedding: Some(embedding),
        summary: None,
        truncated: false,
    }
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    store
        .upsert_chunks(
            "c",
            &[
                chunk(
                    "chunk-login",
                    "auth.py",
                    (1, 20),
                    "def login(user, password):\n    return verify(user, password)",
                ),
                chunk(
                    "chunk-logout",
                    "auth.py",
                    (21, 35),
                    "def logout(session):\n    session.destroy()",
                ),
                chunk(
                    "chunk-pool",
                    "db.py",
                    (1, 15),
                    "class ConnectionPool:\n    def acquire(self):\n        pass",
                ),
            ],
        )
        .await
        .expect("seed chunks");
    store
}

fn embedder(base: &TempDir) -> Arc<Embedder> {
    let config = EmbeddingConfig {
        dimension: DIM,
        ..EmbeddingConfig::default()
    };
    Arc::new(Embedder::new(
        Arc::new(HashEmbedding::new(DIM)),
        base.path().to_path_buf(),
        config,
    ))
}

#[tokio::test]
async fn vector_retriever_ranks_by_similarity() {
    let base = TempDir::new().expect("create temp dir");
    let store = seeded_store().await;
    let retriever = VectorRetriever::new(
        store.clone(),
        embedder(&base),
        VectorSearchConfig::default(),
    );

    let matches = retriever
        .retrieve("c", "login password verification", &CancellationToken::new())
        .await
        .expect("vector retrieval");

    assert!(!matches.is_empty());
    assert_eq!(matches[0].chunk_id, "chunk-login");
    assert_eq!(matches[0].source, MatchSource::Vector);
    assert_eq!(matches[0].rank_within_source, 1);
    for pair in matches.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn vector_threshold_filters_weak_matches() {
    let base = TempDir::new().expect("create temp dir");
    let store = seeded_store().await;
    let config = VectorSearchConfig {
        similarity_threshold: 0.99,
        ..VectorSearchConfig::default()
    };
    let retriever = VectorRetriever::new(store, embedder(&base), config);

    let matches = retriever
        .retrieve("c", "completely unrelated cooking recipe", &CancellationToken::new())
        .await
        .expect("vector retrieval");
    assert!(matches.is_empty());
}

#[tokio::test]
async fn sparse_retriever_finds_lexical_matches() {
    let store = seeded_store().await;
    let retriever = SparseRetriever::new(store, SparseSearchConfig::default());

    let matches = retriever
        .retrieve("c", "logout session", &CancellationToken::new())
        .await
        .expect("sparse retrieval");

    assert_eq!(matches[0].chunk_id, "chunk-logout");
    assert_eq!(matches[0].source, MatchSource::Sparse);
}

#[tokio::test]
async fn sparse_retriever_observes_cancellation() {
    let store = seeded_store().await;
    let retriever = SparseRetriever::new(store, SparseSearchConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = retriever.retrieve("c", "logout", &cancel).await;
    assert!(matches!(result, Err(crate::RagError::Cancelled)));
}

fn entity(name: &str, file: &str, line: usize) -> Entity {
    Entity {
        entity_id: compute_entity_id("c", &format!("{file}::{name}"), EntityKind::Function),
        corpus_id: "c".to_string(),
        name: name.to_string(),
        qualified_name: format!("{file}::{name}"),
        kind: EntityKind::Function,
        file_path: Some(file.to_string()),
        start_line: Some(line),
        description: None,
        embedding: None,
        properties: serde_json::Map::new(),
    }
}

fn described_entity(name: &str, file: &str, line: usize, description: &str) -> Entity {
    let mut entity = entity(name, file, line);
    entity.description = Some(description.to_string());
    entity.embedding = Some(HashEmbedding::new(DIM).embed_one(&format!("{name}: {description}")));
    entity
}

async fn seeded_graph(store: &Arc<MemoryStore>) -> (Entity, Entity, Entity) {
    let login = entity("login", "auth.py", 1);
    let logout = entity("logout", "auth.py", 21);
    let acquire = entity("acquire", "db.py", 2);

    store
        .upsert_entities("c", &[login.clone(), logout.clone(), acquire.clone()])
        .await
        .expect("seed entities");
    store
        .upsert_relationships(
            "c",
            &[
                Relationship {
                    source_entity_id: login.entity_id.clone(),
                    target_entity_id: acquire.entity_id.clone(),
                    kind: RelKind::Calls,
                    weight: 1.0,
                    properties: serde_json::Map::new(),
                },
            ],
        )
        .await
        .expect("seed relationships");
    (login, logout, acquire)
}

#[tokio::test]
async fn graph_retriever_walks_to_called_code() {
    let store = seeded_store().await;
    let (_, _, _) = seeded_graph(&store).await;
    let base = TempDir::new().expect("create temp dir");
    let retriever = GraphRetriever::new(
        store.clone(),
        store.clone(),
        embedder(&base),
        GraphSearchConfig::default(),
    );

    let matches = retriever
        .retrieve("c", "login", &CancellationToken::new())
        .await
        .expect("graph retrieval");

    // The seed entity's chunk ranks first; its callee arrives via the walk.
    assert_eq!(matches[0].chunk_id, "chunk-login");
    assert!(matches.iter().any(|m| m.chunk_id == "chunk-pool"));
    assert!(matches[0].score > matches.last().expect("non-empty").score);
    assert!(matches.iter().all(|m| m.source == MatchSource::Graph));
}

#[tokio::test]
async fn graph_retriever_seeds_by_description_embedding() {
    let store = seeded_store().await;
    seeded_graph(&store).await;

    // Name and description text share nothing with the query; only the
    // stored description embedding can seed this entity.
    let mut semantic = described_entity("renew", "db.py", 2, "session token refresh");
    semantic.description = None;
    store
        .upsert_entities("c", &[semantic])
        .await
        .expect("seed described entity");

    let base = TempDir::new().expect("create temp dir");
    let retriever = GraphRetriever::new(
        store.clone(),
        store.clone(),
        embedder(&base),
        GraphSearchConfig::default(),
    );

    let matches = retriever
        .retrieve("c", "session token refresh", &CancellationToken::new())
        .await
        .expect("graph retrieval");

    // The embedding-seeded entity maps back to its declaration chunk.
    assert!(matches.iter().any(|m| m.chunk_id == "chunk-pool"));
}

#[tokio::test]
async fn graph_retriever_returns_empty_without_seeds() {
    let store = seeded_store().await;
    seeded_graph(&store).await;
    let base = TempDir::new().expect("create temp dir");
    let retriever = GraphRetriever::new(
        store.clone(),
        store.clone(),
        embedder(&base),
        GraphSearchConfig::default(),
    );

    let matches = retriever
        .retrieve("c", "zzzzz_nonexistent", &CancellationToken::new())
        .await
        .expect("graph retrieval");
    assert!(matches.is_empty());
}

#[tokio::test]
async fn graph_retriever_includes_tagged_communities() {
    let store = seeded_store().await;
    let (login, _, acquire) = seeded_graph(&store).await;
    store
        .replace_communities(
            "c",
            &[Community {
                community_id: "comm-0-0".to_string(),
                corpus_id: "c".to_string(),
                level: 0,
                member_ids: vec![login.entity_id.clone(), acquire.entity_id.clone()],
                summary: Some("authentication and connection handling".to_string()),
            }],
        )
        .await
        .expect("seed communities");

    let config = GraphSearchConfig {
        include_communities: true,
        ..GraphSearchConfig::default()
    };
    let base = TempDir::new().expect("create temp dir");
    let retriever = GraphRetriever::new(store.clone(), store.clone(), embedder(&base), config);

    let matches = retriever
        .retrieve("c", "login", &CancellationToken::new())
        .await
        .expect("graph retrieval");

    let community = matches
        .iter()
        .find(|m| m.chunk_id.starts_with("community:"))
        .expect("community match present");
    assert_eq!(
        community.metadata.get("community"),
        Some(&serde_json::Value::Bool(true))
    );
    assert!(community.content.contains("authentication"));
}

#[tokio::test]
async fn hydration_skips_vanished_chunks() {
    let store = seeded_store().await;
    let candidates = vec![
        crate::store::ChunkCandidate {
            chunk_id: "chunk-login".to_string(),
            score: 0.9,
        },
        crate::store::ChunkCandidate {
            chunk_id: "gone".to_string(),
            score: 0.8,
        },
    ];

    let store: Arc<dyn ChunkStore> = store;
    let matches = hydrate_candidates(&store, "c", candidates, MatchSource::Vector)
        .await
        .expect("hydration");

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].chunk_id, "chunk-login");
}
