use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::chunker::Chunk;
use crate::config::{Config, RerankerMode, SparseTokenizer};
use crate::fusion::ModalityStatus;
use crate::retriever::Modality;
use crate::index::manifest::{BuildStatus, Manifest, ManifestStore};
use crate::providers::{EmbeddingProvider, HashEmbedding};
use crate::rerank::Reranker;
use crate::store::{
    ChunkStore, Community, Entity, GraphStore, GraphStoreStats, MemoryStore, Relationship,
};
use crate::RagError;

const DIM: usize = 64;

struct CountingProvider {
    inner: HashEmbedding,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    fn provider(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "hash-bow"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, texts: &[String]) -> crate::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

/// GraphStore wrapper that stalls seed lookup, for timeout injection.
struct SlowGraphStore {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl GraphStore for SlowGraphStore {
    async fn upsert_entities(&self, corpus_id: &str, entities: &[Entity]) -> crate::Result<()> {
        self.inner.upsert_entities(corpus_id, entities).await
    }

    async fn upsert_relationships(
        &self,
        corpus_id: &str,
        relationships: &[Relationship],
    ) -> crate::Result<usize> {
        self.inner.upsert_relationships(corpus_id, relationships).await
    }

    async fn delete_corpus(&self, corpus_id: &str) -> crate::Result<()> {
        GraphStore::delete_corpus(self.inner.as_ref(), corpus_id).await
    }

    async fn delete_file_entities(&self, corpus_id: &str, file_path: &str) -> crate::Result<()> {
        self.inner.delete_file_entities(corpus_id, file_path).await
    }

    async fn get_entity(&self, corpus_id: &str, entity_id: &str) -> crate::Result<Option<Entity>> {
        self.inner.get_entity(corpus_id, entity_id).await
    }

    async fn find_entities_by_terms(
        &self,
        corpus_id: &str,
        terms: &[String],
        limit: usize,
    ) -> crate::Result<Vec<Entity>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_entities_by_terms(corpus_id, terms, limit).await
    }

    async fn find_entities_by_embedding(
        &self,
        corpus_id: &str,
        query: &[f32],
        limit: usize,
    ) -> crate::Result<Vec<(Entity, f32)>> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .find_entities_by_embedding(corpus_id, query, limit)
            .await
    }

    async fn neighbors(
        &self,
        corpus_id: &str,
        entity_id: &str,
    ) -> crate::Result<Vec<(Relationship, Entity)>> {
        self.inner.neighbors(corpus_id, entity_id).await
    }

    async fn all_entities(&self, corpus_id: &str) -> crate::Result<Vec<Entity>> {
        self.inner.all_entities(corpus_id).await
    }

    async fn all_relationships(&self, corpus_id: &str) -> crate::Result<Vec<Relationship>> {
        self.inner.all_relationships(corpus_id).await
    }

    async fn replace_communities(
        &self,
        corpus_id: &str,
        communities: &[Community],
    ) -> crate::Result<()> {
        self.inner.replace_communities(corpus_id, communities).await
    }

    async fn communities(&self, corpus_id: &str) -> crate::Result<Vec<Community>> {
        self.inner.communities(corpus_id).await
    }

    async fn stats(&self, corpus_id: &str) -> crate::Result<GraphStoreStats> {
        GraphStore::stats(self.inner.as_ref(), corpus_id).await
    }
}

fn chunk(id: &str, file: &str, lines: (usize, usize), content: &str) -> Chunk {
    Chunk {
        chunk_id: id.to_string(),
        corpus_id: "corpus".to_string(),
        file_path: file.to_string(),
        start_line: lines.0,
        end_line: lines.1,
        language: Some("python".to_string()),
        content: content.to_string(),
        token_count: crate::chunker::estimate_token_count(content).max(1),
        content_hash: crate::chunker::sha256_hex(content.as_bytes()),
        embedding: Some(HashEmbedding::new(DIM).embed_one(content)),
        summary: None,
        truncated: false,
    }
}

async fn seed_two_file_corpus(store: &Arc<MemoryStore>) {
    store
        .upsert_chunks(
            "corpus",
            &[
                chunk(
                    "chunk-a",
                    "a.py",
                    (1, 20),
                    "def login(user, password):\n    return verify(user, password)",
                ),
                chunk(
                    "chunk-b",
                    "b.py",
                    (1, 15),
                    "def logout(session):\n    session.destroy()",
                ),
            ],
        )
        .await
        .expect("seed chunks");
}

fn write_manifest(config: &Config, dimension: usize, tokenizer: SparseTokenizer) {
    let manifests = ManifestStore::new(config.manifests_dir());
    manifests
        .save(&Manifest {
            corpus_id: "corpus".to_string(),
            embedding_provider: "hash".to_string(),
            embedding_model: "hash-bow".to_string(),
            embedding_dimension: dimension,
            chunker: config.chunker.clone(),
            sparse_tokenizer: tokenizer,
            last_built_at: Some(chrono::Utc::now()),
            build_status: BuildStatus::Complete,
            error_reason: None,
            file_hashes: Default::default(),
            triplet_count_at_last_train: 0,
            active_adapter: None,
        })
        .expect("write manifest");
}

struct Setup {
    _base: TempDir,
    provider: Arc<CountingProvider>,
    orchestrator: RetrievalOrchestrator,
}

async fn setup_with(graph_delay: Option<Duration>, mutate: impl FnOnce(&mut Config)) -> Setup {
    let base = TempDir::new().expect("create temp dir");
    let mut config = Config::default();
    config.base_dir = base.path().to_path_buf();
    config.embedding.dimension = DIM;
    mutate(&mut config);

    let store = Arc::new(MemoryStore::new(config.sparse_search.clone()));
    seed_two_file_corpus(&store).await;
    write_manifest(&config, DIM, config.sparse_search.tokenizer);

    let provider = Arc::new(CountingProvider {
        inner: HashEmbedding::new(DIM),
        calls: AtomicUsize::new(0),
    });
    let embedder = Arc::new(crate::embedder::Embedder::new(
        provider.clone(),
        config.embedding_cache_dir(),
        config.embedding.clone(),
    ));
    let reranker = Arc::new(Reranker::new(config.reranker.clone(), None));

    let graph_store: Arc<dyn GraphStore> = match graph_delay {
        Some(delay) => Arc::new(SlowGraphStore {
            inner: store.clone(),
            delay,
        }),
        None => store.clone(),
    };

    let orchestrator = RetrievalOrchestrator::new(
        config,
        store.clone(),
        graph_store,
        embedder,
        reranker,
    );
    Setup {
        _base: base,
        provider,
        orchestrator,
    }
}

async fn setup() -> Setup {
    setup_with(None, |_| {}).await
}

#[tokio::test]
async fn two_file_corpus_returns_agreed_ranking() {
    let setup = setup().await;
    let mut request = SearchRequest::new("login", "corpus");
    request.top_k = Some(2);

    let response = setup
        .orchestrator
        .search(&request, &CancellationToken::new())
        .await
        .expect("search succeeds");

    assert_eq!(response.matches.len(), 2);
    assert_eq!(response.matches[0].file_path, "a.py");
    assert_eq!(response.matches[1].file_path, "b.py");
    assert_eq!(response.reranker_mode, "none");
    assert_eq!(
        response.per_modality_status[&Modality::Vector],
        ModalityStatus::Ok { count: 2 }
    );
    // No graph entities exist, so the leg succeeds with nothing.
    assert_eq!(
        response.per_modality_status[&Modality::Graph],
        ModalityStatus::Ok { count: 0 }
    );
}

#[tokio::test]
async fn slow_graph_leg_times_out_without_failing_the_query() {
    let setup = setup_with(Some(Duration::from_millis(100)), |config| {
        config.search.modality_deadline_ms = 10;
    })
    .await;
    let mut request = SearchRequest::new("login", "corpus");
    request.top_k = Some(2);

    let response = setup
        .orchestrator
        .search(&request, &CancellationToken::new())
        .await
        .expect("search succeeds despite graph timeout");

    assert_eq!(
        response.per_modality_status[&Modality::Graph],
        ModalityStatus::Timeout
    );
    assert_eq!(response.matches[0].file_path, "a.py");
    assert_eq!(response.matches[1].file_path, "b.py");
}

#[tokio::test]
async fn dimension_mismatch_fails_before_any_retriever_runs() {
    let setup = setup().await;
    // Rewrite the manifest as if the corpus were built at 1536 dims.
    let base = setup._base.path();
    let mut config = Config::default();
    config.base_dir = base.to_path_buf();
    write_manifest(&config, 1536, SparseTokenizer::Code);

    let result = setup
        .orchestrator
        .search(&SearchRequest::new("login", "corpus"), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(RagError::ManifestMismatch { .. })));
    // The query embedder was never called.
    assert_eq!(setup.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tokenizer_mismatch_is_a_manifest_mismatch() {
    let setup = setup().await;
    let mut config = Config::default();
    config.base_dir = setup._base.path().to_path_buf();
    write_manifest(&config, DIM, SparseTokenizer::Whitespace);

    let result = setup
        .orchestrator
        .search(&SearchRequest::new("login", "corpus"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RagError::ManifestMismatch { .. })));
}

#[tokio::test]
async fn unbuilt_corpus_is_an_error() {
    let setup = setup().await;
    let result = setup
        .orchestrator
        .search(
            &SearchRequest::new("login", "never-built"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(RagError::Store(_))));
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let setup = setup().await;
    let result = setup
        .orchestrator
        .search(&SearchRequest::new("   ", "corpus"), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RagError::Config(_))));
}

#[tokio::test]
async fn disabling_all_modalities_fails() {
    let setup = setup().await;
    let mut request = SearchRequest::new("login", "corpus");
    request.include_vector = false;
    request.include_sparse = false;
    request.include_graph = false;

    let result = setup
        .orchestrator
        .search(&request, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RagError::AllRetrieversFailed(_))));
}

#[tokio::test]
async fn degraded_reranker_serves_fused_order() {
    let setup = setup_with(None, |config| {
        config.reranker.mode = RerankerMode::Learned;
        config.reranker.adapter_path =
            Some(std::path::PathBuf::from("/nonexistent/adapter.json"));
    })
    .await;

    let response = setup
        .orchestrator
        .search(&SearchRequest::new("login", "corpus"), &CancellationToken::new())
        .await
        .expect("search degrades instead of failing");

    assert_eq!(response.reranker_mode, "degraded");
    assert!(!response.matches.is_empty());
}

#[tokio::test]
async fn cancellation_tears_down_within_grace_window() {
    let setup = setup_with(Some(Duration::from_secs(5)), |config| {
        // Sub-deadline far beyond the stalled graph leg.
        config.search.deadline_ms = 10_000;
        config.search.modality_deadline_ms = 10_000;
    })
    .await;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
    }

    let started = std::time::Instant::now();
    let result = setup
        .orchestrator
        .search(&SearchRequest::new("login", "corpus"), &cancel)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RagError::Cancelled)));
    assert!(
        elapsed < Duration::from_millis(250),
        "teardown took {elapsed:?}"
    );
}

#[tokio::test]
async fn overall_deadline_bounds_the_query() {
    let setup = setup_with(Some(Duration::from_secs(5)), |config| {
        config.search.deadline_ms = 50;
        config.search.modality_deadline_ms = 50;
    })
    .await;

    let result = setup
        .orchestrator
        .search(&SearchRequest::new("login", "corpus"), &CancellationToken::new())
        .await;

    // The stalled graph leg demotes at its sub-deadline, so the query
    // itself still answers; with a sub-deadline equal to the overall
    // deadline either a timeout result or a demoted success is allowed.
    match result {
        Ok(response) => {
            assert_eq!(
                response.per_modality_status[&Modality::Graph],
                ModalityStatus::Timeout
            );
        }
        Err(e) => assert!(matches!(e, RagError::UpstreamTimeout { .. })),
    }
}
