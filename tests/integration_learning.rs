//! Learning-loop and adapter lifecycle tests: mine triplets from a usage
//! log, train and promote an adapter, and verify the reranker hot-swaps
//! under concurrent queries without mixing model versions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tribrid_rag::chunker::{Chunk, estimate_token_count, sha256_hex};
use tribrid_rag::config::{Config, RerankerMode, SparseTokenizer};
use tribrid_rag::embedder::Embedder;
use tribrid_rag::index::manifest::{BuildStatus, Manifest, ManifestStore};
use tribrid_rag::learning::{
    LexicalAdapterTrainer, TripletFile, UsageEvent, UsageEventLog, mine_triplets, promote,
    resolve_triplets, run_training,
};
use tribrid_rag::providers::HashEmbedding;
use tribrid_rag::rerank::Reranker;
use tribrid_rag::rerank::scorer::Adapter;
use tribrid_rag::search::{RetrievalOrchestrator, SearchRequest};
use tribrid_rag::store::{ChunkStore, GraphStore, MemoryStore};

const DIM: usize = 64;

fn chunk(id: &str, file: &str, content: &str) -> Chunk {
    Chunk {
        chunk_id: id.to_string(),
        corpus_id: "demo".to_string(),
        file_path: file.to_string(),
        start_line: 1,
        end_line: 10,
        language: Some("python".to_string()),
        content: content.to_string(),
        token_count: estimate_token_count(content).max(1),
        content_hash: sha256_hex(content.as_bytes()),
        embedding: Some(HashEmbedding::new(DIM).embed_one(content)),
        summary: None,
        truncated: false,
    }
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(Default::default()));
    store
        .upsert_chunks(
            "demo",
            &[
                chunk("chunk-login", "auth.py", "def login(user): verify(user)"),
                chunk("chunk-logout", "auth.py", "def logout(session): drop(session)"),
                chunk("chunk-pool", "db.py", "class ConnectionPool: pass"),
            ],
        )
        .await
        .expect("seed chunks");
    store
}

fn write_manifest(config: &Config) {
    ManifestStore::new(config.manifests_dir())
        .save(&Manifest {
            corpus_id: "demo".to_string(),
            embedding_provider: "hash".to_string(),
            embedding_model: "hash-bow".to_string(),
            embedding_dimension: DIM,
            chunker: config.chunker.clone(),
            sparse_tokenizer: SparseTokenizer::Code,
            last_built_at: Some(Utc::now()),
            build_status: BuildStatus::Complete,
            error_reason: None,
            file_hashes: Default::default(),
            triplet_count_at_last_train: 0,
            active_adapter: None,
        })
        .expect("write manifest");
}

#[tokio::test]
async fn mine_resolve_train_promote_round_trip() {
    let base = TempDir::new().expect("create base dir");
    let store = seeded_store().await;

    // A usage window with explicit feedback and a click-through query.
    let log = UsageEventLog::new(base.path().join("events").join("usage.log"));
    log.append(&UsageEvent::Search {
        event_id: "e1".into(),
        corpus_id: "demo".into(),
        query: "login verification".into(),
        top_chunk_ids: vec!["chunk-pool".into(), "chunk-login".into()],
        timestamp: Utc::now(),
    })
    .expect("append");
    log.append(&UsageEvent::Feedback {
        event_id: "e2".into(),
        corpus_id: "demo".into(),
        query: "login verification".into(),
        chunk_id: "chunk-login".into(),
        helpful: true,
        timestamp: Utc::now(),
    })
    .expect("append");
    log.append(&UsageEvent::Feedback {
        event_id: "e3".into(),
        corpus_id: "demo".into(),
        query: "login verification".into(),
        chunk_id: "chunk-pool".into(),
        helpful: false,
        timestamp: Utc::now(),
    })
    .expect("append");
    log.append(&UsageEvent::Search {
        event_id: "e4".into(),
        corpus_id: "demo".into(),
        query: "connection pooling".into(),
        top_chunk_ids: vec!["chunk-logout".into(), "chunk-pool".into()],
        timestamp: Utc::now(),
    })
    .expect("append");
    log.append(&UsageEvent::Click {
        event_id: "e5".into(),
        corpus_id: "demo".into(),
        query: "connection pooling".into(),
        chunk_id: "chunk-pool".into(),
        rank: 2,
        timestamp: Utc::now(),
    })
    .expect("append");

    let events = log.read_all().expect("read events");
    let triplets = mine_triplets(&events, 0.3);
    assert_eq!(triplets.len(), 2);

    let file = TripletFile::new(base.path().join("learning").join("triplets.jsonl"));
    file.replace(&triplets, false).expect("persist triplets");

    let chunk_store: Arc<dyn ChunkStore> = store;
    let examples = resolve_triplets(&chunk_store, "demo", &file.read_all().expect("read"))
        .await
        .expect("resolve");
    assert_eq!(examples.len(), 2);

    let run = run_training(
        &LexicalAdapterTrainer::default(),
        "cross-encoder-base",
        &examples,
        0.0001,
        &base.path().join("adapters").join("runs"),
        "run-1",
    )
    .await
    .expect("training run");

    let active = base.path().join("adapters").join("active").join("adapter.json");
    let outcome =
        promote(&base.path().join("adapters").join("runs").join("run-1"), &active, 0.01)
            .expect("promote call");

    // The gate's verdict must agree with the recorded metrics.
    assert_eq!(outcome.promoted, run.metric > run.baseline_metric + 0.01);
    assert_eq!(outcome.promoted, active.exists());
}

fn learned_config(base: &TempDir, adapter_path: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.base_dir = base.path().to_path_buf();
    config.embedding.provider = "hash".to_string();
    config.embedding.dimension = DIM;
    config.reranker.mode = RerankerMode::Learned;
    config.reranker.adapter_path = Some(adapter_path.to_path_buf());
    config.reranker.reload_period_sec = 1;
    config
}

fn write_adapter(path: &std::path::Path, version: &str, weight: f32) {
    let adapter = Adapter {
        version: version.to_string(),
        weights: [("login".to_string(), weight)].into_iter().collect(),
        bias: 0.0,
    };
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    let staged = path.with_extension("staging");
    std::fs::write(&staged, serde_json::to_vec(&adapter).expect("serialize")).expect("write");
    std::fs::rename(&staged, path).expect("rename");
}

fn version_of(response: &tribrid_rag::search::SearchResponse) -> Option<String> {
    response.matches.first().and_then(|m| {
        m.metadata
            .get("reranker_version")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    })
}

#[tokio::test]
async fn adapter_hot_swap_under_concurrent_queries() {
    let base = TempDir::new().expect("create base dir");
    let adapter_path = base.path().join("adapters").join("active").join("adapter.json");
    write_adapter(&adapter_path, "v1", 1.0);

    let config = learned_config(&base, &adapter_path);
    write_manifest(&config);
    let store = seeded_store().await;

    let chunk_store: Arc<dyn ChunkStore> = store.clone();
    let graph_store: Arc<dyn GraphStore> = store;
    let embedder = Arc::new(Embedder::new(
        Arc::new(HashEmbedding::new(DIM)),
        config.embedding_cache_dir(),
        config.embedding.clone(),
    ));
    let reranker = Arc::new(Reranker::new(config.reranker.clone(), None));
    let orchestrator = Arc::new(RetrievalOrchestrator::new(
        config,
        chunk_store,
        graph_store,
        embedder,
        reranker,
    ));

    let search = |orchestrator: Arc<RetrievalOrchestrator>| async move {
        orchestrator
            .search(&SearchRequest::new("login", "demo"), &CancellationToken::new())
            .await
            .expect("query succeeds")
    };

    // Before the swap every query scores on v1.
    let first = search(orchestrator.clone()).await;
    assert_eq!(version_of(&first).as_deref(), Some("v1"));

    // Promote v2 and hammer the orchestrator while the watcher picks it
    // up. Every query must succeed and carry exactly one version.
    write_adapter(&adapter_path, "v2", 2.0);
    let mut seen_versions = std::collections::HashSet::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let tasks: Vec<_> = (0..10)
            .map(|_| tokio::spawn(search(orchestrator.clone())))
            .collect();
        for task in tasks {
            let response = task.await.expect("task completes");
            let version = version_of(&response).expect("version tag present");
            // No query mixes versions across its matches.
            for m in &response.matches {
                assert_eq!(
                    m.metadata.get("reranker_version").and_then(|v| v.as_str()),
                    Some(version.as_str())
                );
            }
            seen_versions.insert(version);
        }
        if seen_versions.contains("v2") || std::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(seen_versions.contains("v1"));
    assert!(seen_versions.contains("v2"), "watcher never swapped to v2");
}
