use chrono::Utc;
use tempfile::TempDir;

use super::trainer::{TrainingExample, is_holdout, run_training};
use super::*;
use crate::learning::trainer::LexicalAdapterTrainer;
use crate::rerank::scorer::LexicalCrossEncoder;

fn search(query: &str, top: &[&str]) -> UsageEvent {
    UsageEvent::Search {
        event_id: format!("search-{query}"),
        corpus_id: "c".to_string(),
        query: query.to_string(),
        top_chunk_ids: top.iter().map(|s| s.to_string()).collect(),
        timestamp: Utc::now(),
    }
}

fn feedback(query: &str, chunk: &str, helpful: bool) -> UsageEvent {
    UsageEvent::Feedback {
        event_id: format!("feedback-{query}-{chunk}"),
        corpus_id: "c".to_string(),
        query: query.to_string(),
        chunk_id: chunk.to_string(),
        helpful,
        timestamp: Utc::now(),
    }
}

fn click(query: &str, chunk: &str, rank: usize) -> UsageEvent {
    UsageEvent::Click {
        event_id: format!("click-{query}-{chunk}"),
        corpus_id: "c".to_string(),
        query: query.to_string(),
        chunk_id: chunk.to_string(),
        rank,
        timestamp: Utc::now(),
    }
}

#[test]
fn event_log_appends_and_reads_back() {
    let dir = TempDir::new().expect("create temp dir");
    let log = UsageEventLog::new(dir.path().join("events").join("usage.log"));

    log.append(&search("login", &["a", "b"])).expect("append");
    log.append(&click("login", "a", 1)).expect("append");

    let events = log.read_all().expect("read");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].query(), "login");
}

#[test]
fn event_log_skips_malformed_lines() {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("usage.log");
    let log = UsageEventLog::new(path.clone());
    log.append(&search("login", &["a"])).expect("append");

    // Simulate a torn write.
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .expect("open log");
    writeln!(file, "{{\"kind\": \"sear").expect("write partial line");
    log.append(&click("login", "a", 1)).expect("append");

    let events = log.read_all().expect("read");
    assert_eq!(events.len(), 2);
}

#[test]
fn explicit_feedback_mines_high_confidence_triplets() {
    let events = vec![
        search("login flow", &["a", "b", "c"]),
        feedback("login flow", "b", true),
        feedback("login flow", "c", false),
    ];

    let triplets = mine_triplets(&events, 0.3);
    assert_eq!(triplets.len(), 1);
    assert_eq!(triplets[0].positive_chunk, "b");
    assert_eq!(triplets[0].negative_chunk, "c");
    assert!(triplets[0].confidence > 0.5);
}

#[test]
fn click_through_fallback_samples_unclicked_negative() {
    let events = vec![
        search("connection pool", &["a", "b", "c"]),
        click("connection pool", "b", 2),
    ];

    let triplets = mine_triplets(&events, 0.3);
    assert_eq!(triplets.len(), 1);
    assert_eq!(triplets[0].positive_chunk, "b");
    // Highest-ranked chunk the user saw and skipped.
    assert_eq!(triplets[0].negative_chunk, "a");
}

#[test]
fn earliest_click_rank_wins_as_positive() {
    let events = vec![
        search("retry", &["a", "b", "c"]),
        click("retry", "c", 3),
        click("retry", "a", 1),
    ];

    let triplets = mine_triplets(&events, 0.3);
    assert_eq!(triplets[0].positive_chunk, "a");
    assert_eq!(triplets[0].negative_chunk, "b");
}

#[test]
fn low_confidence_triplets_are_discarded() {
    let events = vec![search("q", &["a", "b"]), click("q", "a", 1)];

    // Click-through confidence (0.5) falls under the floor.
    let triplets = mine_triplets(&events, 0.8);
    assert!(triplets.is_empty());
}

#[test]
fn queries_without_signal_yield_nothing() {
    let events = vec![search("nothing clicked", &["a", "b"])];
    assert!(mine_triplets(&events, 0.1).is_empty());
}

mod triplet_file {
    use super::super::miner::{Triplet, TripletFile};
    use tempfile::TempDir;

    fn triplet(query: &str) -> Triplet {
        Triplet {
            query: query.to_string(),
            positive_chunk: "p".to_string(),
            negative_chunk: "n".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn replace_preserves_existing_when_empty_and_enabled() {
        let dir = TempDir::new().expect("create temp dir");
        let file = TripletFile::new(dir.path().join("triplets.jsonl"));
        file.replace(&[triplet("existing")], false).expect("seed");

        let outcome = file.replace(&[], true).expect("replace");
        assert_eq!(outcome.triplets_mined, 0);
        assert!(outcome.preserved_existing);
        assert_eq!(file.read_all().expect("read").len(), 1);
    }

    #[test]
    fn replace_clears_existing_when_preserve_disabled() {
        let dir = TempDir::new().expect("create temp dir");
        let file = TripletFile::new(dir.path().join("triplets.jsonl"));
        file.replace(&[triplet("existing")], false).expect("seed");

        let outcome = file.replace(&[], false).expect("replace");
        assert_eq!(outcome.triplets_mined, 0);
        assert!(!outcome.preserved_existing);
        assert!(file.read_all().expect("read").is_empty());
    }

    #[test]
    fn append_deduplicates() {
        let dir = TempDir::new().expect("create temp dir");
        let file = TripletFile::new(dir.path().join("triplets.jsonl"));
        file.append(&[triplet("q1")]).expect("append");
        let outcome = file.append(&[triplet("q1"), triplet("q2")]).expect("append");

        assert_eq!(outcome.triplets_mined, 1);
        assert_eq!(file.read_all().expect("read").len(), 2);
    }
}

fn example(query: &str, positive: &str, negative: &str) -> TrainingExample {
    TrainingExample {
        query: query.to_string(),
        positive: positive.to_string(),
        negative: negative.to_string(),
        confidence: 0.9,
    }
}

#[tokio::test]
async fn trainer_upweights_positive_terms() {
    let trainer = LexicalAdapterTrainer::default();
    let examples = vec![example(
        "login handler",
        "def login(): authenticate()",
        "class ConnectionPool: pass",
    )];

    let adapter = trainer.train(&examples, "v-test").await.expect("train");
    assert!(*adapter.weights.get("login").expect("login weighted") > 0.0);
    assert!(!adapter.weights.contains_key("pool"));
}

#[tokio::test]
async fn adapter_improves_holdout_metric() {
    // The base lexical scorer ranks the longer overlapping negative above
    // the true positive for this query; training flips it.
    let examples: Vec<TrainingExample> = (0..20)
        .map(|i| {
            TrainingExample {
                query: format!("session timeout handling {i}"),
                positive: format!("def handle_timeout_{i}(session): session.refresh()"),
                negative: format!("session session session session log_{i} = []"),
                confidence: 0.9,
            }
        })
        .collect();

    let trainer = LexicalAdapterTrainer { learning_rate: 1.0 };
    let adapter = trainer.train(&examples, "v").await.expect("train");
    let backend = LexicalCrossEncoder::new("base");

    let baseline = evaluate_mrr(&backend, None, &examples).await.expect("eval");
    let trained = evaluate_mrr(&backend, Some(&adapter), &examples)
        .await
        .expect("eval");
    assert!(trained >= baseline);
}

#[test]
fn holdout_split_is_deterministic() {
    let e = example("some fixed query", "p", "n");
    let first = is_holdout(&e, 0.2);
    for _ in 0..5 {
        assert_eq!(is_holdout(&e, 0.2), first);
    }
    // Fraction 1.0 holds out everything, 0 keeps everything.
    assert!(is_holdout(&e, 1.0));
    assert!(!is_holdout(&e, 0.0));
}

#[tokio::test]
async fn training_run_writes_adapter_and_manifest() {
    let dir = TempDir::new().expect("create temp dir");
    let examples: Vec<TrainingExample> = (0..30)
        .map(|i| example(&format!("query {i}"), "def login(): pass", "unrelated"))
        .collect();

    let run = run_training(
        &LexicalAdapterTrainer::default(),
        "base",
        &examples,
        0.2,
        dir.path(),
        "run-1",
    )
    .await
    .expect("training run");

    let run_dir = dir.path().join("run-1");
    assert!(run_dir.join("adapter.json").exists());
    assert!(run_dir.join("run.json").exists());

    let reloaded = TrainingRun::load(&run_dir).expect("load run");
    assert_eq!(reloaded.run_id, "run-1");
    assert_eq!(reloaded.fingerprint, run.fingerprint);
    assert!(reloaded.train_count > 0);
}

mod promotion {
    use super::super::promote::promote;
    use super::super::trainer::TrainingRun;
    use crate::rerank::scorer::{Adapter, fingerprint};
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_run(dir: &std::path::Path, metric: f64, baseline: f64) {
        std::fs::create_dir_all(dir).expect("create run dir");
        let adapter = Adapter {
            version: "candidate".to_string(),
            weights: [("login".to_string(), 1.0)].into_iter().collect(),
            bias: 0.0,
        };
        let adapter_bytes = serde_json::to_vec_pretty(&adapter).expect("serialize");
        std::fs::write(dir.join("adapter.json"), &adapter_bytes).expect("write adapter");

        let run = TrainingRun {
            run_id: "run-x".to_string(),
            adapter_version: "candidate".to_string(),
            metric,
            baseline_metric: baseline,
            train_count: 10,
            holdout_count: 5,
            fingerprint: fingerprint(&adapter_bytes),
            created_at: Utc::now(),
        };
        std::fs::write(
            dir.join("run.json"),
            serde_json::to_vec_pretty(&run).expect("serialize"),
        )
        .expect("write run manifest");
    }

    #[test]
    fn promote_refused_inside_epsilon() {
        let base = TempDir::new().expect("create temp dir");
        let run_dir = base.path().join("runs").join("run-x");
        write_run(&run_dir, 0.405, 0.40);
        let active = base.path().join("adapters").join("active.json");

        let outcome = promote(&run_dir, &active, 0.01).expect("promote call");
        assert!(!outcome.promoted);
        assert!(!active.exists());
    }

    #[test]
    fn promote_succeeds_past_epsilon() {
        let base = TempDir::new().expect("create temp dir");
        let run_dir = base.path().join("runs").join("run-x");
        write_run(&run_dir, 0.42, 0.40);
        let active = base.path().join("adapters").join("active.json");

        let outcome = promote(&run_dir, &active, 0.01).expect("promote call");
        assert!(outcome.promoted);
        assert!(outcome.fingerprint.is_some());
        assert!(active.exists());

        // The promoted file parses as a complete adapter.
        let (adapter, fp) = Adapter::load(&active).expect("load active adapter");
        assert_eq!(adapter.version, "candidate");
        assert_eq!(Some(fp), outcome.fingerprint);
    }

    #[test]
    fn refused_promote_leaves_existing_active_adapter() {
        let base = TempDir::new().expect("create temp dir");
        let run_dir = base.path().join("runs").join("run-x");
        write_run(&run_dir, 0.39, 0.40);
        let active = base.path().join("adapters").join("active.json");
        std::fs::create_dir_all(active.parent().expect("parent")).expect("mkdir");
        std::fs::write(&active, b"{\"version\":\"old\",\"weights\":{}}").expect("seed active");

        let outcome = promote(&run_dir, &active, 0.01).expect("promote call");
        assert!(!outcome.promoted);
        let bytes = std::fs::read(&active).expect("read active");
        assert!(String::from_utf8_lossy(&bytes).contains("old"));
    }
}

#[tokio::test]
async fn learning_loop_waits_for_the_trigger() {
    use crate::config::{Config, SparseSearchConfig};
    use crate::index::manifest::{BuildStatus, Manifest, ManifestStore};
    use crate::store::{ChunkStore, MemoryStore};
    use std::sync::Arc;

    let base = TempDir::new().expect("create temp dir");
    let mut config = Config::default();
    config.base_dir = base.path().to_path_buf();
    config.learning.train_trigger_triplets = 2;
    // Keep every example on the training side of the split.
    config.learning.holdout_fraction = 0.001;

    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let chunk = crate::chunker::Chunk {
        chunk_id: "chunk-a".to_string(),
        corpus_id: "c".to_string(),
        file_path: "a.py".to_string(),
        start_line: 1,
        end_line: 2,
        language: None,
        content: "def login(): pass".to_string(),
        token_count: 5,
        content_hash: "h".to_string(),
        embedding: None,
        summary: None,
        truncated: false,
    };
    let chunk_b = crate::chunker::Chunk {
        chunk_id: "chunk-b".to_string(),
        content: "def logout(): pass".to_string(),
        ..chunk.clone()
    };
    store
        .upsert_chunks("c", &[chunk, chunk_b])
        .await
        .expect("seed chunks");

    ManifestStore::new(config.manifests_dir())
        .save(&Manifest {
            corpus_id: "c".to_string(),
            embedding_provider: "hash".to_string(),
            embedding_model: "hash-bow".to_string(),
            embedding_dimension: 64,
            chunker: config.chunker.clone(),
            sparse_tokenizer: Default::default(),
            last_built_at: None,
            build_status: BuildStatus::Complete,
            error_reason: None,
            file_hashes: Default::default(),
            triplet_count_at_last_train: 0,
            active_adapter: None,
        })
        .expect("write manifest");

    let log = UsageEventLog::new(config.usage_log_path());
    log.append(&search("login flow", &["chunk-a", "chunk-b"]))
        .expect("append");
    log.append(&feedback("login flow", "chunk-a", true)).expect("append");
    log.append(&feedback("login flow", "chunk-b", false)).expect("append");

    let chunk_store: Arc<dyn ChunkStore> = store;
    let learning_loop = LearningLoop::new(config.clone(), chunk_store);

    // One mined triplet is below the trigger of two.
    let outcome = learning_loop.run_once("c").await.expect("cycle runs");
    assert!(outcome.is_none());

    // A second query's feedback crosses the trigger.
    log.append(&search("logout flow", &["chunk-b", "chunk-a"]))
        .expect("append");
    log.append(&feedback("logout flow", "chunk-b", true)).expect("append");
    log.append(&feedback("logout flow", "chunk-a", false)).expect("append");

    let outcome = learning_loop.run_once("c").await.expect("cycle runs");
    let run = outcome.expect("training fired");
    assert!(run.train_count + run.holdout_count == 2);

    let manifest = ManifestStore::new(config.manifests_dir())
        .load("c")
        .expect("load")
        .expect("manifest");
    assert_eq!(manifest.triplet_count_at_last_train, 2);

    // Nothing new since the last train: the next cycle is a no-op.
    let outcome = learning_loop.run_once("c").await.expect("cycle runs");
    assert!(outcome.is_none());
}

#[tokio::test]
async fn resolve_discards_unresolvable_triplets() {
    use crate::config::SparseSearchConfig;
    use crate::store::{ChunkStore, MemoryStore};
    use std::sync::Arc;

    let store = Arc::new(MemoryStore::new(SparseSearchConfig::default()));
    let chunk = crate::chunker::Chunk {
        chunk_id: "present".to_string(),
        corpus_id: "c".to_string(),
        file_path: "a.py".to_string(),
        start_line: 1,
        end_line: 2,
        language: None,
        content: "def login(): pass".to_string(),
        token_count: 5,
        content_hash: "h".to_string(),
        embedding: None,
        summary: None,
        truncated: false,
    };
    store.upsert_chunks("c", &[chunk]).await.expect("seed");

    let triplets = vec![
        Triplet {
            query: "q".to_string(),
            positive_chunk: "present".to_string(),
            negative_chunk: "missing".to_string(),
            confidence: 0.9,
        },
        Triplet {
            query: "q".to_string(),
            positive_chunk: "present".to_string(),
            negative_chunk: "present".to_string(),
            confidence: 0.9,
        },
    ];

    let store: Arc<dyn ChunkStore> = store;
    let examples = resolve_triplets(&store, "c", &triplets)
        .await
        .expect("resolve");
    assert_eq!(examples.len(), 1);
    assert!(examples[0].positive.contains("login"));
}
