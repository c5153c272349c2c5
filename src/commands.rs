use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, RerankerMode};
use crate::embedder::Embedder;
use crate::graph::GraphBuilder;
use crate::index::{BuildOptions, BuildProgress, Indexer, ProgressFn};
use crate::learning::{
    LearningLoop, LexicalAdapterTrainer, TripletFile, UsageEventLog, mine_triplets, promote,
    resolve_triplets, run_training,
};
use crate::providers::{
    ChatModel, CloudReranker, EmbeddingProvider, HashEmbedding, HttpReranker, OllamaChatModel,
    OllamaEmbedding,
};
use crate::rerank::Reranker;
use crate::search::{RetrievalOrchestrator, SearchRequest};
use crate::store::{ChunkStore, GraphStore, SqliteStore};

/// Assembled application stack shared by the CLI commands.
struct AppContext {
    config: Config,
    chunk_store: Arc<dyn ChunkStore>,
    graph_store: Arc<dyn GraphStore>,
    embedder: Arc<Embedder>,
    chat: Option<Arc<dyn ChatModel>>,
}

impl AppContext {
    async fn new(config_dir: &Path) -> Result<Self> {
        let config = Config::load(config_dir)?;

        let store = Arc::new(
            SqliteStore::open(&config.database_path(), config.sparse_search.clone()).await?,
        );
        let chunk_store: Arc<dyn ChunkStore> = store.clone();
        let graph_store: Arc<dyn GraphStore> = store;

        let provider: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
            "hash" => Arc::new(HashEmbedding::new(config.embedding.dimension)),
            _ => Arc::new(OllamaEmbedding::new(&config.embedding)?),
        };
        let embedder = Arc::new(Embedder::new(
            provider,
            config.embedding_cache_dir(),
            config.embedding.clone(),
        ));

        let chat: Option<Arc<dyn ChatModel>> = if config.graph_search.semantic_entities {
            Some(Arc::new(OllamaChatModel::new(
                &config.embedding.endpoint,
                &config.graph_search.semantic_model,
            )?))
        } else {
            None
        };

        Ok(Self {
            config,
            chunk_store,
            graph_store,
            embedder,
            chat,
        })
    }

    fn indexer(&self) -> Result<Indexer> {
        let graph_builder = GraphBuilder::new(
            self.graph_store.clone(),
            self.chat.clone(),
            Some(self.embedder.clone()),
            self.config.graph_search.clone(),
        );
        Ok(Indexer::new(
            self.chunk_store.clone(),
            self.graph_store.clone(),
            graph_builder,
            self.embedder.clone(),
            self.config.clone(),
        )?)
    }

    fn orchestrator(&self) -> RetrievalOrchestrator {
        let cloud: Option<Arc<dyn CloudReranker>> =
            if self.config.reranker.mode == RerankerMode::Cloud {
                HttpReranker::new(&self.config.reranker)
                    .ok()
                    .map(|r| Arc::new(r) as Arc<dyn CloudReranker>)
            } else {
                None
            };
        let reranker = Arc::new(Reranker::new(self.config.reranker.clone(), cloud));

        RetrievalOrchestrator::new(
            self.config.clone(),
            self.chunk_store.clone(),
            self.graph_store.clone(),
            self.embedder.clone(),
            reranker,
        )
    }
}

/// Build (or rebuild) the index for a corpus rooted at `path`.
#[inline]
pub async fn index_corpus(
    config_dir: &Path,
    corpus_id: String,
    path: PathBuf,
    force: bool,
) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let indexer = context.indexer()?;

    let bar = if console::user_attended_stderr() {
        ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
                .expect("style template is valid"),
        )
    } else {
        ProgressBar::hidden()
    };
    let progress: ProgressFn = {
        let bar = bar.clone();
        Arc::new(move |update: BuildProgress| {
            bar.set_length(update.total as u64);
            bar.set_position(update.done as u64);
            bar.set_message(format!("{}: {}", update.stage, update.detail));
        })
    };

    let report = indexer
        .build(
            &corpus_id,
            &path,
            BuildOptions { force },
            Some(progress),
            &CancellationToken::new(),
        )
        .await?;
    bar.finish_and_clear();

    println!("Indexed corpus '{}':", corpus_id);
    println!("  Files seen: {}", report.files_seen);
    println!("  Files indexed: {}", report.files_indexed);
    println!("  Files removed: {}", report.files_removed);
    println!("  Chunks written: {}", report.chunks_written);
    if report.truncated_chunks > 0 {
        println!("  Truncated chunks: {}", report.truncated_chunks);
    }
    println!("  Entities: {}", report.entities_written);
    println!("  Relationships: {}", report.relationships_written);
    println!("  Communities: {}", report.communities);
    Ok(())
}

/// Run one query against a corpus and print the results.
#[inline]
pub async fn search_corpus(
    config_dir: &Path,
    corpus_id: String,
    query: String,
    top_k: Option<usize>,
) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let usage_log = UsageEventLog::new(context.config.usage_log_path());
    let orchestrator = context.orchestrator();

    let mut request = SearchRequest::new(query.clone(), corpus_id.clone());
    request.top_k = top_k;

    let response = orchestrator
        .search(&request, &CancellationToken::new())
        .await?;

    // Feed the learning loop.
    usage_log.append(&crate::learning::UsageEvent::Search {
        event_id: Uuid::new_v4().to_string(),
        corpus_id,
        query,
        top_chunk_ids: response.matches.iter().map(|m| m.chunk_id.clone()).collect(),
        timestamp: chrono::Utc::now(),
    })?;

    if response.matches.is_empty() {
        println!("No matches.");
    }
    for m in &response.matches {
        println!(
            "{} {}:{}-{} (score {:.4})",
            style(format!("#{}", m.rank_within_source)).bold(),
            m.file_path,
            m.start_line,
            m.end_line,
            m.score
        );
        for line in m.content.lines().take(4) {
            println!("    {line}");
        }
        println!();
    }
    println!(
        "{} matches in {}ms (fusion: {:?}, reranker: {})",
        response.matches.len(),
        response.latency_ms,
        response.fusion_method,
        response.reranker_mode
    );
    for (modality, status) in &response.per_modality_status {
        println!("  {modality}: {status:?}");
    }
    Ok(())
}

/// Show manifests and store statistics for every known corpus.
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let indexer = context.indexer()?;
    let corpora = indexer.manifests().list()?;

    if corpora.is_empty() {
        println!("No corpora have been indexed yet.");
        return Ok(());
    }

    for corpus_id in corpora {
        let Some(manifest) = indexer.manifests().load(&corpus_id)? else {
            continue;
        };
        let chunk_stats = context.chunk_store.stats(&corpus_id).await?;
        let graph_stats = context.graph_store.stats(&corpus_id).await?;

        println!("{}", style(&corpus_id).bold());
        println!("  Status: {}", manifest.build_status);
        if let Some(reason) = &manifest.error_reason {
            println!("  Last error: {reason}");
        }
        println!(
            "  Embedding: {}/{} ({} dims)",
            manifest.embedding_provider, manifest.embedding_model, manifest.embedding_dimension
        );
        println!("  Tokenizer: {}", manifest.sparse_tokenizer);
        if let Some(built) = manifest.last_built_at {
            println!("  Last built: {built}");
        }
        println!(
            "  Chunks: {} ({} embedded) across {} files",
            chunk_stats.chunk_count, chunk_stats.embedded_count, chunk_stats.file_count
        );
        println!(
            "  Graph: {} entities, {} relationships, {} communities",
            graph_stats.entity_count, graph_stats.relationship_count, graph_stats.community_count
        );
        if let Some(adapter) = &manifest.active_adapter {
            println!("  Active adapter: {adapter}");
        }
        println!();
    }
    Ok(())
}

/// Mine triplets from the usage log into the triplet file.
#[inline]
pub async fn mine_usage(config_dir: &Path, replace: bool) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let log = UsageEventLog::new(context.config.usage_log_path());
    let events = log.read_all()?;
    let triplets = mine_triplets(&events, context.config.learning.min_confidence);

    let file = TripletFile::new(
        context.config.base_dir.join("learning").join("triplets.jsonl"),
    );
    let outcome = if replace {
        file.replace(&triplets, true)?
    } else {
        file.append(&triplets)?
    };

    println!(
        "Mined {} triplets from {} events{}",
        outcome.triplets_mined,
        events.len(),
        if outcome.preserved_existing {
            " (kept existing file)"
        } else {
            ""
        }
    );
    Ok(())
}

/// Train an adapter from the mined triplets of one corpus.
#[inline]
pub async fn train_adapter(config_dir: &Path, corpus_id: String) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let file = TripletFile::new(
        context.config.base_dir.join("learning").join("triplets.jsonl"),
    );
    let triplets = file.read_all()?;
    if triplets.is_empty() {
        println!("No triplets mined yet; run mine first.");
        return Ok(());
    }

    let examples = resolve_triplets(&context.chunk_store, &corpus_id, &triplets).await?;
    info!(
        "Resolved {}/{} triplets against corpus {}",
        examples.len(),
        triplets.len(),
        corpus_id
    );

    let run_id = Uuid::new_v4().to_string();
    let run = run_training(
        &LexicalAdapterTrainer::default(),
        &context.config.reranker.local_model,
        &examples,
        context.config.learning.holdout_fraction,
        &context.config.adapters_dir().join("runs"),
        &run_id,
    )
    .await?;

    println!("Training run {} complete.", run.run_id);
    println!("  Metric (MRR): {:.4}", run.metric);
    println!("  Baseline:     {:.4}", run.baseline_metric);
    println!(
        "  Examples: {} train / {} holdout",
        run.train_count, run.holdout_count
    );
    println!("  Fingerprint: {}", run.fingerprint);
    Ok(())
}

/// Run the background learning loop for a corpus until interrupted.
#[inline]
pub async fn run_learning_loop(
    config_dir: &Path,
    corpus_id: String,
    period_secs: u64,
) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    if !context.config.learning.enabled {
        println!("Learning is disabled in config; enable [learning] first.");
        return Ok(());
    }

    let learning_loop = LearningLoop::new(context.config.clone(), context.chunk_store.clone());
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    println!(
        "Learning loop running for corpus '{}' every {}s (ctrl-c to stop)",
        corpus_id, period_secs
    );
    learning_loop
        .run(
            &corpus_id,
            std::time::Duration::from_secs(period_secs.max(1)),
            cancel,
        )
        .await;
    Ok(())
}

/// Promote a completed training run's adapter to active.
#[inline]
pub async fn promote_run(config_dir: &Path, run_id: String) -> Result<()> {
    let context = AppContext::new(config_dir).await?;
    let run_dir = context.config.adapters_dir().join("runs").join(&run_id);
    let active = context
        .config
        .reranker
        .adapter_path
        .clone()
        .unwrap_or_else(|| {
            context
                .config
                .adapters_dir()
                .join("active")
                .join("adapter.json")
        });

    let outcome = promote(&run_dir, &active, context.config.learning.epsilon)?;
    if outcome.promoted {
        println!(
            "Promoted run {} (metric {:.4} over baseline {:.4}).",
            run_id, outcome.metric, outcome.baseline_metric
        );
        println!("Active adapter: {}", active.display());
    } else {
        println!("Promotion refused: {}", outcome.reason);
    }
    Ok(())
}

/// Print the resolved configuration.
#[inline]
pub fn show_config(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("{rendered}");
    Ok(())
}
