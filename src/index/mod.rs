// Indexing module
// Orchestrates loader, chunker, embedder, and graph builder into builds

pub mod manifest;


use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunker::{Chunk, Chunker, sha256_hex};
use crate::config::Config;
use crate::embedder::Embedder;
use crate::graph::GraphBuilder;
use crate::loader::{FileLoader, SourceFile};
use crate::store::{ChunkStore, GraphStore};
use crate::{RagError, Result};

pub use manifest::{BuildStatus, Manifest, ManifestStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Ignore the per-file delta and re-process everything.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    pub files_removed: usize,
    pub chunks_written: usize,
    pub truncated_chunks: usize,
    pub entities_written: usize,
    pub relationships_written: usize,
    pub communities: usize,
}

/// Build progress callback payload.
#[derive(Debug, Clone)]
pub struct BuildProgress {
    pub stage: &'static str,
    pub done: usize,
    pub total: usize,
    pub detail: String,
}

pub type ProgressFn = Arc<dyn Fn(BuildProgress) + Send + Sync>;

/// Runs end-to-end index builds, one at a time per corpus.
pub struct Indexer {
    chunk_store: Arc<dyn ChunkStore>,
    graph_builder: GraphBuilder,
    graph_store: Arc<dyn GraphStore>,
    embedder: Arc<Embedder>,
    chunker: Chunker,
    loader: FileLoader,
    manifests: ManifestStore,
    config: Config,
    /// Per-corpus build locks; holding one is the single-writer guarantee.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Indexer {
    #[inline]
    pub fn new(
        chunk_store: Arc<dyn ChunkStore>,
        graph_store: Arc<dyn GraphStore>,
        graph_builder: GraphBuilder,
        embedder: Arc<Embedder>,
        config: Config,
    ) -> Result<Self> {
        let loader = FileLoader::new(&config.loader)?;
        let chunker = Chunker::new(config.chunker.clone());
        let manifests = ManifestStore::new(config.manifests_dir());

        Ok(Self {
            chunk_store,
            graph_builder,
            graph_store,
            embedder,
            chunker,
            loader,
            manifests,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    async fn corpus_lock(&self, corpus_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(corpus_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one build. Returns [`RagError::BuildConflict`] immediately when
    /// a build for this corpus is already in flight. Cancellation is
    /// observed at file, embedding-batch, and graph-write boundaries and
    /// leaves the manifest untouched.
    pub async fn build(
        &self,
        corpus_id: &str,
        root: &Path,
        options: BuildOptions,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let lock = self.corpus_lock(corpus_id).await;
        let Ok(_guard) = lock.try_lock() else {
            return Err(RagError::BuildConflict {
                corpus_id: corpus_id.to_string(),
                status: BuildStatus::Building.to_string(),
            });
        };

        info!("Starting build for corpus {} at {}", corpus_id, root.display());
        match self
            .build_inner(corpus_id, root, options, progress, cancel)
            .await
        {
            Ok(report) => Ok(report),
            Err(RagError::Cancelled) => {
                info!("Build for corpus {} cancelled; manifest unchanged", corpus_id);
                Err(RagError::Cancelled)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Build for corpus {} failed: {}", corpus_id, reason);
                self.record_failure(corpus_id, &reason)?;
                Err(RagError::BuildFailed {
                    corpus_id: corpus_id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn build_inner(
        &self,
        corpus_id: &str,
        root: &Path,
        options: BuildOptions,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let mut report = BuildReport::default();
        let report_progress = |stage: &'static str, done: usize, total: usize, detail: String| {
            if let Some(callback) = &progress {
                callback(BuildProgress {
                    stage,
                    done,
                    total,
                    detail,
                });
            }
        };

        // Delta baseline from the prior manifest. Embedding or chunker
        // setting changes invalidate everything the corpus holds.
        let prior = self.manifests.load(corpus_id)?;
        let (mut file_hashes, incremental) = match &prior {
            Some(manifest)
                if manifest.compatible_with(
                    self.embedder.provider_name(),
                    self.embedder.model(),
                    self.embedder.dimension(),
                    &self.config.chunker,
                    self.config.sparse_search.tokenizer,
                ) =>
            {
                (manifest.file_hashes.clone(), !options.force)
            }
            Some(_) => {
                info!(
                    "Build settings changed for corpus {}; performing full rebuild",
                    corpus_id
                );
                self.chunk_store.delete_corpus(corpus_id).await?;
                self.graph_store.delete_corpus(corpus_id).await?;
                (BTreeMap::new(), false)
            }
            None => (BTreeMap::new(), false),
        };

        report_progress("load", 0, 0, root.display().to_string());
        let files = self.loader.load_corpus(root)?;
        report.files_seen = files.len();

        // Removed files drop their chunks and entities.
        let current_paths: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        let removed: Vec<String> = file_hashes
            .keys()
            .filter(|p| !current_paths.contains(p.as_str()))
            .cloned()
            .collect();
        for path in &removed {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            self.chunk_store.delete_file_chunks(corpus_id, path).await?;
            self.graph_store.delete_file_entities(corpus_id, path).await?;
            file_hashes.remove(path);
        }
        report.files_removed = removed.len();

        let changed: Vec<SourceFile> = files
            .into_iter()
            .filter(|file| {
                let hash = sha256_hex(file.content.as_bytes());
                !incremental || file_hashes.get(&file.path) != Some(&hash)
            })
            .collect();
        let total = changed.len();

        // Chunk and embed with bounded concurrency; `buffered` preserves
        // sorted file order for the write phase.
        let mut chunked: Vec<(SourceFile, Vec<Chunk>)> = Vec::with_capacity(total);
        let mut embed_stream = stream::iter(changed.into_iter().map(|file| {
            let chunker = &self.chunker;
            let embedder = self.embedder.clone();
            let cancel = cancel.clone();
            let corpus_id = corpus_id.to_string();
            async move {
                if cancel.is_cancelled() {
                    return Err(RagError::Cancelled);
                }
                let outcome = chunker.chunk_file(&corpus_id, &file);
                let texts: Vec<String> =
                    outcome.chunks.iter().map(|c| c.content.clone()).collect();
                let vectors = embedder.embed(&texts, &cancel).await?;
                let mut chunks = outcome.chunks;
                for (chunk, vector) in chunks.iter_mut().zip(vectors.into_iter()) {
                    chunk.embedding = Some(vector);
                }
                Ok::<_, RagError>((file, chunks, outcome.truncated_count))
            }
        }))
        .buffered(self.config.embedding.concurrency);

        let mut done = 0usize;
        while let Some(result) = embed_stream.next().await {
            if cancel.is_cancelled() {
                return Err(RagError::Cancelled);
            }
            let (file, chunks, truncated) = result?;
            self.chunk_store
                .delete_file_chunks(corpus_id, &file.path)
                .await?;
            self.chunk_store.upsert_chunks(corpus_id, &chunks).await?;

            report.chunks_written += chunks.len();
            report.truncated_chunks += truncated;
            done += 1;
            report_progress("embed", done, total, file.path.clone());

            file_hashes.insert(file.path.clone(), sha256_hex(file.content.as_bytes()));
            chunked.push((file, chunks));
        }
        drop(embed_stream);
        report.files_indexed = done;

        report_progress("graph", 0, total, String::new());
        let graph_stats = self.graph_builder.build(corpus_id, &chunked, cancel).await?;
        report.entities_written = graph_stats.entities_written;
        report.relationships_written = graph_stats.relationships_written;
        report.communities = graph_stats.communities;

        if cancel.is_cancelled() {
            return Err(RagError::Cancelled);
        }

        // Manifest is written last so readers only ever observe fully
        // built state.
        report_progress("manifest", total, total, String::new());
        let manifest = Manifest {
            corpus_id: corpus_id.to_string(),
            embedding_provider: self.embedder.provider_name().to_string(),
            embedding_model: self.embedder.model().to_string(),
            embedding_dimension: self.embedder.dimension(),
            chunker: self.config.chunker.clone(),
            sparse_tokenizer: self.config.sparse_search.tokenizer,
            last_built_at: Some(Utc::now()),
            build_status: BuildStatus::Complete,
            error_reason: None,
            file_hashes,
            triplet_count_at_last_train: prior
                .as_ref()
                .map(|m| m.triplet_count_at_last_train)
                .unwrap_or(0),
            active_adapter: prior.and_then(|m| m.active_adapter),
        };
        self.manifests.save(&manifest)?;

        info!(
            "Build complete for corpus {}: {} files indexed, {} chunks",
            corpus_id, report.files_indexed, report.chunks_written
        );
        Ok(report)
    }

    /// Record a failed build. The prior complete state (file hashes,
    /// embedding identity) is preserved so the corpus stays queryable.
    fn record_failure(&self, corpus_id: &str, reason: &str) -> Result<()> {
        let manifest = match self.manifests.load(corpus_id)? {
            Some(mut prior) => {
                prior.build_status = BuildStatus::Error;
                prior.error_reason = Some(reason.to_string());
                prior
            }
            None => Manifest {
                corpus_id: corpus_id.to_string(),
                embedding_provider: self.embedder.provider_name().to_string(),
                embedding_model: self.embedder.model().to_string(),
                embedding_dimension: self.embedder.dimension(),
                chunker: self.config.chunker.clone(),
                sparse_tokenizer: self.config.sparse_search.tokenizer,
                last_built_at: None,
                build_status: BuildStatus::Error,
                error_reason: Some(reason.to_string()),
                file_hashes: BTreeMap::new(),
                triplet_count_at_last_train: 0,
                active_adapter: None,
            },
        };
        self.manifests.save(&manifest)
    }

    /// Delete everything the corpus owns: chunks, graph, and manifest.
    pub async fn delete_corpus(&self, corpus_id: &str) -> Result<()> {
        let lock = self.corpus_lock(corpus_id).await;
        let Ok(_guard) = lock.try_lock() else {
            return Err(RagError::BuildConflict {
                corpus_id: corpus_id.to_string(),
                status: BuildStatus::Building.to_string(),
            });
        };
        self.chunk_store.delete_corpus(corpus_id).await?;
        self.graph_store.delete_corpus(corpus_id).await?;
        self.manifests.delete(corpus_id)?;
        info!("Deleted corpus {}", corpus_id);
        Ok(())
    }
}
