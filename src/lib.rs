use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest mismatch for corpus '{corpus_id}': {reason}")]
    ManifestMismatch { corpus_id: String, reason: String },

    #[error("Upstream timeout in {component} after {elapsed_ms}ms")]
    UpstreamTimeout { component: String, elapsed_ms: u64 },

    #[error("Upstream failure in {component}: {reason}")]
    UpstreamFailure { component: String, reason: String },

    #[error("All retrievers failed: {0}")]
    AllRetrieversFailed(String),

    #[error("Reranker unavailable: {0}")]
    RerankerUnavailable(String),

    #[error("Build already in progress for corpus '{corpus_id}' (status: {status})")]
    BuildConflict { corpus_id: String, status: String },

    #[error("Build failed for corpus '{corpus_id}': {reason}")]
    BuildFailed { corpus_id: String, reason: String },

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Stable machine-readable error kind, suitable for client-visible
    /// payloads. Never includes backtraces or nested source chains.
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Config(_) => "config_error",
            RagError::ManifestMismatch { .. } => "manifest_mismatch",
            RagError::UpstreamTimeout { .. } => "upstream_timeout",
            RagError::UpstreamFailure { .. } => "upstream_failure",
            RagError::AllRetrieversFailed(_) => "all_retrievers_failed",
            RagError::RerankerUnavailable(_) => "reranker_unavailable",
            RagError::BuildConflict { .. } => "build_conflict",
            RagError::BuildFailed { .. } => "build_failed",
            RagError::Capacity(_) => "capacity_error",
            RagError::Cancelled => "cancelled",
            RagError::Store(_) => "store_error",
            RagError::Io(_) => "io_error",
            RagError::Other(_) => "internal_error",
        }
    }

    /// Whether the failure may succeed on retry. Cancellation is never
    /// retryable.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::UpstreamTimeout { .. }
                | RagError::UpstreamFailure { .. }
                | RagError::Capacity(_)
        )
    }
}

pub mod chunker;
pub mod commands;
pub mod config;
pub mod embedder;
pub mod fusion;
pub mod graph;
pub mod index;
pub mod learning;
pub mod loader;
pub mod providers;
pub mod rerank;
pub mod retriever;
pub mod search;
pub mod store;
