#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level validated configuration.
///
/// Every section has defaults so a missing config file yields a working
/// setup, but an invalid or partial file is rejected at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub vector_search: VectorSearchConfig,
    pub sparse_search: SparseSearchConfig,
    pub graph_search: GraphSearchConfig,
    pub fusion: FusionConfig,
    pub reranker: RerankerConfig,
    pub chunker: ChunkerConfig,
    pub loader: LoaderConfig,
    pub search: SearchConfig,
    pub learning: LearningConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            vector_search: VectorSearchConfig::default(),
            sparse_search: SparseSearchConfig::default(),
            graph_search: GraphSearchConfig::default(),
            fusion: FusionConfig::default(),
            reranker: RerankerConfig::default(),
            chunker: ChunkerConfig::default(),
            loader: LoaderConfig::default(),
            search: SearchConfig::default(),
            learning: LearningConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    /// Upper bound on tokens submitted in one provider call.
    pub token_budget: usize,
    /// Files embedded concurrently during a build.
    pub concurrency: usize,
    pub retry_max: u32,
    pub endpoint: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: "nomic-embed-text:latest".to_string(),
            dimension: 768,
            batch_size: 16,
            token_budget: 8192,
            concurrency: 4,
            retry_max: 3,
            endpoint: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorSearchConfig {
    pub enabled: bool,
    pub topk_dense: usize,
    pub similarity_threshold: f32,
}

impl Default for VectorSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topk_dense: 20,
            similarity_threshold: 0.0,
        }
    }
}

/// Tokenizer used for the lexical index. The resolved choice is pinned in
/// the corpus manifest so queries always tokenize the same way the index
/// was built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SparseTokenizer {
    /// Split identifiers on case and punctuation boundaries, lowercase.
    #[default]
    Code,
    /// Plain whitespace splitting, case preserved.
    Whitespace,
}

impl std::fmt::Display for SparseTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SparseTokenizer::Code => write!(f, "code"),
            SparseTokenizer::Whitespace => write!(f, "whitespace"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SparseSearchConfig {
    pub enabled: bool,
    pub topk_sparse: usize,
    pub k1: f32,
    pub b: f32,
    pub tokenizer: SparseTokenizer,
}

impl Default for SparseSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topk_sparse: 20,
            k1: 1.2,
            b: 0.75,
            tokenizer: SparseTokenizer::Code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphSearchConfig {
    pub enabled: bool,
    pub max_hops: usize,
    pub topk_graph: usize,
    pub include_communities: bool,
    /// Gate for LLM-backed concept extraction during builds.
    pub semantic_entities: bool,
    /// Chat model used for concept extraction and community summaries.
    pub semantic_model: String,
}

impl Default for GraphSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 2,
            topk_graph: 10,
            include_communities: false,
            semantic_entities: false,
            semantic_model: "llama3.2:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    #[default]
    Rrf,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub method: FusionMethod,
    pub vector_weight: f64,
    pub sparse_weight: f64,
    pub graph_weight: f64,
    pub rrf_k: f64,
    pub final_k: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            method: FusionMethod::Rrf,
            vector_weight: 1.0,
            sparse_weight: 1.0,
            graph_weight: 1.0,
            rrf_k: 60.0,
            final_k: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankerMode {
    #[default]
    None,
    Local,
    Learned,
    Cloud,
}

impl std::fmt::Display for RerankerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerankerMode::None => write!(f, "none"),
            RerankerMode::Local => write!(f, "local"),
            RerankerMode::Learned => write!(f, "learned"),
            RerankerMode::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankerConfig {
    pub mode: RerankerMode,
    pub local_model: String,
    pub adapter_path: Option<PathBuf>,
    pub cloud_provider: String,
    pub cloud_model: String,
    pub cloud_endpoint: String,
    pub top_n: usize,
    pub batch_size: usize,
    pub max_length: usize,
    pub reload_period_sec: u64,
    pub unload_after_sec: u64,
    pub timeout_ms: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            mode: RerankerMode::None,
            local_model: "cross-encoder-base".to_string(),
            adapter_path: None,
            cloud_provider: "none".to_string(),
            cloud_model: String::new(),
            cloud_endpoint: String::new(),
            top_n: 10,
            batch_size: 16,
            max_length: 512,
            reload_period_sec: 10,
            unload_after_sec: 300,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    Ast,
    Greedy,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkerConfig {
    pub strategy: ChunkStrategy,
    /// Target window size in tokens for greedy chunking.
    pub chunk_size: usize,
    /// Overlap in tokens between adjacent greedy windows.
    pub chunk_overlap: usize,
    pub min_chunk_chars: usize,
    pub max_chunk_tokens: usize,
    /// Lines of context duplicated across splits of an over-large declaration.
    pub ast_overlap_lines: usize,
    pub preserve_imports: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Hybrid,
            chunk_size: 512,
            chunk_overlap: 64,
            min_chunk_chars: 40,
            max_chunk_tokens: 1024,
            ast_overlap_lines: 3,
            preserve_imports: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    pub max_file_size: u64,
    pub include_extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_file_size: 1_048_576,
            include_extensions: [
                "py", "rs", "js", "ts", "tsx", "jsx", "go", "java", "c", "h", "cpp", "hpp", "rb",
                "md", "toml", "yaml", "yml", "json", "sh",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ignore_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub top_k: usize,
    pub deadline_ms: u64,
    /// Per-retriever sub-deadline, bounded by the overall deadline.
    pub modality_deadline_ms: u64,
    /// Grace window for tearing down in-flight work after cancellation.
    pub cancel_grace_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            deadline_ms: 15_000,
            modality_deadline_ms: 5_000,
            cancel_grace_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Triplets mined below this confidence are discarded.
    pub min_confidence: f64,
    /// A new adapter must beat the baseline metric by this margin to promote.
    pub epsilon: f64,
    /// Mined-triplet count that triggers a background training run.
    pub train_trigger_triplets: usize,
    pub holdout_fraction: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 0.3,
            epsilon: 0.01,
            train_trigger_triplets: 200,
            holdout_fraction: 0.2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid embedding dimension: {0} (must be between 64 and 8192)")]
    InvalidEmbeddingDimension(usize),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(usize),
    #[error("Invalid embed concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("Invalid model name: cannot be empty")]
    InvalidModel,
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid retriever top-k: {0} (must be between 1 and 1000)")]
    InvalidTopK(usize),
    #[error("Invalid similarity threshold: {0} (must be between -1.0 and 1.0)")]
    InvalidSimilarityThreshold(f32),
    #[error("Invalid BM25 k1: {0} (must be between 0.0 and 10.0)")]
    InvalidK1(f32),
    #[error("Invalid BM25 b: {0} (must be between 0.0 and 1.0)")]
    InvalidB(f32),
    #[error("Invalid max hops: {0} (must be between 1 and 6)")]
    InvalidMaxHops(usize),
    #[error("Invalid fusion weight: {0} (must be non-negative)")]
    InvalidFusionWeight(f64),
    #[error("All fusion weights are zero")]
    AllWeightsZero,
    #[error("Invalid rrf_k: {0} (must be positive)")]
    InvalidRrfK(f64),
    #[error("Invalid final_k: {0} (must be between 1 and 1000)")]
    InvalidFinalK(usize),
    #[error("Reranker mode '{0}' requires an adapter path")]
    MissingAdapterPath(String),
    #[error("Reranker mode 'cloud' requires a cloud endpoint")]
    MissingCloudEndpoint,
    #[error("Invalid reranker top_n: {0} (must be between 1 and 500)")]
    InvalidTopN(usize),
    #[error("Invalid chunk size: {0} (must be between 32 and 8192 tokens)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    OverlapTooLarge(usize, usize),
    #[error("Invalid max chunk tokens: {0} (must be >= chunk size {1})")]
    MaxChunkTokensTooSmall(usize, usize),
    #[error("Invalid max file size: {0} (must be between 1KiB and 64MiB)")]
    InvalidMaxFileSize(u64),
    #[error("Invalid deadline: {0}ms (must be between 10 and 600000)")]
    InvalidDeadline(u64),
    #[error("Modality deadline ({0}ms) exceeds overall deadline ({1}ms)")]
    ModalityDeadlineTooLarge(u64, u64),
    #[error("Invalid holdout fraction: {0} (must be in (0.0, 0.9])")]
    InvalidHoldoutFraction(f64),
    #[error("Invalid promote epsilon: {0} (must be non-negative)")]
    InvalidEpsilon(f64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for crate::RagError {
    fn from(e: ConfigError) -> Self {
        crate::RagError::Config(e.to_string())
    }
}

impl Config {
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            let mut config = Config::default();
            config.base_dir = config_dir.as_ref().to_path_buf();
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.base_dir.join("config.toml");
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_embedding()?;
        self.validate_retrievers()?;
        self.validate_fusion()?;
        self.validate_reranker()?;
        self.validate_chunker()?;
        self.validate_loader()?;
        self.validate_search()?;
        self.validate_learning()?;
        Ok(())
    }

    fn validate_embedding(&self) -> Result<(), ConfigError> {
        let e = &self.embedding;
        if e.dimension < 64 || e.dimension > 8192 {
            return Err(ConfigError::InvalidEmbeddingDimension(e.dimension));
        }
        if e.batch_size == 0 || e.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(e.batch_size));
        }
        if e.concurrency == 0 || e.concurrency > 64 {
            return Err(ConfigError::InvalidConcurrency(e.concurrency));
        }
        if e.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel);
        }
        if url::Url::parse(&e.endpoint).is_err() {
            return Err(ConfigError::InvalidEndpoint(e.endpoint.clone()));
        }
        Ok(())
    }

    fn validate_retrievers(&self) -> Result<(), ConfigError> {
        let v = &self.vector_search;
        if v.topk_dense == 0 || v.topk_dense > 1000 {
            return Err(ConfigError::InvalidTopK(v.topk_dense));
        }
        if !(-1.0..=1.0).contains(&v.similarity_threshold) {
            return Err(ConfigError::InvalidSimilarityThreshold(
                v.similarity_threshold,
            ));
        }

        let s = &self.sparse_search;
        if s.topk_sparse == 0 || s.topk_sparse > 1000 {
            return Err(ConfigError::InvalidTopK(s.topk_sparse));
        }
        if !(0.0..=10.0).contains(&s.k1) {
            return Err(ConfigError::InvalidK1(s.k1));
        }
        if !(0.0..=1.0).contains(&s.b) {
            return Err(ConfigError::InvalidB(s.b));
        }

        let g = &self.graph_search;
        if g.topk_graph == 0 || g.topk_graph > 1000 {
            return Err(ConfigError::InvalidTopK(g.topk_graph));
        }
        if g.max_hops == 0 || g.max_hops > 6 {
            return Err(ConfigError::InvalidMaxHops(g.max_hops));
        }
        Ok(())
    }

    fn validate_fusion(&self) -> Result<(), ConfigError> {
        let f = &self.fusion;
        for w in [f.vector_weight, f.sparse_weight, f.graph_weight] {
            if w < 0.0 || !w.is_finite() {
                return Err(ConfigError::InvalidFusionWeight(w));
            }
        }
        if self.enabled_weight_sum() <= 0.0 {
            return Err(ConfigError::AllWeightsZero);
        }
        if f.rrf_k <= 0.0 {
            return Err(ConfigError::InvalidRrfK(f.rrf_k));
        }
        if f.final_k == 0 || f.final_k > 1000 {
            return Err(ConfigError::InvalidFinalK(f.final_k));
        }
        Ok(())
    }

    fn validate_reranker(&self) -> Result<(), ConfigError> {
        let r = &self.reranker;
        if r.mode == RerankerMode::Learned && r.adapter_path.is_none() {
            return Err(ConfigError::MissingAdapterPath(r.mode.to_string()));
        }
        if r.mode == RerankerMode::Cloud && r.cloud_endpoint.trim().is_empty() {
            return Err(ConfigError::MissingCloudEndpoint);
        }
        if r.top_n == 0 || r.top_n > 500 {
            return Err(ConfigError::InvalidTopN(r.top_n));
        }
        if r.batch_size == 0 || r.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(r.batch_size));
        }
        Ok(())
    }

    fn validate_chunker(&self) -> Result<(), ConfigError> {
        let c = &self.chunker;
        if c.chunk_size < 32 || c.chunk_size > 8192 {
            return Err(ConfigError::InvalidChunkSize(c.chunk_size));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(ConfigError::OverlapTooLarge(c.chunk_overlap, c.chunk_size));
        }
        if c.max_chunk_tokens < c.chunk_size {
            return Err(ConfigError::MaxChunkTokensTooSmall(
                c.max_chunk_tokens,
                c.chunk_size,
            ));
        }
        Ok(())
    }

    fn validate_loader(&self) -> Result<(), ConfigError> {
        let l = &self.loader;
        if l.max_file_size < 1024 || l.max_file_size > 64 * 1024 * 1024 {
            return Err(ConfigError::InvalidMaxFileSize(l.max_file_size));
        }
        Ok(())
    }

    fn validate_search(&self) -> Result<(), ConfigError> {
        let s = &self.search;
        if s.top_k == 0 || s.top_k > 1000 {
            return Err(ConfigError::InvalidTopK(s.top_k));
        }
        if s.deadline_ms < 10 || s.deadline_ms > 600_000 {
            return Err(ConfigError::InvalidDeadline(s.deadline_ms));
        }
        if s.modality_deadline_ms > s.deadline_ms {
            return Err(ConfigError::ModalityDeadlineTooLarge(
                s.modality_deadline_ms,
                s.deadline_ms,
            ));
        }
        Ok(())
    }

    fn validate_learning(&self) -> Result<(), ConfigError> {
        let l = &self.learning;
        if l.holdout_fraction <= 0.0 || l.holdout_fraction > 0.9 {
            return Err(ConfigError::InvalidHoldoutFraction(l.holdout_fraction));
        }
        if l.epsilon < 0.0 || !l.epsilon.is_finite() {
            return Err(ConfigError::InvalidEpsilon(l.epsilon));
        }
        Ok(())
    }

    /// Sum of fusion weights over modalities that are enabled in config.
    #[inline]
    pub fn enabled_weight_sum(&self) -> f64 {
        let mut sum = 0.0;
        if self.vector_search.enabled {
            sum += self.fusion.vector_weight;
        }
        if self.sparse_search.enabled {
            sum += self.fusion.sparse_weight;
        }
        if self.graph_search.enabled {
            sum += self.fusion.graph_weight;
        }
        sum
    }

    /// Directory holding per-corpus manifests.
    #[inline]
    pub fn manifests_dir(&self) -> PathBuf {
        self.base_dir.join("manifests")
    }

    /// Directory holding the content-addressed embedding cache.
    #[inline]
    pub fn embedding_cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache").join("embeddings")
    }

    /// Directory holding trained adapters and run outputs.
    #[inline]
    pub fn adapters_dir(&self) -> PathBuf {
        self.base_dir.join("adapters")
    }

    /// Append-only usage event log path.
    #[inline]
    pub fn usage_log_path(&self) -> PathBuf {
        self.base_dir.join("events").join("usage.log")
    }

    /// SQLite database path for chunk and graph storage.
    #[inline]
    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("index.db")
    }
}
