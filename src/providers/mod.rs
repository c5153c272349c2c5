// External capability interfaces
// Embedding, chat, and cloud reranking reached through narrow contracts

pub mod cloud;
pub mod fake;
pub mod ollama;

use async_trait::async_trait;

use crate::Result;

pub use cloud::HttpReranker;
pub use fake::{HashEmbedding, StaticChatModel};
pub use ollama::{OllamaChatModel, OllamaEmbedding};

/// Maps text to fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;

    /// Embed a batch of texts. Implementations perform a single attempt;
    /// retry policy belongs to the calling embedder.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Options for a single text generation call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.0,
        }
    }
}

/// Text generation capability, used for semantic entity extraction and
/// community summaries.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

/// External reranker endpoint, used when `reranker.mode = cloud`.
#[async_trait]
pub trait CloudReranker: Send + Sync {
    /// Score each document against the query. Returns one score per
    /// document, in input order.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}
