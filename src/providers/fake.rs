//! Deterministic offline providers.
//!
//! `HashEmbedding` derives unit vectors from token hashes, giving stable,
//! dependency-free embeddings where nearby texts share vocabulary mass.
//! Used for tests and for running without an embedding server.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::providers::{ChatModel, EmbeddingProvider, GenerateOptions};
use crate::Result;

#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Bag-of-hashed-tokens projection, L2-normalized.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let index = u64::from_le_bytes(
                digest[..8].try_into().unwrap_or([0u8; 8]),
            ) as usize
                % self.dimension;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    fn provider(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        "hash-bow"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Chat model returning a fixed response, for tests and disabled semantic
/// extraction paths.
#[derive(Debug, Clone, Default)]
pub struct StaticChatModel {
    pub response: String,
}

impl StaticChatModel {
    #[inline]
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

#[async_trait]
impl ChatModel for StaticChatModel {
    async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<String> {
        Ok(self.response.clone())
    }
}
