//! Cross-encoder scoring backends and the learned adapter.
//!
//! The heavy model runtime is an external capability behind
//! [`CrossEncoderBackend`]. The in-crate backend is a deterministic
//! lexical scorer, which keeps offline runs and tests dependency-free;
//! a learned adapter layers a trained term-weight table over whichever
//! backend is active.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SparseTokenizer;
use crate::store::bm25::tokenize;
use crate::{RagError, Result};

/// Scores `(query, document)` pairs. One batch call per invocation.
#[async_trait]
pub trait CrossEncoderBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn score_batch(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// Deterministic lexical cross-encoder: weighted token overlap between
/// query and document, discounted by document length.
pub struct LexicalCrossEncoder {
    name: String,
}

impl LexicalCrossEncoder {
    #[inline]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl CrossEncoderBackend for LexicalCrossEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn score_batch(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let query_tokens: Vec<String> = tokenize(query, SparseTokenizer::Code);
        let query_set: std::collections::HashSet<&str> =
            query_tokens.iter().map(|t| t.as_str()).collect();

        Ok(documents
            .iter()
            .map(|doc| {
                let doc_tokens = tokenize(doc, SparseTokenizer::Code);
                if doc_tokens.is_empty() || query_set.is_empty() {
                    return 0.0;
                }
                let overlap = doc_tokens
                    .iter()
                    .filter(|t| query_set.contains(t.as_str()))
                    .count() as f32;
                overlap / (doc_tokens.len() as f32).sqrt()
            })
            .collect())
    }
}

/// Trained term-weight table applied on top of a backend's scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adapter {
    /// Human-readable version tag, carried into match metadata.
    pub version: String,
    /// term → additive score weight, applied when the term appears in
    /// both query and document.
    pub weights: HashMap<String, f32>,
    #[serde(default)]
    pub bias: f32,
}

impl Adapter {
    /// Load an adapter from its weight file, returning the adapter and
    /// the file's fingerprint.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let bytes = std::fs::read(path).map_err(|e| {
            RagError::RerankerUnavailable(format!(
                "adapter file {} unreadable: {e}",
                path.display()
            ))
        })?;
        let adapter: Adapter = serde_json::from_slice(&bytes).map_err(|e| {
            RagError::RerankerUnavailable(format!(
                "adapter file {} malformed: {e}",
                path.display()
            ))
        })?;
        Ok((adapter, fingerprint(&bytes)))
    }

    /// Additive adjustment for one `(query, document)` pair.
    pub fn adjust(&self, query: &str, document: &str) -> f32 {
        let query_tokens: std::collections::HashSet<String> =
            tokenize(query, SparseTokenizer::Code).into_iter().collect();
        let doc_tokens: std::collections::HashSet<String> =
            tokenize(document, SparseTokenizer::Code).into_iter().collect();

        let mut adjustment = self.bias;
        for (term, weight) in &self.weights {
            if query_tokens.contains(term) && doc_tokens.contains(term) {
                adjustment += weight;
            }
        }
        adjustment
    }
}

/// Fingerprint of an adapter weight file's bytes.
#[inline]
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprint the file at `path` without parsing it.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(fingerprint(&bytes))
}

/// A fully-loaded scoring model: backend plus optional adapter. Cloned
/// `Arc`s of this are the reference count that keeps an old version
/// alive for in-flight requests across a hot swap.
pub struct LoadedModel {
    pub backend: std::sync::Arc<dyn CrossEncoderBackend>,
    pub adapter: Option<Adapter>,
    /// Fingerprint of the adapter weight file, when one is loaded.
    pub fingerprint: Option<String>,
}

impl LoadedModel {
    /// Version tag exposed in match metadata: adapter version when
    /// present, backend name otherwise.
    #[inline]
    pub fn version_tag(&self) -> String {
        self.adapter
            .as_ref()
            .map(|a| a.version.clone())
            .unwrap_or_else(|| self.backend.name().to_string())
    }

    pub async fn score_batch(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        let mut scores = self.backend.score_batch(query, documents).await?;
        if let Some(adapter) = &self.adapter {
            for (score, document) in scores.iter_mut().zip(documents.iter()) {
                *score += adapter.adjust(query, document);
            }
        }
        Ok(scores)
    }
}
