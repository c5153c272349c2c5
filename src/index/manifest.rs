//! Per-corpus build manifest.
//!
//! The manifest records how a corpus was built: embedding identity,
//! chunker settings, the pinned sparse tokenizer, per-file content
//! hashes for delta builds, and the active reranker adapter. Writes go
//! through stage-and-rename so a reader can never observe a torn file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ChunkerConfig, SparseTokenizer};
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Idle,
    Building,
    Complete,
    Error,
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Idle => write!(f, "idle"),
            BuildStatus::Building => write!(f, "building"),
            BuildStatus::Complete => write!(f, "complete"),
            BuildStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub corpus_id: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunker: ChunkerConfig,
    pub sparse_tokenizer: SparseTokenizer,
    pub last_built_at: Option<DateTime<Utc>>,
    pub build_status: BuildStatus,
    pub error_reason: Option<String>,
    /// file path → sha256 of its content at the last successful build.
    pub file_hashes: BTreeMap<String, String>,
    pub triplet_count_at_last_train: u64,
    /// Fingerprint of the active reranker adapter, if any.
    pub active_adapter: Option<String>,
}

impl Manifest {
    /// Whether a rebuild with these settings can reuse the existing
    /// chunk and graph rows. Any disagreement forces a full rebuild.
    #[inline]
    pub fn compatible_with(
        &self,
        provider: &str,
        model: &str,
        dimension: usize,
        chunker: &ChunkerConfig,
        tokenizer: SparseTokenizer,
    ) -> bool {
        self.embedding_provider == provider
            && self.embedding_model == model
            && self.embedding_dimension == dimension
            && &self.chunker == chunker
            && self.sparse_tokenizer == tokenizer
    }
}

/// Directory of `<corpus_id>.json` manifests with atomic replacement.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    #[inline]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[inline]
    pub fn path_for(&self, corpus_id: &str) -> PathBuf {
        self.dir.join(format!("{corpus_id}.json"))
    }

    /// Load the manifest for a corpus. A missing file is `None`; a
    /// malformed file is an error rather than a silent rebuild trigger.
    pub fn load(&self, corpus_id: &str) -> Result<Option<Manifest>> {
        let path = self.path_for(corpus_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest = serde_json::from_slice(&bytes).map_err(|e| {
            RagError::Store(format!("corrupt manifest {}: {e}", path.display()))
        })?;
        Ok(Some(manifest))
    }

    /// Write a manifest via stage-and-rename. Readers either see the old
    /// complete file or the new complete file, never a mixture.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&manifest.corpus_id);
        let staged = path.with_extension("json.staging");

        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| RagError::Store(format!("manifest serialization failed: {e}")))?;
        std::fs::write(&staged, &bytes)?;
        std::fs::rename(&staged, &path)?;
        debug!("Wrote manifest for corpus {}", manifest.corpus_id);
        Ok(())
    }

    pub fn delete(&self, corpus_id: &str) -> Result<()> {
        let path = self.path_for(corpus_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All corpus ids with a manifest on disk.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(corpus_id) = name.strip_suffix(".json") {
                ids.push(corpus_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
