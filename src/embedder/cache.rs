//! Content-addressed embedding cache.
//!
//! Keyed by `(provider, model, sha256(text))` so identical text is never
//! re-embedded across rebuilds or corpora. Entries are JSON files written
//! stage-and-rename, which makes concurrent inserts idempotent: the last
//! rename wins and both writers produced identical bytes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    provider: String,
    model: String,
    dimension: usize,
    vector: Vec<f32>,
}

pub struct EmbeddingCache {
    dir: PathBuf,
    provider: String,
    model: String,
    /// Per-key locks implementing single-flight for concurrent misses.
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EmbeddingCache {
    #[inline]
    pub fn new(dir: PathBuf, provider: &str, model: &str) -> Self {
        Self {
            dir,
            provider: provider.to_string(),
            model: model.to_string(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Cache key for a text under this cache's provider and model.
    #[inline]
    pub fn key_for(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(&key[..2]).join(format!("{key}.json"))
    }

    /// Look up a cached vector. Corrupt or mismatched entries read as
    /// misses.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let path = self.entry_path(key);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.provider == self.provider && entry.model == self.model => {
                Some(entry.vector)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Dropping corrupt cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Insert a vector. Idempotent; concurrent inserts for the same key
    /// are harmless.
    pub fn put(&self, key: &str, vector: &[f32]) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let entry = CacheEntry {
            provider: self.provider.clone(),
            model: self.model.clone(),
            dimension: vector.len(),
            vector: vector.to_vec(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| crate::RagError::Store(e.to_string()))?;

        let staged = path.with_extension("json.tmp");
        std::fs::write(&staged, &bytes)?;
        std::fs::rename(&staged, &path)?;
        debug!("Cached embedding {}", key);
        Ok(())
    }

    /// Acquire the single-flight lock for a key. Hold the returned guard
    /// across the recheck-fetch-insert sequence; readers of other keys are
    /// never blocked.
    pub async fn lock_key(&self, key: &str) -> Arc<Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
