// Learning module
// Usage event log, triplet mining, adapter training, and promotion

pub mod miner;
pub mod promote;
pub mod trainer;

#[cfg(test)]
mod tests;

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;

pub use miner::{MineOutcome, Triplet, TripletFile, mine_triplets};
pub use promote::{PromoteOutcome, promote};
pub use trainer::{
    AdapterTrainer, LexicalAdapterTrainer, TrainingExample, TrainingRun, evaluate_mrr,
    resolve_triplets, run_training,
};

/// One entry in the append-only usage event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageEvent {
    /// A query was served; `top_chunk_ids` is the returned ranking.
    Search {
        event_id: String,
        corpus_id: String,
        query: String,
        top_chunk_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// Explicit user feedback on one result.
    Feedback {
        event_id: String,
        corpus_id: String,
        query: String,
        chunk_id: String,
        helpful: bool,
        timestamp: DateTime<Utc>,
    },
    /// The user expanded or followed one result.
    Click {
        event_id: String,
        corpus_id: String,
        query: String,
        chunk_id: String,
        /// 1-based rank the chunk held when clicked.
        rank: usize,
        timestamp: DateTime<Utc>,
    },
}

impl UsageEvent {
    #[inline]
    pub fn query(&self) -> &str {
        match self {
            UsageEvent::Search { query, .. }
            | UsageEvent::Feedback { query, .. }
            | UsageEvent::Click { query, .. } => query,
        }
    }
}

/// Background learning worker for one installation.
///
/// Each cycle mines the usage log into the triplet file and, once the
/// mined count since the last training run clears the trigger, trains a
/// candidate adapter and records it under the runs directory. Promotion
/// stays a separate operator action.
pub struct LearningLoop {
    config: crate::config::Config,
    chunk_store: std::sync::Arc<dyn crate::store::ChunkStore>,
    manifests: crate::index::ManifestStore,
}

impl LearningLoop {
    #[inline]
    pub fn new(
        config: crate::config::Config,
        chunk_store: std::sync::Arc<dyn crate::store::ChunkStore>,
    ) -> Self {
        let manifests = crate::index::ManifestStore::new(config.manifests_dir());
        Self {
            config,
            chunk_store,
            manifests,
        }
    }

    /// One mine-and-maybe-train cycle for a corpus. Returns the run when
    /// training fired.
    pub async fn run_once(&self, corpus_id: &str) -> Result<Option<trainer::TrainingRun>> {
        let log = UsageEventLog::new(self.config.usage_log_path());
        let events = log.read_all()?;
        let mined = miner::mine_triplets(&events, self.config.learning.min_confidence);

        let file = TripletFile::new(
            self.config.base_dir.join("learning").join("triplets.jsonl"),
        );
        file.replace(&mined, true)?;
        let triplets = file.read_all()?;

        let Some(mut manifest) = self.manifests.load(corpus_id)? else {
            return Ok(None);
        };
        let since_last = (triplets.len() as u64)
            .saturating_sub(manifest.triplet_count_at_last_train);
        if (since_last as usize) < self.config.learning.train_trigger_triplets {
            return Ok(None);
        }

        let examples =
            trainer::resolve_triplets(&self.chunk_store, corpus_id, &triplets).await?;
        if examples.is_empty() {
            return Ok(None);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let run = trainer::run_training(
            &trainer::LexicalAdapterTrainer::default(),
            &self.config.reranker.local_model,
            &examples,
            self.config.learning.holdout_fraction,
            &self.config.adapters_dir().join("runs"),
            &run_id,
        )
        .await?;

        manifest.triplet_count_at_last_train = triplets.len() as u64;
        self.manifests.save(&manifest)?;
        Ok(Some(run))
    }

    /// Periodic background loop. Runs until `cancel` fires; training
    /// failures are logged and the loop keeps going.
    pub async fn run(
        &self,
        corpus_id: &str,
        period: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => return,
            }
            match self.run_once(corpus_id).await {
                Ok(Some(run)) => {
                    tracing::info!(
                        "Learning cycle produced run {} (metric {:.4})",
                        run.run_id,
                        run.metric
                    );
                }
                Ok(None) => {}
                Err(e) => warn!("Learning cycle failed: {}", e),
            }
        }
    }
}

/// Append-only JSONL event log. Malformed lines are skipped on read so a
/// torn write can never poison the learning loop.
pub struct UsageEventLog {
    path: PathBuf,
}

impl UsageEventLog {
    #[inline]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, event: &UsageEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(event)
            .map_err(|e| crate::RagError::Store(format!("event serialization failed: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<UsageEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping malformed event log line {}: {}", i + 1, e),
            }
        }
        Ok(events)
    }
}
