//! Triplet mining over the usage event log.
//!
//! Explicit feedback outranks click-through evidence: a helpful mark is
//! a positive and an unhelpful mark a negative. When only clicks exist,
//! the highest-ranked clicked chunk is the positive and the best-ranked
//! non-clicked chunk from the same result list is sampled as negative.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

use super::UsageEvent;

const CONFIDENCE_EXPLICIT: f64 = 0.9;
const CONFIDENCE_CLICK: f64 = 0.5;

/// One training example mined from usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triplet {
    pub query: String,
    pub positive_chunk: String,
    pub negative_chunk: String,
    pub confidence: f64,
}

/// Mine triplets from a window of events. Triplets under
/// `min_confidence` are discarded; chunk resolvability is the caller's
/// concern (ids referencing deleted chunks should be filtered against
/// the store before training).
pub fn mine_triplets(events: &[UsageEvent], min_confidence: f64) -> Vec<Triplet> {
    // Group by (corpus, query) preserving a stable iteration order.
    let mut groups: BTreeMap<(String, String), Vec<&UsageEvent>> = BTreeMap::new();
    for event in events {
        let corpus_id = match event {
            UsageEvent::Search { corpus_id, .. }
            | UsageEvent::Feedback { corpus_id, .. }
            | UsageEvent::Click { corpus_id, .. } => corpus_id.clone(),
        };
        groups
            .entry((corpus_id, event.query().to_string()))
            .or_default()
            .push(event);
    }

    let mut triplets = Vec::new();
    for ((_, query), group) in &groups {
        let mut positives: Vec<&str> = Vec::new();
        let mut negatives: Vec<&str> = Vec::new();
        let mut ranking: Option<&[String]> = None;
        let mut clicks: Vec<(&str, usize)> = Vec::new();

        for event in group {
            match event {
                UsageEvent::Search { top_chunk_ids, .. } => {
                    ranking = Some(top_chunk_ids.as_slice());
                }
                UsageEvent::Feedback {
                    chunk_id, helpful, ..
                } => {
                    if *helpful {
                        positives.push(chunk_id);
                    } else {
                        negatives.push(chunk_id);
                    }
                }
                UsageEvent::Click { chunk_id, rank, .. } => clicks.push((chunk_id, *rank)),
            }
        }

        if !positives.is_empty() && !negatives.is_empty() {
            // Explicit signal on both sides.
            for positive in &positives {
                for negative in &negatives {
                    if positive != negative {
                        triplets.push(Triplet {
                            query: query.clone(),
                            positive_chunk: positive.to_string(),
                            negative_chunk: negative.to_string(),
                            confidence: CONFIDENCE_EXPLICIT,
                        });
                    }
                }
            }
            continue;
        }

        // Click-through fallback needs the served ranking.
        let Some(ranking) = ranking else {
            continue;
        };
        if clicks.is_empty() {
            continue;
        }
        clicks.sort_by_key(|(_, rank)| *rank);
        let (positive, _) = clicks[0];
        let clicked: HashSet<&str> = clicks.iter().map(|(id, _)| *id).collect();

        // Best-ranked chunk the user saw but did not open.
        let negative = ranking
            .iter()
            .find(|id| !clicked.contains(id.as_str()) && id.as_str() != positive);
        if let Some(negative) = negative {
            triplets.push(Triplet {
                query: query.clone(),
                positive_chunk: positive.to_string(),
                negative_chunk: negative.clone(),
                confidence: CONFIDENCE_CLICK,
            });
        }
    }

    triplets.retain(|t| t.confidence >= min_confidence);
    debug!("Mined {} triplets from {} events", triplets.len(), events.len());
    triplets
}

/// Persisted triplet set, one JSON object per line.
pub struct TripletFile {
    path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MineOutcome {
    pub triplets_mined: usize,
    /// Set when a replace found nothing new and kept the old file.
    pub preserved_existing: bool,
}

impl TripletFile {
    #[inline]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn read_all(&self) -> Result<Vec<Triplet>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut triplets = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(triplet) => triplets.push(triplet),
                Err(e) => warn!("Skipping malformed triplet line {}: {}", i + 1, e),
            }
        }
        Ok(triplets)
    }

    /// Replace the file's contents with `triplets`. When `triplets` is
    /// empty and `preserve_existing_on_empty` is set, the existing file
    /// is left alone instead of being truncated.
    pub fn replace(
        &self,
        triplets: &[Triplet],
        preserve_existing_on_empty: bool,
    ) -> Result<MineOutcome> {
        if triplets.is_empty() && preserve_existing_on_empty && self.path.exists() {
            return Ok(MineOutcome {
                triplets_mined: 0,
                preserved_existing: true,
            });
        }
        self.write(triplets, false)?;
        Ok(MineOutcome {
            triplets_mined: triplets.len(),
            preserved_existing: false,
        })
    }

    /// Append new triplets, skipping exact duplicates already on disk.
    pub fn append(&self, triplets: &[Triplet]) -> Result<MineOutcome> {
        let existing = self.read_all()?;
        let fresh: Vec<Triplet> = triplets
            .iter()
            .filter(|t| !existing.contains(t))
            .cloned()
            .collect();
        self.write(&fresh, true)?;
        Ok(MineOutcome {
            triplets_mined: fresh.len(),
            preserved_existing: false,
        })
    }

    fn write(&self, triplets: &[Triplet], append: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&self.path)?;
        for triplet in triplets {
            let line = serde_json::to_string(triplet)
                .map_err(|e| crate::RagError::Store(format!("triplet serialization failed: {e}")))?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}
