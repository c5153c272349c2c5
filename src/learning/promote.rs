//! Adapter promotion.
//!
//! Promotion is an explicit operator action, never automatic. The gate:
//! the run's primary metric must exceed the stored baseline by at least
//! `epsilon`. A passing run's adapter replaces the active adapter file
//! via stage-and-rename, and the reranker's file watcher picks up the
//! new fingerprint on its next poll.

use std::path::Path;

use tracing::{info, warn};

use crate::Result;

use super::trainer::TrainingRun;

#[derive(Debug, Clone, PartialEq)]
pub struct PromoteOutcome {
    pub promoted: bool,
    pub metric: f64,
    pub baseline_metric: f64,
    /// Fingerprint of the adapter now active, when promoted.
    pub fingerprint: Option<String>,
    pub reason: String,
}

/// Promote the adapter from `run_dir` to `active_adapter_path` if its
/// metric clears the baseline by `epsilon`. Refusal leaves the active
/// adapter untouched.
pub fn promote(
    run_dir: &Path,
    active_adapter_path: &Path,
    epsilon: f64,
) -> Result<PromoteOutcome> {
    let run = TrainingRun::load(run_dir)?;

    if run.metric <= run.baseline_metric + epsilon {
        let reason = format!(
            "metric {:.4} does not exceed baseline {:.4} by epsilon {:.4}",
            run.metric, run.baseline_metric, epsilon
        );
        warn!("Refusing to promote run {}: {}", run.run_id, reason);
        return Ok(PromoteOutcome {
            promoted: false,
            metric: run.metric,
            baseline_metric: run.baseline_metric,
            fingerprint: None,
            reason,
        });
    }

    let adapter_bytes = std::fs::read(TrainingRun::adapter_path(run_dir))?;
    if let Some(parent) = active_adapter_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Stage-and-rename: a watcher or query can never observe a torn
    // adapter file.
    let staged = active_adapter_path.with_extension("staging");
    std::fs::write(&staged, &adapter_bytes)?;
    std::fs::rename(&staged, active_adapter_path)?;

    info!(
        "Promoted run {} (metric {:.4} over baseline {:.4}) to {}",
        run.run_id,
        run.metric,
        run.baseline_metric,
        active_adapter_path.display()
    );
    Ok(PromoteOutcome {
        promoted: true,
        metric: run.metric,
        baseline_metric: run.baseline_metric,
        fingerprint: Some(run.fingerprint),
        reason: "metric cleared the promotion gate".to_string(),
    })
}
