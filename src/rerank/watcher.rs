//! Adapter file watcher.
//!
//! Polls the active adapter path for fingerprint changes and hot-swaps
//! the model slot when one lands. A minimum reload interval debounces
//! rapid successive promotes; the same loop drives the idle-unload
//! timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scorer::{Adapter, CrossEncoderBackend, LoadedModel, fingerprint_file};
use super::swap::ModelSlot;

pub struct WatcherConfig {
    pub adapter_path: PathBuf,
    pub poll_period: Duration,
    /// Minimum time between two hot reloads.
    pub min_reload_interval: Duration,
    pub unload_after: Duration,
}

/// Run the watch loop until `cancel` fires. Spawned once per `learned`
/// reranker.
pub async fn watch(
    slot: Arc<ModelSlot>,
    backend: Arc<dyn CrossEncoderBackend>,
    config: WatcherConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.poll_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_reload: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => {
                debug!("Adapter watcher shutting down");
                return;
            }
        }

        slot.unload_if_idle(config.unload_after).await;

        let current = match fingerprint_file(&config.adapter_path) {
            Ok(f) => f,
            // Missing or unreadable adapter file: nothing to reload.
            Err(_) => continue,
        };

        // Reload only while a model is resident; a cold load will pick
        // up the newest adapter on its own.
        if !slot.is_loaded().await {
            continue;
        }
        if slot.active_fingerprint().await.as_deref() == Some(current.as_str()) {
            continue;
        }
        if let Some(at) = last_reload {
            if at.elapsed() < config.min_reload_interval {
                continue;
            }
        }

        match Adapter::load(&config.adapter_path) {
            Ok((adapter, fingerprint)) => {
                // Stage the new model fully before the atomic swap.
                let staged = LoadedModel {
                    backend: backend.clone(),
                    adapter: Some(adapter),
                    fingerprint: Some(fingerprint),
                };
                slot.swap(staged).await;
                last_reload = Some(Instant::now());
            }
            Err(e) => {
                warn!(
                    "Adapter at {} changed but failed to load: {}",
                    config.adapter_path.display(),
                    e
                );
            }
        }
    }
}
