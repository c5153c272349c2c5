//! Hot-swappable model slot.
//!
//! The active model sits behind an atomic pointer ([`tokio::sync::RwLock`]
//! over an `Arc`). Readers clone the `Arc` and score against that exact
//! version for their whole request; a swap replaces the pointer without
//! touching in-flight clones, and the old version frees when its last
//! clone drops. Cold loads run single-flight: a request arriving during
//! a load waits on the loading lock instead of starting a second load.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::Result;

use super::scorer::LoadedModel;

pub struct ModelSlot {
    active: RwLock<Option<Arc<LoadedModel>>>,
    /// Held for the duration of a cold load.
    loading: Mutex<()>,
    last_used: Mutex<Instant>,
}

impl ModelSlot {
    #[inline]
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
            loading: Mutex::new(()),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Get the active model, cold-loading through `load` when the slot
    /// is empty. The returned `Arc` pins that model version for the
    /// caller's lifetime.
    pub async fn acquire<F>(&self, load: F) -> Result<Arc<LoadedModel>>
    where
        F: FnOnce() -> Result<LoadedModel>,
    {
        *self.last_used.lock().await = Instant::now();

        if let Some(model) = self.active.read().await.clone() {
            return Ok(model);
        }

        let _flight = self.loading.lock().await;
        // Another request may have finished loading while we waited.
        if let Some(model) = self.active.read().await.clone() {
            return Ok(model);
        }

        debug!("Cold-loading reranker model");
        let model = Arc::new(load()?);
        *self.active.write().await = Some(model.clone());
        Ok(model)
    }

    /// Atomically replace the active model. New requests see the new
    /// version immediately; in-flight requests finish on their pinned
    /// clone.
    pub async fn swap(&self, model: LoadedModel) {
        let fingerprint = model.fingerprint.clone();
        *self.active.write().await = Some(Arc::new(model));
        info!(
            "Activated reranker model (fingerprint: {})",
            fingerprint.as_deref().unwrap_or("none")
        );
    }

    /// Fingerprint of the currently active model, if any.
    pub async fn active_fingerprint(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .and_then(|m| m.fingerprint.clone())
    }

    #[inline]
    pub async fn is_loaded(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Drop the model if it has been idle past `idle_after` and no
    /// request still holds a clone. Returns whether an unload happened.
    pub async fn unload_if_idle(&self, idle_after: Duration) -> bool {
        let idle = self.last_used.lock().await.elapsed();
        if idle < idle_after {
            return false;
        }

        let mut active = self.active.write().await;
        match active.as_ref() {
            // The slot's own reference is the only one left.
            Some(model) if Arc::strong_count(model) == 1 => {
                *active = None;
                info!("Unloaded idle reranker model after {:?}", idle);
                true
            }
            _ => false,
        }
    }
}

impl Default for ModelSlot {
    fn default() -> Self {
        Self::new()
    }
}
