//! Generational signal handles.
//!
//! A `SignalSlot` holds the current handle for one pool's signal. Reloading
//! builds and initializes the replacement before swapping it in, so a
//! failed reload leaves the previous generation serving. Evaluations that
//! already cloned the old `Arc` finish against it; its worker is killed when
//! the last clone drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use poolscale_core::{MetricsByName, SignalConfig, SignalResourceRequest};

use crate::engine::SignalEngine;
use crate::error::SignalResult;
use crate::worker::SignalHandle;

pub struct SignalSlot {
    engine: Arc<SignalEngine>,
    pool: String,
    app: String,
    config: RwLock<SignalConfig>,
    current: RwLock<Option<Arc<SignalHandle>>>,
    generation: AtomicU64,
    // Serializes loads so concurrent callers don't spawn duplicate workers.
    loading: Mutex<()>,
}

impl SignalSlot {
    /// An empty slot. The worker is started lazily on first use.
    pub fn new(engine: Arc<SignalEngine>, config: SignalConfig, pool: &str, app: &str) -> Self {
        Self {
            engine,
            pool: pool.to_string(),
            app: app.to_string(),
            config: RwLock::new(config),
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            loading: Mutex::new(()),
        }
    }

    /// Number of handles installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn config(&self) -> SignalConfig {
        self.config.read().await.clone()
    }

    /// The live handle, loading a fresh one when there is none or the
    /// previous worker died.
    pub async fn handle(&self) -> SignalResult<Arc<SignalHandle>> {
        if let Some(handle) = self.live_handle().await {
            return Ok(handle);
        }
        let _loading = self.loading.lock().await;
        // Someone else may have loaded while we waited.
        if let Some(handle) = self.live_handle().await {
            return Ok(handle);
        }
        let config = self.config.read().await.clone();
        self.install(&config).await
    }

    /// Replace the signal, optionally with a new configuration. The new
    /// handle must initialize before it is swapped in.
    pub async fn reload(&self, config: Option<SignalConfig>) -> SignalResult<u64> {
        let _loading = self.loading.lock().await;
        let config = match config {
            Some(config) => config,
            None => self.config.read().await.clone(),
        };
        self.install(&config).await?;
        *self.config.write().await = config;
        Ok(self.generation())
    }

    pub async fn evaluate(
        &self,
        metrics: &MetricsByName,
    ) -> SignalResult<Option<SignalResourceRequest>> {
        let handle = self.handle().await?;
        self.engine.evaluate(&handle, metrics).await
    }

    /// Close the current worker and leave the slot empty.
    pub async fn close(&self) {
        let _loading = self.loading.lock().await;
        if let Some(handle) = self.current.write().await.take() {
            self.engine.close(&handle).await;
        }
    }

    async fn live_handle(&self) -> Option<Arc<SignalHandle>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|h| h.is_alive())
            .cloned()
    }

    async fn install(&self, config: &SignalConfig) -> SignalResult<Arc<SignalHandle>> {
        let handle = Arc::new(self.engine.load(config, &self.pool, &self.app).await?);
        let previous = self.current.write().await.replace(Arc::clone(&handle));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            pool = %self.pool,
            signal = %handle.identity(),
            generation,
            replaced = previous.is_some(),
            "signal handle installed"
        );
        Ok(handle)
    }
}
