//! The signal evaluation engine: load, evaluate, close.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use poolscale_core::{MetricKind, MetricsByName, SignalConfig, SignalResourceRequest};
use poolscale_state::{MetricsSource, StateResult};

use crate::archive::{ArchiveFetcher, SignalManifest};
use crate::error::{SignalError, SignalResult};
use crate::protocol::InitMessage;
use crate::worker::{SignalHandle, WorkerTimeouts};

/// Loads signal versions and runs them as isolated workers.
pub struct SignalEngine {
    fetcher: Arc<dyn ArchiveFetcher>,
    cluster: String,
    timeouts: WorkerTimeouts,
}

impl SignalEngine {
    pub fn new(fetcher: Arc<dyn ArchiveFetcher>, cluster: &str, timeouts: WorkerTimeouts) -> Self {
        Self {
            fetcher,
            cluster: cluster.to_string(),
            timeouts,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Fetch the configured signal version, start its worker, and hand it
    /// the pool's parameters.
    pub async fn load(&self, config: &SignalConfig, pool: &str, app: &str) -> SignalResult<SignalHandle> {
        let identity = config.identity();
        let fetcher = Arc::clone(&self.fetcher);
        let fetch_identity = identity.clone();
        // Fetching hashes and unpacks archives on disk.
        let dir: PathBuf = tokio::task::spawn_blocking(move || fetcher.fetch(&fetch_identity))
            .await
            .map_err(|e| SignalError::Load {
                signal: identity.clone(),
                reason: format!("fetch task failed: {e}"),
            })??;
        let manifest = SignalManifest::load(&identity, &dir)?;

        let init = InitMessage {
            cluster: self.cluster.clone(),
            pool: pool.to_string(),
            app: app.to_string(),
            parameters: config.parameters.clone(),
        };
        SignalHandle::spawn(&identity, &dir, &manifest, &init, self.timeouts).await
    }

    pub async fn evaluate(
        &self,
        handle: &SignalHandle,
        metrics: &MetricsByName,
    ) -> SignalResult<Option<SignalResourceRequest>> {
        handle.evaluate(metrics).await
    }

    pub async fn close(&self, handle: &SignalHandle) {
        handle.close().await;
    }
}

/// Gather every metric a signal requires, each over its own trailing
/// window ending at `now`.
///
/// System metrics are scoped by pool, app metrics by application. A metric
/// with no samples maps to an empty series.
pub fn collect_metrics(
    source: &dyn MetricsSource,
    config: &SignalConfig,
    pool: &str,
    app: &str,
    now: u64,
) -> StateResult<MetricsByName> {
    let mut metrics = MetricsByName::new();
    for required in &config.required_metrics {
        let scope = match required.kind {
            MetricKind::App => app,
            MetricKind::System | MetricKind::Metadata => pool,
        };
        let start = now.saturating_sub(u64::from(required.minute_range) * 60);
        let series = source.get_metric_values(&required.name, required.kind, scope, start, now)?;
        debug!(
            metric = %required.name,
            kind = required.kind.as_str(),
            samples = series.len(),
            "metric collected"
        );
        metrics.insert(required.name.clone(), series);
    }
    Ok(metrics)
}
