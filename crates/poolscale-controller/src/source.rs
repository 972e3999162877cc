//! The controller's view of a signal: something that answers with a
//! resource request, can be reloaded, and can be closed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use poolscale_core::{MetricsByName, SignalConfig, SignalResourceRequest};
use poolscale_signal::{SignalEngine, SignalResult, SignalSlot};

pub type SignalFuture<'a, T> = Pin<Box<dyn Future<Output = SignalResult<T>> + Send + 'a>>;

pub trait SignalSource: Send + Sync {
    fn evaluate<'a>(
        &'a self,
        metrics: &'a MetricsByName,
    ) -> SignalFuture<'a, Option<SignalResourceRequest>>;

    /// Swap in `config`. The previous version keeps serving if this fails.
    fn reload(&self, config: SignalConfig) -> SignalFuture<'_, u64>;

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Creates a signal source for one pool.
pub trait SignalFactory: Send + Sync {
    fn create(&self, config: &SignalConfig, pool: &str, app: &str) -> Arc<dyn SignalSource>;
}

impl SignalSource for SignalSlot {
    fn evaluate<'a>(
        &'a self,
        metrics: &'a MetricsByName,
    ) -> SignalFuture<'a, Option<SignalResourceRequest>> {
        Box::pin(SignalSlot::evaluate(self, metrics))
    }

    fn reload(&self, config: SignalConfig) -> SignalFuture<'_, u64> {
        Box::pin(SignalSlot::reload(self, Some(config)))
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(SignalSlot::close(self))
    }
}

/// Backs every source with a lazily started [`SignalSlot`].
pub struct SlotFactory {
    engine: Arc<SignalEngine>,
}

impl SlotFactory {
    pub fn new(engine: Arc<SignalEngine>) -> Self {
        Self { engine }
    }
}

impl SignalFactory for SlotFactory {
    fn create(&self, config: &SignalConfig, pool: &str, app: &str) -> Arc<dyn SignalSource> {
        Arc::new(SignalSlot::new(
            Arc::clone(&self.engine),
            config.clone(),
            pool,
            app,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolscale_signal::{DirectoryFetcher, WorkerTimeouts};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[tokio::test]
    async fn slot_sources_start_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(SignalEngine::new(
            Arc::new(DirectoryFetcher::new(dir.path())),
            "test-cluster",
            WorkerTimeouts {
                init: Duration::from_secs(1),
                eval: Duration::from_secs(1),
            },
        ));
        let config = SignalConfig {
            namespace: "batch".to_string(),
            name: "missing".to_string(),
            branch_or_tag: "v1".to_string(),
            period_minutes: Some(10),
            parameters: BTreeMap::new(),
            required_metrics: vec![],
        };
        let source = SlotFactory::new(engine).create(&config, "batch", "jobs");

        // Nothing is fetched until the first evaluation.
        let err = source.evaluate(&MetricsByName::new()).await.unwrap_err();
        assert!(err.is_configuration_failure());
        source.close().await;
    }
}
