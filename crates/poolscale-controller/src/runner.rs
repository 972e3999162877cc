//! Background loop: every pool ticks on its own task.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::controller::Controller;

/// Tick every pool on its own interval until `shutdown` flips.
///
/// A pool's interval is its signal's period, or the service tick interval,
/// and is looked up again before every sleep so reloads take effect. A slow
/// or failing pool never delays the others. Returns once every pool task
/// has stopped and the signal workers are closed.
pub async fn run(controller: Arc<Controller>, shutdown: watch::Receiver<bool>) {
    info!(pools = controller.pool_names().len(), "autoscaler started");

    let mut tasks = JoinSet::new();
    for pool in controller.pool_names() {
        let controller = Arc::clone(&controller);
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            loop {
                let interval = match controller.tick_interval(&pool).await {
                    Ok(interval) => interval,
                    Err(e) => {
                        warn!(pool = %pool, error = %e, "pool has no interval, stopping its loop");
                        break;
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Some(report) = controller.tick(&pool).await {
                            debug!(pool = %pool, delta = report.decision.delta, "pool ticked");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            pool
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(pool) => debug!(pool = %pool, "pool loop stopped"),
            Err(e) => tracing::error!(error = %e, "pool loop panicked"),
        }
    }
    controller.shutdown().await;
    info!("autoscaler shutting down");
}
