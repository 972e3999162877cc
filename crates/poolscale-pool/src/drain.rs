//! Asynchronous draining of selected instances.
//!
//! The controller submits `(instance, reason)` requests and moves on; a
//! [`DrainWorker`] consumes them in the background and asks the adapter to
//! terminate each instance. Nobody waits for completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use poolscale_core::TerminationReason;

use crate::error::{PoolError, PoolResult};
use crate::groups::ResourceGroupAdapter;

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainRequest {
    pub pool: String,
    pub instance_id: String,
    pub group_id: String,
    pub reason: TerminationReason,
}

/// Accepts drain submissions without blocking.
pub trait DrainSink: Send + Sync {
    fn submit(&self, request: DrainRequest) -> PoolResult<()>;
}

/// Sending side of the drain queue.
#[derive(Clone)]
pub struct DrainQueue {
    tx: mpsc::Sender<DrainRequest>,
}

impl DrainSink for DrainQueue {
    fn submit(&self, request: DrainRequest) -> PoolResult<()> {
        self.tx
            .try_send(request)
            .map_err(|e| PoolError::Drain(e.to_string()))
    }
}

/// Consuming side of the drain queue.
pub struct DrainWorker {
    rx: mpsc::Receiver<DrainRequest>,
}

/// Create a connected queue and worker.
pub fn drain_queue() -> (DrainQueue, DrainWorker) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (DrainQueue { tx }, DrainWorker { rx })
}

impl DrainWorker {
    /// Process requests until shutdown or until every queue handle is
    /// dropped. Returns the number of instances terminated.
    pub async fn run(
        mut self,
        adapters: BTreeMap<String, Arc<dyn ResourceGroupAdapter>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> usize {
        info!(pools = adapters.len(), "drain worker started");
        let mut terminated = 0;
        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    let Some(request) = request else { break };
                    terminated += drain_one(&adapters, &request).await;
                }
                _ = shutdown.changed() => {
                    info!("drain worker shutting down");
                    break;
                }
            }
        }
        terminated
    }
}

async fn drain_one(
    adapters: &BTreeMap<String, Arc<dyn ResourceGroupAdapter>>,
    request: &DrainRequest,
) -> usize {
    let Some(adapter) = adapters.get(&request.pool) else {
        warn!(pool = %request.pool, instance = %request.instance_id, "no adapter for pool, dropping drain request");
        return 0;
    };
    let ids = [request.instance_id.clone()];
    match adapter.terminate_instances(&request.group_id, &ids).await {
        Ok(outcome) if outcome.is_complete() => {
            info!(
                pool = %request.pool,
                group = %request.group_id,
                instance = %request.instance_id,
                reason = %request.reason,
                "instance drained"
            );
            1
        }
        Ok(_) => {
            warn!(pool = %request.pool, instance = %request.instance_id, "instance already gone");
            0
        }
        Err(e) => {
            warn!(pool = %request.pool, instance = %request.instance_id, error = %e, "drain failed");
            0
        }
    }
}
