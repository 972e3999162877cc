//! StateStore: redb-backed persistence for poolscale.
//!
//! Provides typed operations over metric samples, pause toggles,
//! capacity-loss events, and simulated resource groups. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use poolscale_core::{MetricKind, MetricSeries};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Read access to stored metric time series.
///
/// The signal engine's callers fetch every required metric through this
/// trait before an evaluation.
pub trait MetricsSource: Send + Sync {
    /// Samples of `name` in `[start, end]` (inclusive), oldest first.
    fn get_metric_values(
        &self,
        name: &str,
        kind: MetricKind,
        scope: &str,
        start: u64,
        end: u64,
    ) -> StateResult<MetricSeries>;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing and dry runs).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(METRICS).map_err(map_err!(Table))?;
        txn.open_table(PAUSES).map_err(map_err!(Table))?;
        txn.open_table(CAPACITY_LOSS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Insert a batch of metric samples in one transaction.
    pub fn put_metrics(&self, samples: &[MetricSample]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(METRICS).map_err(map_err!(Table))?;
            for sample in samples {
                let key = sample.table_key();
                let value = serde_json::to_vec(&sample.value).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = samples.len(), "metric samples stored");
        Ok(())
    }

    /// Insert a single metric sample.
    pub fn put_metric(&self, sample: &MetricSample) -> StateResult<()> {
        self.put_metrics(std::slice::from_ref(sample))
    }

    // ── Pause toggles ──────────────────────────────────────────────

    /// Pause autoscaling for a pool, optionally until a timestamp.
    pub fn put_pause(&self, record: &PauseRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PAUSES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, until = ?record.until, "pool paused");
        Ok(())
    }

    pub fn get_pause(&self, cluster: &str, pool: &str) -> StateResult<Option<PauseRecord>> {
        let key = pause_key(cluster, pool);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PAUSES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: PauseRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove a pause toggle. Returns true if one existed.
    pub fn delete_pause(&self, cluster: &str, pool: &str) -> StateResult<bool> {
        let key = pause_key(cluster, pool);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PAUSES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "pool resumed");
        Ok(existed)
    }

    /// Whether autoscaling for the pool is paused at `now`.
    pub fn is_paused(&self, cluster: &str, pool: &str, now: u64) -> StateResult<bool> {
        Ok(self
            .get_pause(cluster, pool)?
            .is_some_and(|record| record.is_active(now)))
    }

    // ── Capacity loss ──────────────────────────────────────────────

    pub fn record_capacity_loss(&self, event: &CapacityLossEvent) -> StateResult<()> {
        let key = event.table_key();
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CAPACITY_LOSS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %event.pool, instance = %event.instance_id, "capacity loss recorded");
        Ok(())
    }

    /// Capacity-loss events for a pool at or after `since`, oldest first.
    pub fn list_capacity_loss_since(
        &self,
        pool: &str,
        since: u64,
    ) -> StateResult<Vec<CapacityLossEvent>> {
        let start = format!("{pool}@{since:020}");
        // ';' sorts right after ':', closing the range over every instance id.
        let end = format!("{pool}@{:020};", u64::MAX);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CAPACITY_LOSS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: CapacityLossEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }

    // ── Simulated resource groups ──────────────────────────────────

    /// Insert or update a group record.
    pub fn put_group(&self, group: &GroupRecord) -> StateResult<()> {
        let key = group.table_key();
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, target = group.target_capacity, "group stored");
        Ok(())
    }

    pub fn get_group(&self, pool: &str, group_id: &str) -> StateResult<Option<GroupRecord>> {
        let key = format!("{pool}/{group_id}");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let group: GroupRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// List all groups of a pool (by key prefix scan).
    pub fn list_groups(&self, pool: &str) -> StateResult<Vec<GroupRecord>> {
        let prefix = format!("{pool}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let group: GroupRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(group);
            }
        }
        Ok(results)
    }
}

impl MetricsSource for StateStore {
    fn get_metric_values(
        &self,
        name: &str,
        kind: MetricKind,
        scope: &str,
        start: u64,
        end: u64,
    ) -> StateResult<MetricSeries> {
        if start > end {
            return Ok(Vec::new());
        }
        let low = metric_key(kind, scope, name, start);
        let high = metric_key(kind, scope, name, end);
        let ts_offset = metric_prefix(kind, scope, name).len();

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METRICS).map_err(map_err!(Table))?;
        let mut series = Vec::new();
        for entry in table
            .range(low.as_str()..=high.as_str())
            .map_err(map_err!(Read))?
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let timestamp: u64 = key.value()[ts_offset..]
                .parse::<u64>()
                .map_err(map_err!(Deserialize))?;
            let sample: f64 =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            series.push((timestamp, sample));
        }
        Ok(series)
    }
}
