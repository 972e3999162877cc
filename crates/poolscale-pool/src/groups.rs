//! Resource groups and the adapters that manage them.
//!
//! The autoscaler never launches or terminates instances itself. It reads
//! group status, requests new target capacities, and asks for specific
//! instances to be terminated through a [`ResourceGroupAdapter`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use poolscale_core::{InstanceInfo, InstanceMarket};
use poolscale_state::{GroupRecord, StateStore};

use crate::error::CloudApiError;

/// Boxed future returned by adapter calls.
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudApiError>> + Send + 'a>>;

/// Provider-side view of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub target_capacity: u64,
    pub fulfilled_by_market: BTreeMap<InstanceMarket, u64>,
}

impl GroupStatus {
    pub fn fulfilled_capacity(&self) -> u64 {
        self.fulfilled_by_market.values().sum()
    }
}

/// The controller's copy of a group, handed out by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    pub id: String,
    pub target_capacity: u64,
    pub fulfilled_by_market: BTreeMap<InstanceMarket, u64>,
    /// Provider target diverged from what was last applied.
    pub is_stale: bool,
}

impl GroupState {
    pub fn from_status(id: &str, status: GroupStatus) -> Self {
        Self {
            id: id.to_string(),
            target_capacity: status.target_capacity,
            fulfilled_by_market: status.fulfilled_by_market,
            is_stale: false,
        }
    }

    pub fn fulfilled_capacity(&self) -> u64 {
        self.fulfilled_by_market.values().sum()
    }
}

/// Result of a termination request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminateOutcome {
    pub terminated: Vec<String>,
    /// Instances the provider could not terminate.
    pub failed: Vec<String>,
}

impl TerminateOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Narrow contract to a cloud provider's group API.
pub trait ResourceGroupAdapter: Send + Sync {
    fn get_status<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, GroupStatus>;

    /// Request a new target. With `dry_run` nothing changes provider-side.
    fn modify_target_capacity<'a>(
        &'a self,
        group_id: &'a str,
        target: u64,
        dry_run: bool,
    ) -> AdapterFuture<'a, ()>;

    fn terminate_instances<'a>(
        &'a self,
        group_id: &'a str,
        instance_ids: &'a [String],
    ) -> AdapterFuture<'a, TerminateOutcome>;

    fn list_instances<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, Vec<InstanceInfo>>;
}

// ── Simulation ─────────────────────────────────────────────────────

/// Groups simulated on top of the state store.
///
/// Raising a target fulfills immediately with weight-1 instances spread
/// across the configured zones. Lowering a target only changes the
/// target; instances go away when they are terminated.
#[derive(Clone)]
pub struct SimulatedGroupAdapter {
    store: StateStore,
    pool: String,
    zones: Vec<String>,
    market: InstanceMarket,
}

impl SimulatedGroupAdapter {
    pub fn new(store: StateStore, pool: &str) -> Self {
        Self {
            store,
            pool: pool.to_string(),
            zones: vec!["zone-a".to_string(), "zone-b".to_string(), "zone-c".to_string()],
            market: InstanceMarket::Spot,
        }
    }

    pub fn with_zones(mut self, zones: Vec<String>) -> Self {
        if !zones.is_empty() {
            self.zones = zones;
        }
        self
    }

    pub fn with_market(mut self, market: InstanceMarket) -> Self {
        self.market = market;
        self
    }

    /// Create empty records for groups that do not exist yet.
    pub fn ensure_groups(&self, group_ids: &[String]) -> Result<(), CloudApiError> {
        for id in group_ids {
            if self.store.get_group(&self.pool, id).map_err(other)?.is_none() {
                self.store
                    .put_group(&GroupRecord {
                        pool: self.pool.clone(),
                        id: id.clone(),
                        target_capacity: 0,
                        instances: vec![],
                    })
                    .map_err(other)?;
                debug!(pool = %self.pool, group = %id, "simulated group created");
            }
        }
        Ok(())
    }

    fn load(&self, group_id: &str) -> Result<GroupRecord, CloudApiError> {
        self.store
            .get_group(&self.pool, group_id)
            .map_err(other)?
            .ok_or_else(|| CloudApiError::Other(format!("unknown group {group_id}")))
    }

    fn launch(&self, record: &mut GroupRecord) {
        let now = epoch_secs();
        let mut seq = record
            .instances
            .iter()
            .filter_map(|i| i.id.rsplit('-').next()?.parse::<u64>().ok())
            .max()
            .map_or(0, |n| n + 1);
        while record.fulfilled_capacity() < record.target_capacity {
            let zone = &self.zones[(seq as usize) % self.zones.len()];
            record.instances.push(InstanceInfo {
                id: format!("{}-{:06}", record.id, seq),
                group_id: record.id.clone(),
                weight: 1,
                launched_at: now,
                task_count: 0,
                availability_zone: zone.clone(),
                market: self.market,
                non_evictable: false,
                is_stale: false,
            });
            seq += 1;
        }
    }
}

impl ResourceGroupAdapter for SimulatedGroupAdapter {
    fn get_status<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, GroupStatus> {
        Box::pin(async move {
            let record = self.load(group_id)?;
            let mut fulfilled_by_market = BTreeMap::new();
            for instance in &record.instances {
                *fulfilled_by_market.entry(instance.market).or_insert(0) += instance.weight;
            }
            Ok(GroupStatus {
                target_capacity: record.target_capacity,
                fulfilled_by_market,
            })
        })
    }

    fn modify_target_capacity<'a>(
        &'a self,
        group_id: &'a str,
        target: u64,
        dry_run: bool,
    ) -> AdapterFuture<'a, ()> {
        Box::pin(async move {
            let mut record = self.load(group_id)?;
            if dry_run {
                info!(pool = %self.pool, group = %group_id, from = record.target_capacity, to = target, "dry run: would modify target");
                return Ok(());
            }
            let from = record.target_capacity;
            record.target_capacity = target;
            self.launch(&mut record);
            self.store.put_group(&record).map_err(other)?;
            info!(pool = %self.pool, group = %group_id, from, to = target, "target capacity modified");
            Ok(())
        })
    }

    fn terminate_instances<'a>(
        &'a self,
        group_id: &'a str,
        instance_ids: &'a [String],
    ) -> AdapterFuture<'a, TerminateOutcome> {
        Box::pin(async move {
            let mut record = self.load(group_id)?;
            let mut outcome = TerminateOutcome::default();
            for id in instance_ids {
                match record.instances.iter().position(|i| &i.id == id) {
                    Some(idx) => {
                        record.instances.remove(idx);
                        outcome.terminated.push(id.clone());
                    }
                    None => outcome.failed.push(id.clone()),
                }
            }
            self.store.put_group(&record).map_err(other)?;
            info!(
                pool = %self.pool,
                group = %group_id,
                terminated = outcome.terminated.len(),
                failed = outcome.failed.len(),
                "instances terminated"
            );
            Ok(outcome)
        })
    }

    fn list_instances<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, Vec<InstanceInfo>> {
        Box::pin(async move { Ok(self.load(group_id)?.instances) })
    }
}

fn other(e: impl std::fmt::Display) -> CloudApiError {
    CloudApiError::Other(e.to_string())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
