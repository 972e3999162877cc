//! Records persisted by the poolscale state store.

use serde::{Deserialize, Serialize};

use poolscale_core::{InstanceInfo, InstanceMarket, MetricKind};

// ── Metrics ───────────────────────────────────────────────────────

/// A single metric sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub kind: MetricKind,
    /// Pool name for system/metadata metrics, app name for app metrics.
    pub scope: String,
    pub name: String,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
    pub value: f64,
}

impl MetricSample {
    /// Build the composite key for the metrics table.
    pub fn table_key(&self) -> String {
        metric_key(self.kind, &self.scope, &self.name, self.timestamp)
    }
}

pub(crate) fn metric_prefix(kind: MetricKind, scope: &str, name: &str) -> String {
    format!("{}/{}/{}@", kind.as_str(), scope, name)
}

pub(crate) fn metric_key(kind: MetricKind, scope: &str, name: &str, timestamp: u64) -> String {
    format!("{}{:020}", metric_prefix(kind, scope, name), timestamp)
}

// ── Pause toggles ─────────────────────────────────────────────────

/// Autoscaling for a pool is paused while this record exists and has not
/// expired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PauseRecord {
    pub cluster: String,
    pub pool: String,
    /// Unix timestamp when the pause was requested.
    pub paused_at: u64,
    /// Unix timestamp after which the pause no longer applies.
    pub until: Option<u64>,
}

impl PauseRecord {
    pub fn table_key(&self) -> String {
        pause_key(&self.cluster, &self.pool)
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.until.is_none_or(|until| now <= until)
    }
}

pub(crate) fn pause_key(cluster: &str, pool: &str) -> String {
    format!("{cluster}.{pool}")
}

// ── Capacity loss ─────────────────────────────────────────────────

/// An instance that disappeared from a pool without the autoscaler asking
/// for it (spot reclaim, hardware failure, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityLossEvent {
    pub pool: String,
    pub group_id: String,
    pub instance_id: String,
    pub timestamp: u64,
}

impl CapacityLossEvent {
    pub fn table_key(&self) -> String {
        format!("{}@{:020}:{}", self.pool, self.timestamp, self.instance_id)
    }
}

// ── Simulated resource groups ─────────────────────────────────────

/// Persisted state of a simulated resource group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupRecord {
    pub pool: String,
    pub id: String,
    pub target_capacity: u64,
    pub instances: Vec<InstanceInfo>,
}

impl GroupRecord {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.pool, self.id)
    }

    /// Sum of instance weights in one market.
    pub fn market_capacity(&self, market: InstanceMarket) -> u64 {
        self.instances
            .iter()
            .filter(|i| i.market == market)
            .map(|i| i.weight)
            .sum()
    }

    pub fn fulfilled_capacity(&self) -> u64 {
        self.instances.iter().map(|i| i.weight).sum()
    }
}
