//! Shared types used across poolscale crates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered `(timestamp, value)` samples for one metric, oldest first.
/// Timestamps are integer seconds since the Unix epoch.
pub type MetricSeries = Vec<(u64, f64)>;

/// Metric series keyed by metric name, as handed to a signal.
pub type MetricsByName = BTreeMap<String, MetricSeries>;

/// The resource dimensions a signal may request.
pub const RESOURCE_KINDS: [&str; 4] = ["cpus", "mem", "disk", "gpus"];

/// Decoded output of one signal evaluation.
///
/// Each dimension is optional: `None` means the signal has no opinion about
/// that resource this cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalResourceRequest {
    #[serde(default)]
    pub cpus: Option<f64>,
    #[serde(default)]
    pub mem: Option<f64>,
    #[serde(default)]
    pub disk: Option<f64>,
    #[serde(default)]
    pub gpus: Option<f64>,
}

impl SignalResourceRequest {
    /// A request for CPUs only.
    pub fn cpus(cpus: f64) -> Self {
        Self {
            cpus: Some(cpus),
            ..Self::default()
        }
    }

    /// True when every dimension is `None` (the signal declined).
    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, v)| v.is_none())
    }

    /// True when the request is non-empty and every present value is zero.
    pub fn is_zero(&self) -> bool {
        !self.is_empty() && self.iter().all(|(_, v)| v.is_none_or(|q| q == 0.0))
    }

    /// Iterate over `(resource_name, quantity)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<f64>)> {
        RESOURCE_KINDS
            .into_iter()
            .zip([self.cpus, self.mem, self.disk, self.gpus])
    }
}

impl fmt::Display for SignalResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .iter()
            .filter_map(|(name, v)| v.map(|q| format!("{name}={q}")))
            .collect();
        if parts.is_empty() {
            write!(f, "<empty>")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

/// Instance purchasing market inside a resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMarket {
    OnDemand,
    Spot,
}

/// Which family of metrics a signal reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Cluster/pool level metrics recorded by the autoscaler itself.
    System,
    /// Application metrics, scoped by the application name.
    App,
    /// Autoscaler bookkeeping (capacity history and the like).
    Metadata,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::System => "system",
            MetricKind::App => "app",
            MetricKind::Metadata => "metadata",
        }
    }
}

/// Identifies one version of user scaling logic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalIdentity {
    pub namespace: String,
    pub name: String,
    pub branch_or_tag: String,
}

impl SignalIdentity {
    pub fn new(namespace: &str, name: &str, branch_or_tag: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            branch_or_tag: branch_or_tag.to_string(),
        }
    }
}

impl fmt::Display for SignalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.namespace, self.name, self.branch_or_tag)
    }
}

/// A running instance inside a resource group. Read-only to the
/// autoscaler: removal is requested, never performed, here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub group_id: String,
    /// Capacity units this instance contributes to its group.
    pub weight: u64,
    /// Unix timestamp (seconds) the instance was launched.
    pub launched_at: u64,
    /// Running tasks or pods.
    pub task_count: u32,
    pub availability_zone: String,
    pub market: InstanceMarket,
    /// Runs a workload that must not be evicted for a scale-down.
    #[serde(default)]
    pub non_evictable: bool,
    /// Belongs to a group whose capacity was modified outside the loop.
    #[serde(default)]
    pub is_stale: bool,
}

impl InstanceInfo {
    pub fn uptime_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.launched_at)
    }
}

/// Why an instance is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ScalingDown,
    SpotInterruption,
    NodeMigration,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ScalingDown => "scaling_down",
            TerminationReason::SpotInterruption => "spot_interruption",
            TerminationReason::NodeMigration => "node_migration",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TerminationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaling_down" => Ok(TerminationReason::ScalingDown),
            "spot_interruption" => Ok(TerminationReason::SpotInterruption),
            "node_migration" => Ok(TerminationReason::NodeMigration),
            other => Err(format!(
                "unknown termination reason {other:?} (expected scaling_down, spot_interruption or node_migration)"
            )),
        }
    }
}
