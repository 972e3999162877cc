//! poolscale.toml configuration model.
//!
//! One file describes the service (timeouts, retry budget, default signal),
//! the autoscaling defaults, and every pool with its resource groups. Pools
//! may override any autoscaling default.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MetricKind, SignalIdentity};

/// Configuration errors. Any of these makes a pool definition unusable and is
/// fatal to the service.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {0:?} (expected e.g. \"500ms\", \"30s\", \"5m\", \"2h\")")]
    Duration(String),

    #[error("pool {pool}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("duplicate pool name: {0}")]
    DuplicatePool(String),

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("invalid signal config {signal}: {reason}")]
    InvalidSignal { signal: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolscaleConfig {
    pub service: ServiceConfig,
    pub autoscaling: AutoscalingConfig,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Cluster name handed to signals at initialization.
    pub cluster: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where versioned signal archives are published.
    #[serde(default = "default_archive_dir")]
    pub signal_archive_dir: PathBuf,
    /// Where unpacked signal versions are cached.
    #[serde(default = "default_cache_dir")]
    pub signal_cache_dir: PathBuf,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    #[serde(default = "default_init_timeout")]
    pub signal_init_timeout: String,
    #[serde(default = "default_eval_timeout")]
    pub signal_eval_timeout: String,
    #[serde(default = "default_cloud_timeout")]
    pub cloud_timeout: String,
    #[serde(default = "default_retry_attempts")]
    pub cloud_retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub cloud_retry_base_delay: String,
    /// Continue a background tick with last-known values when some group
    /// states could not be read.
    #[serde(default = "default_true")]
    pub proceed_on_partial_state: bool,
    /// The signal every pool falls back to.
    pub default_signal: SignalConfig,
}

/// Autoscaling parameters. The top-level table holds the defaults; pools
/// override individual fields through [`AutoscalingOverrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    /// Target CPU utilization ratio in `(0, 1]`.
    pub setpoint: f64,
    /// Tolerance band around the setpoint before the loop acts.
    pub setpoint_margin: f64,
    #[serde(default)]
    pub excluded_resources: Vec<String>,
    #[serde(default)]
    pub prevent_scale_down_after_capacity_loss: bool,
    /// Number of lost instances tolerated inside the window before
    /// scale-down is suppressed.
    #[serde(default)]
    pub instance_loss_threshold: u32,
    #[serde(default = "default_loss_window")]
    pub capacity_loss_window: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoscalingOverrides {
    pub setpoint: Option<f64>,
    pub setpoint_margin: Option<f64>,
    pub excluded_resources: Option<Vec<String>>,
    pub prevent_scale_down_after_capacity_loss: Option<bool>,
    pub instance_loss_threshold: Option<u32>,
    pub capacity_loss_window: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Application identity passed to signals; defaults to the pool name.
    pub app: Option<String>,
    pub min_capacity: u64,
    pub max_capacity: u64,
    pub max_weight_to_add: u64,
    pub max_weight_to_remove: u64,
    /// CPUs provided by one unit of capacity, if known up front.
    pub cpus_per_unit: Option<f64>,
    pub max_tasks_to_kill: Option<u64>,
    #[serde(default)]
    pub termination_order: TerminationOrder,
    #[serde(default)]
    pub remainder_policy: RemainderPolicy,
    #[serde(default)]
    pub draining_enabled: bool,
    #[serde(default)]
    pub autoscaling: AutoscalingOverrides,
    /// Application-owned signal; the service default is used when absent.
    pub signal: Option<SignalConfig>,
    #[serde(default)]
    pub resource_groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
}

/// Order in which instances of a shrinking group are removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOrder {
    #[default]
    HighestUptime,
    FewestTasks,
    ZoneThenId,
}

/// Which groups receive the leftover units when a fair share does not
/// divide evenly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Configured group order.
    #[default]
    GroupOrder,
    /// Groups with the lowest current target first, then group order.
    LowestTargetFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub namespace: String,
    pub name: String,
    pub branch_or_tag: String,
    /// How often the pool using this signal ticks. The service
    /// `tick_interval` applies when absent.
    pub period_minutes: Option<u32>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub required_metrics: Vec<RequiredMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredMetric {
    pub name: String,
    pub kind: MetricKind,
    pub minute_range: u32,
}

impl SignalConfig {
    pub fn identity(&self) -> SignalIdentity {
        SignalIdentity::new(&self.namespace, &self.name, &self.branch_or_tag)
    }

    pub fn period(&self) -> Option<Duration> {
        self.period_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSignal {
            signal: self.identity().to_string(),
            reason: reason.to_string(),
        };
        if self.name.is_empty() || self.namespace.is_empty() || self.branch_or_tag.is_empty() {
            return Err(invalid("namespace, name and branch_or_tag are required"));
        }
        if self.period_minutes == Some(0) {
            return Err(invalid("period_minutes must be positive"));
        }
        if self
            .required_metrics
            .iter()
            .any(|m| m.kind == MetricKind::Metadata)
        {
            return Err(invalid("metadata metrics cannot be queried by signals"));
        }
        Ok(())
    }
}

impl PoolConfig {
    /// Application name handed to signals.
    pub fn app(&self) -> &str {
        self.app.as_deref().unwrap_or(&self.name)
    }

    /// Time between ticks: the period of the signal this pool runs (its own
    /// signal when configured, else the service default), else `fallback`.
    pub fn tick_interval(&self, default_signal: &SignalConfig, fallback: Duration) -> Duration {
        self.signal
            .as_ref()
            .unwrap_or(default_signal)
            .period()
            .unwrap_or(fallback)
    }

    /// Effective autoscaling settings: pool overrides on top of defaults.
    pub fn autoscaling(&self, defaults: &AutoscalingConfig) -> AutoscalingConfig {
        let o = &self.autoscaling;
        AutoscalingConfig {
            setpoint: o.setpoint.unwrap_or(defaults.setpoint),
            setpoint_margin: o.setpoint_margin.unwrap_or(defaults.setpoint_margin),
            excluded_resources: o
                .excluded_resources
                .clone()
                .unwrap_or_else(|| defaults.excluded_resources.clone()),
            prevent_scale_down_after_capacity_loss: o
                .prevent_scale_down_after_capacity_loss
                .unwrap_or(defaults.prevent_scale_down_after_capacity_loss),
            instance_loss_threshold: o
                .instance_loss_threshold
                .unwrap_or(defaults.instance_loss_threshold),
            capacity_loss_window: o
                .capacity_loss_window
                .clone()
                .unwrap_or_else(|| defaults.capacity_loss_window.clone()),
        }
    }

    fn validate(&self, defaults: &AutoscalingConfig) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPool {
            pool: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("pool name must not be empty".to_string()));
        }
        if self.min_capacity > self.max_capacity {
            return Err(invalid(format!(
                "min_capacity {} exceeds max_capacity {}",
                self.min_capacity, self.max_capacity
            )));
        }
        if let Some(f) = self.cpus_per_unit
            && f <= 0.0
        {
            return Err(invalid(format!("cpus_per_unit must be positive, got {f}")));
        }
        let mut seen = HashSet::new();
        for group in &self.resource_groups {
            if group.id.is_empty() {
                return Err(invalid("resource group id must not be empty".to_string()));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(invalid(format!("duplicate resource group {}", group.id)));
            }
        }
        let effective = self.autoscaling(defaults);
        validate_autoscaling(&effective).map_err(invalid)?;
        parse_duration(&effective.capacity_loss_window)?;
        if let Some(signal) = &self.signal {
            signal.validate()?;
        }
        Ok(())
    }
}

fn validate_autoscaling(cfg: &AutoscalingConfig) -> Result<(), String> {
    if !(cfg.setpoint > 0.0 && cfg.setpoint <= 1.0) {
        return Err(format!("setpoint must be in (0, 1], got {}", cfg.setpoint));
    }
    if cfg.setpoint_margin < 0.0 {
        return Err(format!(
            "setpoint_margin must not be negative, got {}",
            cfg.setpoint_margin
        ));
    }
    Ok(())
}

impl ServiceConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(60))
    }

    pub fn signal_init_timeout(&self) -> Duration {
        parse_duration(&self.signal_init_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn signal_eval_timeout(&self) -> Duration {
        parse_duration(&self.signal_eval_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn cloud_timeout(&self) -> Duration {
        parse_duration(&self.cloud_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn cloud_retry_base_delay(&self) -> Duration {
        parse_duration(&self.cloud_retry_base_delay).unwrap_or(Duration::from_millis(500))
    }
}

impl AutoscalingConfig {
    pub fn capacity_loss_window(&self) -> Duration {
        parse_duration(&self.capacity_loss_window).unwrap_or(Duration::from_secs(900))
    }
}

impl PoolscaleConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PoolscaleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.service;
        for d in [
            &s.tick_interval,
            &s.signal_init_timeout,
            &s.signal_eval_timeout,
            &s.cloud_timeout,
            &s.cloud_retry_base_delay,
            &self.autoscaling.capacity_loss_window,
        ] {
            parse_duration(d)?;
        }
        validate_autoscaling(&self.autoscaling).map_err(|reason| ConfigError::InvalidPool {
            pool: "<defaults>".to_string(),
            reason,
        })?;
        s.default_signal.validate()?;

        let mut names = HashSet::new();
        for pool in &self.pools {
            if !names.insert(pool.name.as_str()) {
                return Err(ConfigError::DuplicatePool(pool.name.clone()));
            }
            pool.validate(&self.autoscaling)?;
        }
        Ok(())
    }

    pub fn pool(&self, name: &str) -> Result<&PoolConfig, ConfigError> {
        self.pools
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ConfigError::UnknownPool(name.to_string()))
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"` or `"2h"`.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let err = || ConfigError::Duration(s.to_string());
    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = digits.trim().parse().map_err(|_| err())?;
    Ok(Duration::from_millis(value.checked_mul(scale_ms).ok_or_else(err)?))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/poolscale")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("/var/lib/poolscale/signals")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/poolscale")
}

fn default_tick_interval() -> String {
    "60s".to_string()
}

fn default_init_timeout() -> String {
    "30s".to_string()
}

fn default_eval_timeout() -> String {
    "60s".to_string()
}

fn default_cloud_timeout() -> String {
    "10s".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay() -> String {
    "500ms".to_string()
}

fn default_loss_window() -> String {
    "15m".to_string()
}

fn default_true() -> bool {
    true
}
