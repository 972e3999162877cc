//! poolscale-core: shared types and configuration for the autoscaler.
//!
//! Everything in here is plain data: resource quantities, instance markets,
//! signal identities, and the TOML configuration model that defines pools
//! and their resource groups. No I/O besides reading the config file.

pub mod config;
pub mod types;

pub use config::{
    parse_duration, AutoscalingConfig, AutoscalingOverrides, ConfigError, GroupConfig,
    PoolConfig, PoolscaleConfig, RemainderPolicy, RequiredMetric, ServiceConfig, SignalConfig,
    TerminationOrder,
};
pub use types::*;
