//! redb table definitions for the poolscale state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Metric samples keyed by `{kind}/{scope}/{name}@{timestamp:020}`.
pub const METRICS: TableDefinition<&str, &[u8]> = TableDefinition::new("metrics");

/// Pause toggles keyed by `{cluster}.{pool}`.
pub const PAUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("pauses");

/// Capacity-loss events keyed by `{pool}@{timestamp:020}:{instance_id}`.
pub const CAPACITY_LOSS: TableDefinition<&str, &[u8]> = TableDefinition::new("capacity_loss");

/// Simulated resource groups keyed by `{pool}/{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");
