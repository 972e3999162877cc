//! poolscale-state: embedded state store for the autoscaler.
//!
//! Backed by [redb](https://docs.rs/redb), it holds the data the control
//! loop reads but does not own: metric time series (the metrics store),
//! pause toggles, capacity-loss events, and the records behind the
//! simulated resource groups.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. Keys
//! are composite strings; metric and capacity-loss keys embed a zero-padded
//! timestamp so that a key range scan returns samples oldest first.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across pool tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{MetricsSource, StateStore};
pub use types::*;
