//! poolscale-pool: resource groups, balancing, and instance selection.
//!
//! # Architecture
//!
//! ```text
//!  clamped_total ─► balancer::balance ─► per-group targets ─► ResourceGroupAdapter
//!                                             │                 (modify_target_capacity)
//!                        shrinking groups ◄───┘
//!                               │
//!                               ▼
//!                     selector::select ─► candidates ─► DrainQueue ─► DrainWorker
//!                                                         (or terminate_instances)
//! ```
//!
//! The balancer and selector are pure. Everything that talks to a provider
//! goes through [`groups::ResourceGroupAdapter`]; [`SimulatedGroupAdapter`]
//! implements it on top of the state store.

pub mod balancer;
pub mod drain;
pub mod error;
pub mod groups;
pub mod selector;

pub use balancer::{balance, BalancePlan, Direction, GroupTarget};
pub use drain::{drain_queue, DrainQueue, DrainRequest, DrainSink, DrainWorker};
pub use error::{CloudApiError, CriticalWorkloadError, PoolError, PoolResult};
pub use groups::{
    AdapterFuture, GroupState, GroupStatus, ResourceGroupAdapter, SimulatedGroupAdapter,
    TerminateOutcome,
};
pub use selector::{
    capacity_loss_suppresses, compare_for_removal, evictable, select, select_named, Selection,
    SelectionPolicy, ShrinkingGroup, TerminationCandidate,
};
