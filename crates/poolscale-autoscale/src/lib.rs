//! poolscale-autoscale: setpoint-driven scaling decisions.
//!
//! Turns a signal's resource request and the pool's observed capacity into
//! a bounded capacity change. CPUs are the only dimension scaled on.
//!
//! # Scaling Algorithm
//!
//! ```text
//! paused, or the signal declined          -> delta = 0
//! request is all zeros                    -> desired = 0
//! cpus per capacity unit unknown          -> desired = current + 1   (cold start)
//! utilization = cpus / (current * cpus_per_unit)
//! |utilization - setpoint| <= margin      -> delta = 0
//! otherwise desired = round(cpus / setpoint / cpus_per_unit)
//!
//! bounded = clamp(desired, min_capacity, max_capacity)
//! delta   = clamp(bounded - current, -max_weight_to_remove, +max_weight_to_add)
//! delta   = max(delta, 0) while recent capacity loss suppresses scale-down
//! ```
//!
//! The CPUs-per-unit factor comes from live observation when the pool has
//! fulfilled capacity, then from configuration, then from a smoothed week
//! of history (see [`history`]).

pub mod decision;
pub mod history;

pub use decision::{decide, DecisionInput, DecisionPolicy, ScalingDecision, ScalingReason};
pub use history::{historical_cpus_per_unit, CPUS_TOTAL_METRIC, FULFILLED_CAPACITY_METRIC};
