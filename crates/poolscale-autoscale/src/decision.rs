//! The scaling decision: a pure function from observed state to a bounded
//! capacity change.

use std::fmt;

use tracing::debug;

use poolscale_core::{AutoscalingConfig, PoolConfig, SignalResourceRequest};

/// Pool-level knobs the decision respects.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub min_capacity: u64,
    pub max_capacity: u64,
    pub max_weight_to_add: u64,
    pub max_weight_to_remove: u64,
    pub setpoint: f64,
    pub setpoint_margin: f64,
    pub cpus_per_unit: Option<f64>,
    pub excluded_resources: Vec<String>,
}

impl DecisionPolicy {
    /// Policy for a pool, with its autoscaling overrides applied on top of
    /// the service defaults.
    pub fn for_pool(pool: &PoolConfig, defaults: &AutoscalingConfig) -> Self {
        let autoscaling = pool.autoscaling(defaults);
        Self {
            min_capacity: pool.min_capacity,
            max_capacity: pool.max_capacity,
            max_weight_to_add: pool.max_weight_to_add,
            max_weight_to_remove: pool.max_weight_to_remove,
            setpoint: autoscaling.setpoint,
            setpoint_margin: autoscaling.setpoint_margin,
            cpus_per_unit: pool.cpus_per_unit,
            excluded_resources: autoscaling.excluded_resources,
        }
    }
}

/// Observed state for one decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionInput {
    /// What the signal asked for; `None` when it declined or was unavailable.
    pub request: Option<SignalResourceRequest>,
    /// Sum of the groups' target capacities.
    pub current_total: u64,
    /// Capacity units actually running.
    pub fulfilled_capacity: u64,
    /// CPUs currently provided by the running capacity, when known.
    pub total_cpus: Option<f64>,
    /// Smoothed CPUs per unit from recent history, when known.
    pub historical_cpus_per_unit: Option<f64>,
    pub paused: bool,
    /// Recent capacity loss: never shrink this cycle.
    pub no_scale_down: bool,
}

/// What drove the desired total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingReason {
    Paused,
    /// The signal produced no request this cycle.
    NoRequest,
    /// The request says nothing about CPUs, or CPUs are excluded.
    NoCpuRequest,
    ZeroRequest,
    /// Non-zero request but nothing to convert CPUs into capacity units.
    ColdStart,
    WithinMargin,
    Setpoint,
}

impl ScalingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingReason::Paused => "paused",
            ScalingReason::NoRequest => "no_request",
            ScalingReason::NoCpuRequest => "no_cpu_request",
            ScalingReason::ZeroRequest => "zero_request",
            ScalingReason::ColdStart => "cold_start",
            ScalingReason::WithinMargin => "within_margin",
            ScalingReason::Setpoint => "setpoint",
        }
    }
}

impl fmt::Display for ScalingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed once per cycle, never mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingDecision {
    pub current_total: u64,
    /// Total implied by the signal before any bound was applied.
    pub desired_total: u64,
    pub clamped_total: u64,
    pub delta: i64,
    pub reason: ScalingReason,
    /// Utilization the request implies at the current capacity, when defined.
    pub utilization: Option<f64>,
    /// A rate limit or the capacity-loss guard cut the change short.
    pub rate_limited: bool,
}

impl ScalingDecision {
    fn unchanged(current_total: u64, reason: ScalingReason) -> Self {
        Self {
            current_total,
            desired_total: current_total,
            clamped_total: current_total,
            delta: 0,
            reason,
            utilization: None,
            rate_limited: false,
        }
    }

    pub fn is_scale_down(&self) -> bool {
        self.delta < 0
    }
}

/// Decide the pool's new total capacity. Pure: no I/O, no errors.
pub fn decide(policy: &DecisionPolicy, input: &DecisionInput) -> ScalingDecision {
    let current = input.current_total;
    if input.paused {
        return ScalingDecision::unchanged(current, ScalingReason::Paused);
    }
    let Some(request) = input.request.filter(|r| !r.is_empty()) else {
        return ScalingDecision::unchanged(current, ScalingReason::NoRequest);
    };

    let mut utilization = None;
    let (desired, reason) = if request.is_zero() {
        (0, ScalingReason::ZeroRequest)
    } else {
        let cpus = match request.cpus {
            Some(cpus) if !policy.excluded_resources.iter().any(|r| r == "cpus") => cpus,
            _ => return ScalingDecision::unchanged(current, ScalingReason::NoCpuRequest),
        };
        match cpus_per_unit(policy, input) {
            None => (current.saturating_add(1), ScalingReason::ColdStart),
            Some(factor) => {
                let capacity_cpus = current as f64 * factor;
                let target = to_units(cpus / policy.setpoint / factor);
                if capacity_cpus > 0.0 {
                    let util = cpus / capacity_cpus;
                    utilization = Some(util);
                    if (util - policy.setpoint).abs() <= policy.setpoint_margin {
                        (current, ScalingReason::WithinMargin)
                    } else {
                        (target, ScalingReason::Setpoint)
                    }
                } else {
                    // Empty pool: utilization is unbounded, always grow.
                    (target.max(1), ScalingReason::Setpoint)
                }
            }
        }
    };

    let bounded = desired.clamp(policy.min_capacity, policy.max_capacity.max(policy.min_capacity));
    let wanted = bounded as i128 - current as i128;
    let mut delta = wanted.clamp(
        -(policy.max_weight_to_remove as i128),
        policy.max_weight_to_add as i128,
    );
    if input.no_scale_down && delta < 0 {
        delta = 0;
    }
    let delta = delta as i64;
    let clamped_total = current.saturating_add_signed(delta);

    let decision = ScalingDecision {
        current_total: current,
        desired_total: desired,
        clamped_total,
        delta,
        reason,
        utilization,
        rate_limited: i128::from(delta) != wanted,
    };
    debug!(
        current,
        desired,
        clamped = clamped_total,
        delta,
        %reason,
        rate_limited = decision.rate_limited,
        "scaling decision"
    );
    decision
}

/// CPUs per capacity unit: observed, then configured, then historical.
fn cpus_per_unit(policy: &DecisionPolicy, input: &DecisionInput) -> Option<f64> {
    let observed = match input.total_cpus {
        Some(cpus) if cpus > 0.0 && input.fulfilled_capacity > 0 => {
            Some(cpus / input.fulfilled_capacity as f64)
        }
        _ => None,
    };
    observed
        .or(policy.cpus_per_unit)
        .or(input.historical_cpus_per_unit)
        .filter(|f| f.is_finite() && *f > 0.0)
}

fn to_units(value: f64) -> u64 {
    // Float-to-int `as` saturates and maps NaN to zero.
    value.round() as u64
}
