//! Max-min-fair distribution of a pool's total capacity across its groups.
//!
//! Progressive filling: compute the fair share of what is left, pin every
//! group already on the far side of it (at or above the share when growing,
//! at or below it when shrinking), and repeat with the rest. When nothing
//! pins, the remaining groups split what is left evenly. Pinned groups keep
//! their current target, so no group ever moves against the direction of
//! the overall change.
//!
//! All arithmetic is on integers: `target >= share` is evaluated as
//! `target * n >= remaining`, and the final split hands out `remaining / n`
//! plus one leftover unit each to `remaining % n` groups chosen by the
//! [`RemainderPolicy`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use poolscale_core::RemainderPolicy;

use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTarget {
    pub group_id: String,
    pub target: u64,
}

impl GroupTarget {
    pub fn new(group_id: &str, target: u64) -> Self {
        Self {
            group_id: group_id.to_string(),
            target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// New targets for every group, in input order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancePlan {
    pub direction: Direction,
    pub targets: Vec<GroupTarget>,
    /// Groups left at their current target by pinning.
    pub pinned: Vec<String>,
}

impl BalancePlan {
    pub fn total(&self) -> u64 {
        self.targets.iter().map(|t| t.target).sum()
    }

    /// Groups whose target changes, with `(old, new)`.
    pub fn changes<'a>(&'a self, current: &'a [GroupTarget]) -> impl Iterator<Item = (&'a str, u64, u64)> + 'a {
        current
            .iter()
            .zip(&self.targets)
            .filter(|(old, new)| old.target != new.target)
            .map(|(old, new)| (new.group_id.as_str(), old.target, new.target))
    }
}

/// Distribute `clamped_total` over `current`, in `current`'s order.
pub fn balance(
    pool: &str,
    current: &[GroupTarget],
    clamped_total: u64,
    policy: RemainderPolicy,
) -> PoolResult<BalancePlan> {
    let current_total: u64 = current.iter().map(|g| g.target).sum();
    let direction = if clamped_total >= current_total {
        Direction::Up
    } else {
        Direction::Down
    };
    if current.is_empty() {
        if clamped_total > 0 {
            return Err(PoolError::NoResourceGroups(pool.to_string()));
        }
        return Ok(BalancePlan {
            direction,
            targets: vec![],
            pinned: vec![],
        });
    }

    let mut remaining: Vec<usize> = (0..current.len()).collect();
    let mut remaining_target = clamped_total;
    let mut new_targets: Vec<u64> = current.iter().map(|g| g.target).collect();
    let mut pinned = Vec::new();

    while !remaining.is_empty() {
        let n = remaining.len() as u128;
        let total = u128::from(remaining_target);
        let (pin, rest): (Vec<usize>, Vec<usize>) = remaining.iter().partition(|&&i| {
            let scaled = u128::from(current[i].target) * n;
            match direction {
                Direction::Up => scaled >= total,
                Direction::Down => scaled <= total,
            }
        });

        if pin.is_empty() {
            fill_evenly(current, &rest, remaining_target, direction, policy, &mut new_targets);
            break;
        }
        for &i in &pin {
            remaining_target = remaining_target.saturating_sub(current[i].target);
            pinned.push(current[i].group_id.clone());
        }
        remaining = rest;
    }

    let targets: Vec<GroupTarget> = current
        .iter()
        .zip(new_targets)
        .map(|(g, target)| GroupTarget::new(&g.group_id, target))
        .collect();
    debug!(
        pool,
        ?direction,
        from = current_total,
        to = clamped_total,
        pinned = pinned.len(),
        "groups balanced"
    );
    Ok(BalancePlan {
        direction,
        targets,
        pinned,
    })
}

fn fill_evenly(
    current: &[GroupTarget],
    groups: &[usize],
    total: u64,
    direction: Direction,
    policy: RemainderPolicy,
    out: &mut [u64],
) {
    let n = groups.len() as u64;
    let base = total / n;
    let leftover = (total % n) as usize;

    let mut order: Vec<usize> = groups.to_vec();
    if policy == RemainderPolicy::LowestTargetFirst {
        // Stable: ties keep group order.
        order.sort_by_key(|&i| current[i].target);
    }
    for (rank, &i) in order.iter().enumerate() {
        out[i] = base + u64::from(rank < leftover);
    }
    debug!(groups = n, base, leftover, ?direction, "fair share assigned");
}
