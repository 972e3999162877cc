//! Choosing which instances leave a shrinking pool.
//!
//! Only groups whose new target is below their fulfilled capacity give up
//! instances, and never more than that gap. Stale groups (modified outside
//! the autoscaler) are drawn from before the others, so they take the
//! pool-wide budget first. Within a group, stale instances go first, then
//! the configured [`TerminationOrder`], then instance id.
//!
//! [`select_named`] covers removals that are not a scale-down: the caller
//! names the instances and only the eviction rules apply.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use poolscale_core::{InstanceInfo, TerminationOrder, TerminationReason};

use crate::error::CriticalWorkloadError;

/// One group taking part in a scale-down.
#[derive(Debug, Clone)]
pub struct ShrinkingGroup {
    pub group_id: String,
    pub new_target: u64,
    pub instances: Vec<InstanceInfo>,
    /// The group's target was changed outside the autoscaler.
    pub is_stale: bool,
}

impl ShrinkingGroup {
    pub fn fulfilled_capacity(&self) -> u64 {
        self.instances.iter().map(|i| i.weight).sum()
    }

    /// Capacity above the new target.
    pub fn excess(&self) -> u64 {
        self.fulfilled_capacity().saturating_sub(self.new_target)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    pub order: TerminationOrder,
    pub reason: TerminationReason,
    /// Pool-wide weight budget for this cycle.
    pub max_weight_to_remove: u64,
    pub max_tasks_to_kill: Option<u64>,
    /// Recent capacity loss: select nothing this cycle.
    pub suppress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationCandidate {
    pub instance_id: String,
    pub group_id: String,
    pub weight: u64,
    pub task_count: u32,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub candidates: Vec<TerminationCandidate>,
    /// Instances that would have been picked but must not be evicted.
    pub blocked: Vec<CriticalWorkloadError>,
    pub suppressed: bool,
}

impl Selection {
    pub fn total_weight(&self) -> u64 {
        self.candidates.iter().map(|c| c.weight).sum()
    }
}

/// Whether observed capacity loss should stop scale-down this cycle.
pub fn capacity_loss_suppresses(enabled: bool, lost_instances: usize, threshold: u32) -> bool {
    enabled && lost_instances > threshold as usize
}

/// Whether `instance` may be removed for `reason`. A spot interruption
/// takes the instance regardless of what it runs.
pub fn evictable(instance: &InstanceInfo, reason: TerminationReason) -> bool {
    !instance.non_evictable || reason == TerminationReason::SpotInterruption
}

/// Ranking used within a group; `Less` is removed first.
pub fn compare_for_removal(
    a: &InstanceInfo,
    b: &InstanceInfo,
    order: TerminationOrder,
) -> Ordering {
    let by_order = match order {
        TerminationOrder::HighestUptime => a.launched_at.cmp(&b.launched_at),
        TerminationOrder::FewestTasks => a.task_count.cmp(&b.task_count),
        TerminationOrder::ZoneThenId => a.availability_zone.cmp(&b.availability_zone),
    };
    b.is_stale
        .cmp(&a.is_stale)
        .then(by_order)
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick removal candidates across `groups` under `policy`.
pub fn select(pool: &str, groups: &[ShrinkingGroup], policy: &SelectionPolicy) -> Selection {
    if policy.suppress {
        info!(pool, "recent capacity loss, scale-down suppressed");
        return Selection {
            suppressed: true,
            ..Selection::default()
        };
    }

    let mut selection = Selection::default();
    let mut weight_left = policy.max_weight_to_remove;
    let mut tasks_left = policy.max_tasks_to_kill;

    let mut ordered: Vec<&ShrinkingGroup> = groups.iter().collect();
    ordered.sort_by_key(|g| !g.is_stale);

    for group in ordered {
        let mut excess = group.excess();
        if excess == 0 {
            continue;
        }
        let mut ranked: Vec<&InstanceInfo> = group.instances.iter().collect();
        ranked.sort_by(|a, b| compare_for_removal(a, b, policy.order));

        for instance in ranked {
            if excess == 0 || weight_left == 0 {
                break;
            }
            // Removing it would take the group below its target.
            if instance.weight > excess || instance.weight > weight_left {
                continue;
            }
            if let Some(left) = tasks_left
                && u64::from(instance.task_count) > left
            {
                continue;
            }
            if !evictable(instance, policy.reason) {
                warn!(pool, group = %group.group_id, instance = %instance.id, "non-evictable workload, skipping");
                selection.blocked.push(CriticalWorkloadError {
                    instance_id: instance.id.clone(),
                    group_id: group.group_id.clone(),
                });
                continue;
            }

            excess -= instance.weight;
            weight_left -= instance.weight;
            if let Some(left) = tasks_left.as_mut() {
                *left -= u64::from(instance.task_count);
            }
            selection.candidates.push(TerminationCandidate {
                instance_id: instance.id.clone(),
                group_id: group.group_id.clone(),
                weight: instance.weight,
                task_count: instance.task_count,
                reason: policy.reason,
            });
        }
        debug!(
            pool,
            group = %group.group_id,
            target = group.new_target,
            remaining_excess = excess,
            "group candidates selected"
        );
    }
    selection
}

/// Candidates for removing exactly the instances in `ids` for `reason`.
///
/// Ids not found among `instances` are returned separately. Group targets
/// are left alone: the group replaces what it loses.
pub fn select_named(
    pool: &str,
    instances: &[InstanceInfo],
    ids: &[String],
    reason: TerminationReason,
) -> (Selection, Vec<String>) {
    let mut selection = Selection::default();
    let mut unknown = Vec::new();
    for id in ids {
        let Some(instance) = instances.iter().find(|i| &i.id == id) else {
            unknown.push(id.clone());
            continue;
        };
        if !evictable(instance, reason) {
            warn!(pool, group = %instance.group_id, instance = %instance.id, %reason, "non-evictable workload, skipping");
            selection.blocked.push(CriticalWorkloadError {
                instance_id: instance.id.clone(),
                group_id: instance.group_id.clone(),
            });
            continue;
        }
        selection.candidates.push(TerminationCandidate {
            instance_id: instance.id.clone(),
            group_id: instance.group_id.clone(),
            weight: instance.weight,
            task_count: instance.task_count,
            reason,
        });
    }
    (selection, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolscale_core::InstanceMarket;

    fn instance(id: &str, launched_at: u64, tasks: u32, zone: &str) -> InstanceInfo {
        InstanceInfo {
            id: id.to_string(),
            group_id: "sfr-1".to_string(),
            weight: 1,
            launched_at,
            task_count: tasks,
            availability_zone: zone.to_string(),
            market: InstanceMarket::Spot,
            non_evictable: false,
            is_stale: false,
        }
    }

    fn policy(order: TerminationOrder) -> SelectionPolicy {
        SelectionPolicy {
            order,
            reason: TerminationReason::ScalingDown,
            max_weight_to_remove: 100,
            max_tasks_to_kill: None,
            suppress: false,
        }
    }

    fn group(new_target: u64, instances: Vec<InstanceInfo>) -> ShrinkingGroup {
        ShrinkingGroup {
            group_id: "sfr-1".to_string(),
            new_target,
            instances,
            is_stale: false,
        }
    }

    fn ids(selection: &Selection) -> Vec<&str> {
        selection.candidates.iter().map(|c| c.instance_id.as_str()).collect()
    }

    fn fleet() -> Vec<InstanceInfo> {
        vec![
            instance("i-a", 300, 5, "zone-b"),
            instance("i-b", 100, 9, "zone-c"),
            instance("i-c", 200, 1, "zone-a"),
            instance("i-d", 100, 1, "zone-a"),
        ]
    }

    #[test]
    fn highest_uptime_first() {
        let sel = select("batch", &[group(2, fleet())], &policy(TerminationOrder::HighestUptime));
        // i-b and i-d launched together; id breaks the tie.
        assert_eq!(ids(&sel), vec!["i-b", "i-d"]);
        assert!(sel.candidates.iter().all(|c| c.reason == TerminationReason::ScalingDown));
    }

    #[test]
    fn fewest_tasks_first() {
        let sel = select("batch", &[group(2, fleet())], &policy(TerminationOrder::FewestTasks));
        assert_eq!(ids(&sel), vec!["i-c", "i-d"]);
    }

    #[test]
    fn zone_then_id() {
        let sel = select("batch", &[group(1, fleet())], &policy(TerminationOrder::ZoneThenId));
        assert_eq!(ids(&sel), vec!["i-c", "i-d", "i-a"]);
    }

    #[test]
    fn stale_instances_go_first() {
        let mut instances = fleet();
        instances[0].is_stale = true;
        let sel = select("batch", &[group(3, instances)], &policy(TerminationOrder::HighestUptime));
        assert_eq!(ids(&sel), vec!["i-a"]);
    }

    #[test]
    fn never_below_group_target() {
        let mut instances = fleet();
        instances[1].weight = 3; // i-b
        // Fulfilled 6, target 4: i-b (weight 3) would overshoot.
        let sel = select("batch", &[group(4, instances)], &policy(TerminationOrder::HighestUptime));
        assert_eq!(ids(&sel), vec!["i-d", "i-c"]);
        assert_eq!(sel.total_weight(), 2);
    }

    #[test]
    fn nothing_to_remove_at_or_below_target() {
        let sel = select("batch", &[group(4, fleet())], &policy(TerminationOrder::HighestUptime));
        assert!(sel.candidates.is_empty());
        let sel = select("batch", &[group(10, fleet())], &policy(TerminationOrder::HighestUptime));
        assert!(sel.candidates.is_empty());
    }

    #[test]
    fn non_evictable_blocked_unless_spot_interruption() {
        let mut instances = fleet();
        instances[1].non_evictable = true; // i-b, first by uptime
        let sel = select(
            "batch",
            &[group(2, instances.clone())],
            &policy(TerminationOrder::HighestUptime),
        );
        assert_eq!(ids(&sel), vec!["i-d", "i-c"]);
        assert_eq!(
            sel.blocked,
            vec![CriticalWorkloadError {
                instance_id: "i-b".to_string(),
                group_id: "sfr-1".to_string(),
            }]
        );

        let mut spot = policy(TerminationOrder::HighestUptime);
        spot.reason = TerminationReason::SpotInterruption;
        let sel = select("batch", &[group(2, instances)], &spot);
        assert_eq!(ids(&sel), vec!["i-b", "i-d"]);
        assert!(sel.blocked.is_empty());
        assert!(sel.candidates.iter().all(|c| c.reason == TerminationReason::SpotInterruption));
    }

    #[test]
    fn suppressed_selection_is_empty() {
        let mut p = policy(TerminationOrder::HighestUptime);
        p.suppress = true;
        let sel = select("batch", &[group(0, fleet())], &p);
        assert!(sel.candidates.is_empty());
        assert!(sel.suppressed);
    }

    #[test]
    fn pool_wide_budgets() {
        let mut p = policy(TerminationOrder::HighestUptime);
        p.max_weight_to_remove = 1;
        let groups = [group(0, fleet()), group(0, fleet())];
        assert_eq!(select("batch", &groups, &p).candidates.len(), 1);

        let mut p = policy(TerminationOrder::FewestTasks);
        p.max_tasks_to_kill = Some(6);
        // i-c (1) + i-d (1) + i-a (5) would be 7: i-a is skipped.
        let sel = select("batch", &[group(0, fleet())], &p);
        assert_eq!(ids(&sel), vec!["i-c", "i-d"]);
    }

    #[test]
    fn stale_groups_take_the_budget_first() {
        let mut p = policy(TerminationOrder::HighestUptime);
        p.max_weight_to_remove = 2;
        let fresh = group(0, fleet());
        let mut stale = group(0, vec![instance("j-a", 500, 0, "zone-a"), instance("j-b", 600, 0, "zone-b")]);
        stale.group_id = "asg-1".to_string();
        stale.is_stale = true;

        let sel = select("batch", &[fresh, stale], &p);
        assert_eq!(ids(&sel), vec!["j-a", "j-b"]);
        assert!(sel.candidates.iter().all(|c| c.group_id == "asg-1"));
    }

    #[test]
    fn named_selection_respects_eviction_rules() {
        let mut instances = fleet();
        instances[1].non_evictable = true; // i-b
        let wanted = vec!["i-a".to_string(), "i-b".to_string(), "i-zz".to_string()];

        let (sel, unknown) =
            select_named("batch", &instances, &wanted, TerminationReason::NodeMigration);
        assert_eq!(ids(&sel), vec!["i-a"]);
        assert_eq!(sel.blocked.len(), 1);
        assert_eq!(sel.blocked[0].instance_id, "i-b");
        assert_eq!(unknown, vec!["i-zz"]);
        assert!(sel.candidates.iter().all(|c| c.reason == TerminationReason::NodeMigration));

        let (sel, _) =
            select_named("batch", &instances, &wanted, TerminationReason::SpotInterruption);
        assert_eq!(ids(&sel), vec!["i-a", "i-b"]);
        assert!(sel.blocked.is_empty());
    }

    #[test]
    fn capacity_loss_threshold() {
        assert!(!capacity_loss_suppresses(false, 10, 0));
        assert!(!capacity_loss_suppresses(true, 2, 2));
        assert!(capacity_loss_suppresses(true, 3, 2));
    }
}
