//! The per-pool scaling tick.
//!
//! One tick runs, in order: pause check, group reads, capacity-loss
//! observation, signal evaluation, the scaling decision, balancing, target
//! updates, and (when shrinking) candidate selection and removal.
//! Background ticks degrade gracefully and route failures to the right
//! owner; manual runs return every error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use poolscale_autoscale::{
    decide, historical_cpus_per_unit, DecisionInput, ScalingDecision, CPUS_TOTAL_METRIC,
    FULFILLED_CAPACITY_METRIC,
};
use poolscale_core::{
    MetricKind, PoolscaleConfig, ServiceConfig, SignalResourceRequest, TerminationReason,
};
use poolscale_pool::{
    balance, capacity_loss_suppresses, select, select_named, BalancePlan, DrainRequest,
    DrainSink, GroupState, GroupTarget, PoolError, ResourceGroupAdapter, Selection,
    SelectionPolicy, ShrinkingGroup, SimulatedGroupAdapter,
};
use poolscale_signal::collect_metrics;
use poolscale_state::{CapacityLossEvent, MetricSample, MetricsSource, PauseRecord, StateStore};

use crate::context::{PoolContext, PoolSettings, TickState};
use crate::error::{ControllerError, ControllerResult};
use crate::notify::{AppNotice, Notifier, TracingNotifier};
use crate::retry::RetryPolicy;
use crate::source::SignalFactory;

/// How far back an observed CPU total is still considered current.
const OBSERVED_CPUS_WINDOW_SECS: u64 = 10 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Scheduled tick: fall back where possible, notify instead of failing.
    Background,
    /// Operator-initiated: every failure is returned to the caller.
    Manual,
}

/// Which signal produced the request a tick acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOrigin {
    App,
    Default,
    /// Not consulted (paused pool).
    Skipped,
}

/// Outcome of one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub pool: String,
    pub decision: ScalingDecision,
    pub request: Option<SignalResourceRequest>,
    pub origin: SignalOrigin,
    pub plan: Option<BalancePlan>,
    pub selection: Selection,
    /// Instances handed to the drain queue or terminated.
    pub removed: Vec<String>,
    /// Groups whose last known state stood in for a failed read.
    pub partial_groups: Vec<String>,
    /// Instances that disappeared since the previous tick without this
    /// process removing them.
    pub lost_instances: usize,
    pub dry_run: bool,
}

/// Outcome of removing named instances outside a scale-down.
#[derive(Debug, Clone)]
pub struct EvictionReport {
    pub pool: String,
    pub reason: TerminationReason,
    pub selection: Selection,
    pub removed: Vec<String>,
    /// Requested ids that no group of the pool knows.
    pub unknown: Vec<String>,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub pool: String,
    pub paused: bool,
    pub target_capacity: u64,
    pub fulfilled_capacity: u64,
    pub groups: Vec<GroupState>,
    pub partial_groups: Vec<String>,
}

/// Every configured group, as far as it could be read.
#[derive(Debug, Default)]
struct GroupRead {
    /// Fresh reads and last known stand-ins, in configured order.
    groups: Vec<GroupState>,
    /// Groups whose read failed, in configured order.
    partial: Vec<String>,
    /// Failed groups never read before, with nothing to stand in for them.
    unknown: Vec<String>,
}

impl GroupRead {
    fn fresh_ids(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| !self.partial.contains(&g.id))
            .map(|g| g.id.clone())
            .collect()
    }
}

pub struct Controller {
    service: ServiceConfig,
    retry: RetryPolicy,
    store: StateStore,
    pools: BTreeMap<String, Arc<PoolContext>>,
    simulated: BTreeMap<String, SimulatedGroupAdapter>,
    signals: Arc<dyn SignalFactory>,
    notifier: Arc<dyn Notifier>,
    drain: Option<Arc<dyn DrainSink>>,
}

pub struct ControllerBuilder {
    config: PoolscaleConfig,
    store: StateStore,
    signals: Arc<dyn SignalFactory>,
    notifier: Arc<dyn Notifier>,
    drain: Option<Arc<dyn DrainSink>>,
    adapters: BTreeMap<String, Arc<dyn ResourceGroupAdapter>>,
}

impl ControllerBuilder {
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_drain(mut self, drain: Arc<dyn DrainSink>) -> Self {
        self.drain = Some(drain);
        self
    }

    /// Use `adapter` for `pool` instead of the simulated one.
    pub fn with_adapter(mut self, pool: &str, adapter: Arc<dyn ResourceGroupAdapter>) -> Self {
        self.adapters.insert(pool.to_string(), adapter);
        self
    }

    pub fn build(mut self) -> ControllerResult<Controller> {
        self.config.validate()?;
        let mut pools = BTreeMap::new();
        let mut simulated = BTreeMap::new();
        for pool in &self.config.pools {
            let settings = PoolSettings::new(pool, &self.config);
            let adapter = match self.adapters.remove(&pool.name) {
                Some(adapter) => adapter,
                None => {
                    let sim = SimulatedGroupAdapter::new(self.store.clone(), &pool.name);
                    ensure_simulated(&sim, &settings)?;
                    simulated.insert(pool.name.clone(), sim.clone());
                    Arc::new(sim) as Arc<dyn ResourceGroupAdapter>
                }
            };
            let context = PoolContext::new(settings, adapter, self.signals.as_ref());
            pools.insert(pool.name.clone(), Arc::new(context));
        }
        for unused in self.adapters.keys() {
            warn!(pool = %unused, "adapter given for a pool that is not configured");
        }
        info!(
            cluster = %self.config.service.cluster,
            pools = pools.len(),
            simulated = simulated.len(),
            "controller ready"
        );
        Ok(Controller {
            retry: RetryPolicy::from_service(&self.config.service),
            service: self.config.service,
            store: self.store,
            pools,
            simulated,
            signals: self.signals,
            notifier: self.notifier,
            drain: self.drain,
        })
    }
}

fn ensure_simulated(sim: &SimulatedGroupAdapter, settings: &PoolSettings) -> ControllerResult<()> {
    sim.ensure_groups(&settings.group_ids())
        .map_err(|source| PoolError::CloudApi {
            group: settings.pool.name.clone(),
            source,
        })?;
    Ok(())
}

impl Controller {
    pub fn builder(
        config: PoolscaleConfig,
        store: StateStore,
        signals: Arc<dyn SignalFactory>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            config,
            store,
            signals,
            notifier: Arc::new(TracingNotifier),
            drain: None,
            adapters: BTreeMap::new(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.service.cluster
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.keys().cloned().collect()
    }

    pub fn context(&self, pool: &str) -> ControllerResult<Arc<PoolContext>> {
        self.pools
            .get(pool)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownPool(pool.to_string()))
    }

    /// Adapters by pool, for the drain worker.
    pub fn adapters(&self) -> BTreeMap<String, Arc<dyn ResourceGroupAdapter>> {
        self.pools
            .iter()
            .map(|(name, ctx)| (name.clone(), ctx.adapter_arc()))
            .collect()
    }

    /// Time between background ticks of `pool`: its signal's period, else
    /// the service tick interval. Follows configuration reloads.
    pub async fn tick_interval(&self, pool: &str) -> ControllerResult<Duration> {
        let ctx = self.context(pool)?;
        let settings = ctx.settings().await;
        Ok(settings.tick_interval(self.service.tick_interval()))
    }

    // ── Ticks ──────────────────────────────────────────────────────

    /// One background tick. Failures are routed to their owners and the
    /// pool is retried on the next interval.
    pub async fn tick(&self, pool: &str) -> Option<TickReport> {
        match self.run_once(pool, RunMode::Background, false).await {
            Ok(report) => Some(report),
            Err(e) if e.is_throttled() => {
                debug!(pool, error = %e, "throttled, retrying next tick");
                None
            }
            Err(e) => {
                let page = e.service_page();
                error!(pool, %page, error = %e, "tick failed");
                self.notifier.page_service_owner(pool, page, &e.to_string());
                None
            }
        }
    }

    pub async fn run_once(
        &self,
        pool: &str,
        mode: RunMode,
        dry_run: bool,
    ) -> ControllerResult<TickReport> {
        let ctx = self.context(pool)?;
        let mut tick = ctx.lock_tick().await;
        let settings = ctx.settings().await;
        let now = epoch_secs();

        let paused = self.store.is_paused(self.cluster(), pool, now)?;
        let read = self.read_groups(&ctx, &settings, true).await;
        if !read.unknown.is_empty() {
            warn!(pool, groups = ?read.unknown, "groups never read, nothing to stand in for them");
            return Err(PoolError::PartialGroupState {
                groups: read.partial,
            }
            .into());
        }
        if !read.partial.is_empty() {
            if mode == RunMode::Manual || !self.service.proceed_on_partial_state {
                return Err(PoolError::PartialGroupState {
                    groups: read.partial,
                }
                .into());
            }
            warn!(pool, groups = ?read.partial, "proceeding with last known group state");
        }

        let autoscaling = &settings.autoscaling;
        let lost_instances = if autoscaling.prevent_scale_down_after_capacity_loss && !dry_run {
            self.observe_instances(&ctx, &read.fresh_ids(), &mut tick, now)
                .await?
        } else {
            0
        };

        let GroupRead {
            groups,
            partial: partial_groups,
            ..
        } = read;
        let current: Vec<GroupTarget> = groups
            .iter()
            .map(|g| GroupTarget::new(&g.id, g.target_capacity))
            .collect();
        let current_total: u64 = current.iter().map(|g| g.target).sum();
        let fulfilled: u64 = groups.iter().map(GroupState::fulfilled_capacity).sum();
        let policy = settings.decision_policy();

        if paused {
            let decision = decide(
                &policy,
                &DecisionInput {
                    current_total,
                    fulfilled_capacity: fulfilled,
                    paused: true,
                    ..Default::default()
                },
            );
            info!(pool, "autoscaling paused");
            return Ok(TickReport {
                pool: pool.to_string(),
                decision,
                request: None,
                origin: SignalOrigin::Skipped,
                plan: None,
                selection: Selection::default(),
                removed: vec![],
                partial_groups,
                lost_instances,
                dry_run,
            });
        }

        let (request, origin) = self.resolve_signal(&ctx, &settings, mode, now).await?;

        let total_cpus = observed_total_cpus(&self.store, pool, now)?;
        let historical = if total_cpus.is_none() && settings.pool.cpus_per_unit.is_none() {
            historical_cpus_per_unit(&self.store, pool, now)?
        } else {
            None
        };
        let no_scale_down = if autoscaling.prevent_scale_down_after_capacity_loss {
            let since = now.saturating_sub(autoscaling.capacity_loss_window().as_secs());
            let lost = self.store.list_capacity_loss_since(pool, since)?.len();
            capacity_loss_suppresses(true, lost, autoscaling.instance_loss_threshold)
        } else {
            false
        };

        let decision = decide(
            &policy,
            &DecisionInput {
                request,
                current_total,
                fulfilled_capacity: fulfilled,
                total_cpus,
                historical_cpus_per_unit: historical,
                paused: false,
                no_scale_down,
            },
        );

        let plan = balance(
            pool,
            &current,
            decision.clamped_total,
            settings.pool.remainder_policy,
        )?;
        self.apply_targets(&ctx, &current, &plan, dry_run).await?;

        let mut selection = Selection {
            suppressed: no_scale_down,
            ..Selection::default()
        };
        let mut removed = Vec::new();
        if decision.is_scale_down() {
            selection = self
                .select_candidates(&ctx, &settings, &groups, &plan, no_scale_down)
                .await?;
            if !dry_run {
                removed = self.remove(&ctx, &settings, &selection, &mut tick).await?;
            }
        }

        if !dry_run {
            self.record_capacity(pool, &settings, fulfilled, total_cpus, now)?;
        }

        info!(
            pool,
            origin = ?origin,
            current = decision.current_total,
            target = decision.clamped_total,
            delta = decision.delta,
            reason = %decision.reason,
            removed = removed.len(),
            lost_instances,
            dry_run,
            "tick complete"
        );
        Ok(TickReport {
            pool: pool.to_string(),
            decision,
            request,
            origin,
            plan: Some(plan),
            selection,
            removed,
            partial_groups,
            lost_instances,
            dry_run,
        })
    }

    /// Ask the pool's signal for a request without acting on it. The
    /// application signal is used when configured; errors are returned.
    pub async fn evaluate_signal(&self, pool: &str) -> ControllerResult<Option<SignalResourceRequest>> {
        let ctx = self.context(pool)?;
        let settings = ctx.settings().await;
        let (request, _) = self
            .resolve_signal(&ctx, &settings, RunMode::Manual, epoch_secs())
            .await?;
        Ok(request)
    }

    /// Fresh provider reads checked against the group book. Never waits for
    /// a running tick and changes nothing.
    pub async fn status(&self, pool: &str) -> ControllerResult<PoolStatus> {
        let ctx = self.context(pool)?;
        let settings = ctx.settings().await;
        let read = self.read_groups(&ctx, &settings, false).await;
        Ok(PoolStatus {
            pool: pool.to_string(),
            paused: self.store.is_paused(self.cluster(), pool, epoch_secs())?,
            target_capacity: read.groups.iter().map(|g| g.target_capacity).sum(),
            fulfilled_capacity: read.groups.iter().map(GroupState::fulfilled_capacity).sum(),
            groups: read.groups,
            partial_groups: read.partial,
        })
    }

    /// Remove specific instances for a reason other than scaling down, such
    /// as a spot interruption notice or a host migration. Group targets stay
    /// as they are. Non-evictable instances are only taken on a spot
    /// interruption.
    pub async fn evict(
        &self,
        pool: &str,
        instance_ids: &[String],
        reason: TerminationReason,
    ) -> ControllerResult<EvictionReport> {
        let ctx = self.context(pool)?;
        let mut tick = ctx.lock_tick().await;
        let settings = ctx.settings().await;
        let adapter = ctx.adapter();

        let mut instances = Vec::new();
        for id in settings.group_ids() {
            let group_id: &str = &id;
            let listed = self
                .retry
                .run("list_instances", move || adapter.list_instances(group_id))
                .await
                .map_err(|source| PoolError::CloudApi {
                    group: id.clone(),
                    source,
                })?;
            instances.extend(listed);
        }

        let (selection, unknown) = select_named(pool, &instances, instance_ids, reason);
        if !unknown.is_empty() {
            warn!(pool, instances = ?unknown, "not found in any group");
        }
        let removed = self.remove(&ctx, &settings, &selection, &mut tick).await?;
        info!(
            pool,
            %reason,
            removed = removed.len(),
            blocked = selection.blocked.len(),
            "instances evicted"
        );
        Ok(EvictionReport {
            pool: pool.to_string(),
            reason,
            selection,
            removed,
            unknown,
        })
    }

    // ── Pausing ────────────────────────────────────────────────────

    /// Pause autoscaling for `pool`, until `until` if given.
    pub fn pause(&self, pool: &str, until: Option<u64>) -> ControllerResult<()> {
        self.context(pool)?;
        self.store.put_pause(&PauseRecord {
            cluster: self.cluster().to_string(),
            pool: pool.to_string(),
            paused_at: epoch_secs(),
            until,
        })?;
        info!(pool, ?until, "autoscaling paused");
        Ok(())
    }

    /// Returns whether a pause was lifted.
    pub fn resume(&self, pool: &str) -> ControllerResult<bool> {
        self.context(pool)?;
        let resumed = self.store.delete_pause(self.cluster(), pool)?;
        info!(pool, resumed, "autoscaling resumed");
        Ok(resumed)
    }

    // ── Configuration ──────────────────────────────────────────────

    /// Swap a new configuration into the running pools. Pools are created
    /// and removed only at startup; such changes are logged and skipped.
    pub async fn apply_config(&self, config: &PoolscaleConfig) -> ControllerResult<()> {
        config.validate()?;
        for pool in &config.pools {
            let Some(ctx) = self.pools.get(&pool.name) else {
                warn!(pool = %pool.name, "new pool needs a restart to take effect");
                continue;
            };
            let settings = PoolSettings::new(pool, config);
            if let Some(sim) = self.simulated.get(&pool.name) {
                ensure_simulated(sim, &settings)?;
            }
            ctx.apply_config(settings, self.signals.as_ref()).await?;
        }
        for name in self.pools.keys() {
            if config.pool(name).is_err() {
                warn!(pool = %name, "removed pool keeps running until restart");
            }
        }
        info!(pools = config.pools.len(), "configuration applied");
        Ok(())
    }

    /// Stop all signal workers.
    pub async fn shutdown(&self) {
        for ctx in self.pools.values() {
            ctx.close().await;
        }
    }

    // ── Tick steps ─────────────────────────────────────────────────

    /// Read every configured group. Failed reads fall back to the last
    /// known state; groups never read before are left out and listed as
    /// unknown. With `record` the book keeps the fresh reads.
    async fn read_groups(
        &self,
        ctx: &PoolContext,
        settings: &PoolSettings,
        record: bool,
    ) -> GroupRead {
        let adapter = ctx.adapter();
        let book = ctx.book();
        let mut read = GroupRead::default();
        for id in settings.group_ids() {
            let group_id: &str = &id;
            match self
                .retry
                .run("get_status", move || adapter.get_status(group_id))
                .await
            {
                Ok(status) => {
                    let mut state = GroupState::from_status(&id, status);
                    if book.is_stale(&id, state.target_capacity) {
                        state.is_stale = true;
                        if record {
                            warn!(
                                pool = %ctx.name(),
                                group = %id,
                                applied = ?book.last_applied.get(&id),
                                observed = state.target_capacity,
                                "group target changed outside the autoscaler"
                            );
                        }
                    }
                    if record {
                        ctx.record_known(&state);
                    }
                    read.groups.push(state);
                }
                Err(e) => {
                    warn!(pool = %ctx.name(), group = %id, error = %e, "group state unavailable");
                    match book.last_known.get(&id) {
                        Some(known) => read.groups.push(known.clone()),
                        None => read.unknown.push(id.clone()),
                    }
                    read.partial.push(id.clone());
                }
            }
        }
        read
    }

    /// List the instances of freshly read groups and record every instance
    /// that vanished since the last listing without this process removing
    /// it. Returns how many were lost.
    async fn observe_instances(
        &self,
        ctx: &PoolContext,
        group_ids: &[String],
        tick: &mut TickState,
        now: u64,
    ) -> ControllerResult<usize> {
        let pool = ctx.name();
        let adapter = ctx.adapter();
        let mut lost = 0;
        for id in group_ids {
            let group_id: &str = id;
            let current: BTreeSet<String> = match self
                .retry
                .run("list_instances", move || adapter.list_instances(group_id))
                .await
            {
                Ok(instances) => instances.into_iter().map(|i| i.id).collect(),
                Err(e) => {
                    warn!(pool, group = %id, error = %e, "instances unavailable, capacity loss not checked");
                    tick.instances.remove(id);
                    continue;
                }
            };
            if let Some(previous) = tick.instances.get(id) {
                for gone in previous.difference(&current) {
                    if tick.removing.remove(gone) {
                        continue;
                    }
                    self.store.record_capacity_loss(&CapacityLossEvent {
                        pool: pool.to_string(),
                        group_id: id.clone(),
                        instance_id: gone.clone(),
                        timestamp: now,
                    })?;
                    lost += 1;
                }
            }
            tick.instances.insert(id.clone(), current);
        }

        // Removals no listing still shows can never be matched.
        let seen: BTreeSet<&String> = tick.instances.values().flatten().collect();
        tick.removing.retain(|id| seen.contains(id));

        if lost > 0 {
            warn!(pool, lost, "instances lost outside the autoscaler");
        }
        Ok(lost)
    }

    async fn resolve_signal(
        &self,
        ctx: &PoolContext,
        settings: &PoolSettings,
        mode: RunMode,
        now: u64,
    ) -> ControllerResult<(Option<SignalResourceRequest>, SignalOrigin)> {
        let pool = ctx.name();
        let app = settings.pool.app();

        if let Some(config) = &settings.pool.signal
            && let Some(source) = ctx.app_signal().await
        {
            let metrics = collect_metrics(&self.store, config, pool, app, now)?;
            match source.evaluate(&metrics).await {
                Ok(request) => return Ok((request, SignalOrigin::App)),
                Err(e) if mode == RunMode::Manual => return Err(e.into()),
                Err(e) => {
                    let notice = if e.is_configuration_failure() {
                        AppNotice::SignalConfigurationFailed
                    } else {
                        AppNotice::SignalEvaluationFailed
                    };
                    warn!(pool, app, %notice, error = %e, "application signal failed, using default signal");
                    self.notifier
                        .notify_app_owner(pool, app, notice, &e.to_string());
                }
            }
        }

        let metrics = collect_metrics(&self.store, &settings.default_signal, pool, app, now)?;
        let request = ctx.default_signal().evaluate(&metrics).await?;
        Ok((request, SignalOrigin::Default))
    }

    /// Request every changed target. Each group is booked as applied as
    /// soon as its own request succeeds, so a failure part way through
    /// leaves no group looking modified from outside.
    async fn apply_targets(
        &self,
        ctx: &PoolContext,
        current: &[GroupTarget],
        plan: &BalancePlan,
        dry_run: bool,
    ) -> ControllerResult<()> {
        if !dry_run {
            for (old, new) in current.iter().zip(&plan.targets) {
                if old.target == new.target {
                    ctx.record_applied(&new.group_id, new.target);
                }
            }
        }
        let adapter = ctx.adapter();
        for (group, from, to) in plan.changes(current) {
            self.retry
                .run("modify_target_capacity", move || {
                    adapter.modify_target_capacity(group, to, dry_run)
                })
                .await
                .map_err(|source| PoolError::CloudApi {
                    group: group.to_string(),
                    source,
                })?;
            if !dry_run {
                ctx.record_applied(group, to);
            }
            debug!(pool = %ctx.name(), group, from, to, dry_run, "target requested");
        }
        Ok(())
    }

    async fn select_candidates(
        &self,
        ctx: &PoolContext,
        settings: &PoolSettings,
        groups: &[GroupState],
        plan: &BalancePlan,
        suppress: bool,
    ) -> ControllerResult<Selection> {
        let adapter = ctx.adapter();
        let mut shrinking = Vec::new();
        for (state, target) in groups.iter().zip(&plan.targets) {
            if target.target >= state.fulfilled_capacity() {
                continue;
            }
            let group_id: &str = &state.id;
            let instances = self
                .retry
                .run("list_instances", move || adapter.list_instances(group_id))
                .await
                .map_err(|source| PoolError::CloudApi {
                    group: state.id.clone(),
                    source,
                })?
                .into_iter()
                .map(|mut instance| {
                    instance.is_stale |= state.is_stale;
                    instance
                })
                .collect();
            shrinking.push(ShrinkingGroup {
                group_id: state.id.clone(),
                new_target: target.target,
                instances,
                is_stale: state.is_stale,
            });
        }
        let policy = SelectionPolicy {
            order: settings.pool.termination_order,
            reason: TerminationReason::ScalingDown,
            max_weight_to_remove: settings.pool.max_weight_to_remove,
            max_tasks_to_kill: settings.pool.max_tasks_to_kill,
            suppress,
        };
        Ok(select(ctx.name(), &shrinking, &policy))
    }

    /// Drain or terminate the selected candidates. Everything handed off is
    /// remembered so its disappearance is not taken for capacity loss.
    async fn remove(
        &self,
        ctx: &PoolContext,
        settings: &PoolSettings,
        selection: &Selection,
        tick: &mut TickState,
    ) -> ControllerResult<Vec<String>> {
        let pool = ctx.name();
        if selection.candidates.is_empty() {
            return Ok(vec![]);
        }

        if settings.pool.draining_enabled
            && let Some(drain) = &self.drain
        {
            let mut submitted = Vec::new();
            for candidate in &selection.candidates {
                drain.submit(DrainRequest {
                    pool: pool.to_string(),
                    instance_id: candidate.instance_id.clone(),
                    group_id: candidate.group_id.clone(),
                    reason: candidate.reason,
                })?;
                tick.removing.insert(candidate.instance_id.clone());
                submitted.push(candidate.instance_id.clone());
            }
            info!(pool, instances = submitted.len(), "instances queued for draining");
            return Ok(submitted);
        }

        let mut by_group: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for candidate in &selection.candidates {
            by_group
                .entry(candidate.group_id.as_str())
                .or_default()
                .push(candidate.instance_id.clone());
        }
        let adapter = ctx.adapter();
        let mut terminated = Vec::new();
        for (group, ids) in &by_group {
            let group: &str = group;
            let ids: &[String] = ids;
            let outcome = self
                .retry
                .run("terminate_instances", move || {
                    adapter.terminate_instances(group, ids)
                })
                .await
                .map_err(|source| PoolError::CloudApi {
                    group: group.to_string(),
                    source,
                })?;
            if !outcome.is_complete() {
                warn!(pool, group, failed = ?outcome.failed, "some instances were not terminated");
            }
            tick.removing.extend(outcome.terminated.iter().cloned());
            terminated.extend(outcome.terminated);
        }
        Ok(terminated)
    }

    /// Remember what the pool looked like so an emptied pool can be sized
    /// from history later.
    fn record_capacity(
        &self,
        pool: &str,
        settings: &PoolSettings,
        fulfilled: u64,
        total_cpus: Option<f64>,
        now: u64,
    ) -> ControllerResult<()> {
        let mut samples = vec![MetricSample {
            kind: MetricKind::Metadata,
            scope: pool.to_string(),
            name: FULFILLED_CAPACITY_METRIC.to_string(),
            timestamp: now,
            value: fulfilled as f64,
        }];
        let cpus = total_cpus.or_else(|| settings.pool.cpus_per_unit.map(|f| f * fulfilled as f64));
        if let Some(cpus) = cpus {
            samples.push(MetricSample {
                kind: MetricKind::Metadata,
                scope: pool.to_string(),
                name: CPUS_TOTAL_METRIC.to_string(),
                timestamp: now,
                value: cpus,
            });
        }
        self.store.put_metrics(&samples)?;
        Ok(())
    }
}

/// Latest CPU total reported for the pool by the metrics collector.
fn observed_total_cpus(store: &StateStore, pool: &str, now: u64) -> ControllerResult<Option<f64>> {
    let series = store.get_metric_values(
        CPUS_TOTAL_METRIC,
        MetricKind::System,
        pool,
        now.saturating_sub(OBSERVED_CPUS_WINDOW_SECS),
        now,
    )?;
    Ok(series.last().map(|&(_, value)| value))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
