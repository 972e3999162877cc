//! Everything one pool's tick needs, owned per pool.
//!
//! A `PoolContext` is handed to each tick explicitly. Its tick lock keeps
//! two ticks of the same pool from overlapping and guards the bookkeeping
//! only ticks use (instances seen, removals in flight). The group book (last
//! applied targets, last known states) is written by the tick holder and
//! read by anyone as a copy, so status reads never wait for a tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::info;

use poolscale_autoscale::DecisionPolicy;
use poolscale_core::{AutoscalingConfig, PoolConfig, PoolscaleConfig, SignalConfig};
use poolscale_pool::{GroupState, ResourceGroupAdapter};

use crate::error::ControllerResult;
use crate::source::{SignalFactory, SignalSource};

/// Effective configuration of one pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool: PoolConfig,
    /// Service defaults with the pool's overrides applied.
    pub autoscaling: AutoscalingConfig,
    pub default_signal: SignalConfig,
}

impl PoolSettings {
    pub fn new(pool: &PoolConfig, config: &PoolscaleConfig) -> Self {
        Self {
            pool: pool.clone(),
            autoscaling: pool.autoscaling(&config.autoscaling),
            default_signal: config.service.default_signal.clone(),
        }
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.pool.resource_groups.iter().map(|g| g.id.clone()).collect()
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy::for_pool(&self.pool, &self.autoscaling)
    }

    pub fn tick_interval(&self, fallback: Duration) -> Duration {
        self.pool.tick_interval(&self.default_signal, fallback)
    }
}

/// What the autoscaler knows about a pool's groups.
#[derive(Debug, Clone, Default)]
pub struct GroupBook {
    /// Targets this process last set, per group.
    pub last_applied: BTreeMap<String, u64>,
    /// Most recent successful read, per group.
    pub last_known: BTreeMap<String, GroupState>,
}

impl GroupBook {
    /// A provider target that differs from the one last applied was changed
    /// by someone else.
    pub fn is_stale(&self, group_id: &str, observed_target: u64) -> bool {
        self.last_applied
            .get(group_id)
            .is_some_and(|&applied| applied != observed_target)
    }
}

/// Bookkeeping only the tick holder touches.
#[derive(Debug, Default)]
pub struct TickState {
    /// Instance ids per group at the last listing.
    pub instances: BTreeMap<String, BTreeSet<String>>,
    /// Instances this process terminated or queued for draining that have
    /// not been seen gone yet.
    pub removing: BTreeSet<String>,
}

pub struct PoolContext {
    name: String,
    settings: RwLock<Arc<PoolSettings>>,
    adapter: Arc<dyn ResourceGroupAdapter>,
    app_signal: RwLock<Option<Arc<dyn SignalSource>>>,
    default_signal: Arc<dyn SignalSource>,
    tick: Mutex<TickState>,
    book: std::sync::RwLock<GroupBook>,
}

impl PoolContext {
    pub fn new(
        settings: PoolSettings,
        adapter: Arc<dyn ResourceGroupAdapter>,
        signals: &dyn SignalFactory,
    ) -> Self {
        let name = settings.pool.name.clone();
        let app = settings.pool.app().to_string();
        let app_signal = settings
            .pool
            .signal
            .as_ref()
            .map(|config| signals.create(config, &name, &app));
        let default_signal = signals.create(&settings.default_signal, &name, &app);
        Self {
            name,
            settings: RwLock::new(Arc::new(settings)),
            adapter,
            app_signal: RwLock::new(app_signal),
            default_signal,
            tick: Mutex::new(TickState::default()),
            book: std::sync::RwLock::new(GroupBook::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current settings. A reload never changes a snapshot
    /// already handed out.
    pub async fn settings(&self) -> Arc<PoolSettings> {
        Arc::clone(&*self.settings.read().await)
    }

    pub fn adapter(&self) -> &dyn ResourceGroupAdapter {
        self.adapter.as_ref()
    }

    pub fn adapter_arc(&self) -> Arc<dyn ResourceGroupAdapter> {
        Arc::clone(&self.adapter)
    }

    pub async fn app_signal(&self) -> Option<Arc<dyn SignalSource>> {
        self.app_signal.read().await.clone()
    }

    pub fn default_signal(&self) -> &dyn SignalSource {
        self.default_signal.as_ref()
    }

    /// Copy of the group book.
    pub fn book(&self) -> GroupBook {
        self.book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_applied(&self, group_id: &str, target: u64) {
        self.book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_applied
            .insert(group_id.to_string(), target);
    }

    pub fn record_known(&self, state: &GroupState) {
        self.book
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .last_known
            .insert(state.id.clone(), state.clone());
    }

    /// Wait for any running tick to finish and claim the pool.
    pub async fn lock_tick(&self) -> MutexGuard<'_, TickState> {
        self.tick.lock().await
    }

    /// Swap in new settings between ticks. Signals whose configuration
    /// changed are reloaded first; if a reload fails the old settings stay.
    pub async fn apply_config(
        &self,
        next: PoolSettings,
        signals: &dyn SignalFactory,
    ) -> ControllerResult<()> {
        let _tick = self.lock_tick().await;
        let current = self.settings().await;

        if current.default_signal != next.default_signal {
            self.default_signal
                .reload(next.default_signal.clone())
                .await?;
            info!(pool = %self.name, signal = %next.default_signal.identity(), "default signal reloaded");
        }

        match (&current.pool.signal, &next.pool.signal) {
            (Some(old), Some(new)) if old != new => {
                if let Some(source) = self.app_signal().await {
                    source.reload(new.clone()).await?;
                }
                info!(pool = %self.name, signal = %new.identity(), "application signal reloaded");
            }
            (None, Some(new)) => {
                let source = signals.create(new, &self.name, next.pool.app());
                *self.app_signal.write().await = Some(source);
                info!(pool = %self.name, signal = %new.identity(), "application signal added");
            }
            (Some(old), None) => {
                if let Some(source) = self.app_signal.write().await.take() {
                    source.close().await;
                }
                info!(pool = %self.name, signal = %old.identity(), "application signal removed");
            }
            _ => {}
        }

        *self.settings.write().await = Arc::new(next);
        Ok(())
    }

    /// Stop every signal worker this pool owns.
    pub async fn close(&self) {
        if let Some(source) = self.app_signal.write().await.take() {
            source.close().await;
        }
        self.default_signal.close().await;
    }
}
