//! End-to-end ticks against scripted signals and simulated groups.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use poolscale_autoscale::{ScalingReason, FULFILLED_CAPACITY_METRIC};
use poolscale_controller::{
    AppNotice, Controller, ControllerBuilder, ControllerError, RecordingNotifier, RunMode,
    ServicePage, SignalFactory, SignalFuture, SignalOrigin, SignalSource,
};
use poolscale_core::{
    InstanceInfo, MetricKind, MetricsByName, PoolscaleConfig, SignalConfig, SignalIdentity,
    SignalResourceRequest, TerminationReason,
};
use poolscale_pool::{
    AdapterFuture, CloudApiError, DrainRequest, DrainSink, GroupStatus, PoolError, PoolResult,
    ResourceGroupAdapter, SimulatedGroupAdapter, TerminateOutcome,
};
use poolscale_signal::{EvaluationCause, SignalError, SignalResult};
use poolscale_state::{CapacityLossEvent, MetricsSource, StateStore};

// ── Scripted signals ───────────────────────────────────────────────

type Script = Arc<dyn Fn() -> SignalResult<Option<SignalResourceRequest>> + Send + Sync>;

struct ScriptedSignal {
    name: String,
    script: Script,
    calls: AtomicUsize,
}

impl SignalSource for ScriptedSignal {
    fn evaluate<'a>(
        &'a self,
        _metrics: &'a MetricsByName,
    ) -> SignalFuture<'a, Option<SignalResourceRequest>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = (self.script)();
        Box::pin(async move { result })
    }

    fn reload(&self, _config: SignalConfig) -> SignalFuture<'_, u64> {
        Box::pin(async { Ok(2) })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

#[derive(Default)]
struct ScriptedFactory {
    scripts: BTreeMap<String, Script>,
    created: Mutex<Vec<Arc<ScriptedSignal>>>,
}

impl ScriptedFactory {
    fn with(mut self, signal: &str, script: Script) -> Self {
        self.scripts.insert(signal.to_string(), script);
        self
    }

    fn calls(&self, signal: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.name == signal)
            .map(|s| s.calls.load(Ordering::SeqCst))
            .sum()
    }
}

impl SignalFactory for ScriptedFactory {
    fn create(&self, config: &SignalConfig, _pool: &str, _app: &str) -> Arc<dyn SignalSource> {
        let script = self
            .scripts
            .get(&config.name)
            .cloned()
            .unwrap_or_else(|| Arc::new(|| Ok(None)));
        let signal = Arc::new(ScriptedSignal {
            name: config.name.clone(),
            script,
            calls: AtomicUsize::new(0),
        });
        self.created.lock().unwrap().push(Arc::clone(&signal));
        signal
    }
}

fn requests(cpus: f64) -> Script {
    Arc::new(move || Ok(Some(SignalResourceRequest::cpus(cpus))))
}

/// Requests whatever `demand` holds at evaluation time.
fn follows(demand: &Arc<Mutex<f64>>) -> Script {
    let demand = Arc::clone(demand);
    Arc::new(move || Ok(Some(SignalResourceRequest::cpus(*demand.lock().unwrap()))))
}

fn fails_init(name: &'static str) -> Script {
    Arc::new(move || {
        Err(SignalError::Init {
            signal: SignalIdentity::new("poolscale", name, "v1"),
            reason: "no ack".to_string(),
        })
    })
}

fn fails_evaluation(name: &'static str) -> Script {
    Arc::new(move || {
        Err(SignalError::Evaluation {
            signal: SignalIdentity::new("jobs", name, "v3"),
            cause: EvaluationCause::Timeout,
        })
    })
}

// ── Adapter and drain mocks ────────────────────────────────────────

/// Simulated groups with injectable provider failures.
struct FlakyAdapter {
    inner: SimulatedGroupAdapter,
    unreadable: Mutex<BTreeSet<String>>,
    fail_modify: Mutex<BTreeSet<String>>,
    throttle_modify: AtomicBool,
}

impl FlakyAdapter {
    fn new(inner: &SimulatedGroupAdapter) -> Self {
        Self {
            inner: inner.clone(),
            unreadable: Mutex::new(BTreeSet::new()),
            fail_modify: Mutex::new(BTreeSet::new()),
            throttle_modify: AtomicBool::new(false),
        }
    }

    fn unreadable(&self, group_id: &str) {
        self.unreadable.lock().unwrap().insert(group_id.to_string());
    }
}

impl ResourceGroupAdapter for FlakyAdapter {
    fn get_status<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, GroupStatus> {
        if self.unreadable.lock().unwrap().contains(group_id) {
            return Box::pin(async { Err(CloudApiError::Other("connection reset".to_string())) });
        }
        self.inner.get_status(group_id)
    }

    fn modify_target_capacity<'a>(
        &'a self,
        group_id: &'a str,
        target: u64,
        dry_run: bool,
    ) -> AdapterFuture<'a, ()> {
        if self.throttle_modify.load(Ordering::SeqCst) {
            return Box::pin(async { Err(CloudApiError::Throttled("rate exceeded".to_string())) });
        }
        if self.fail_modify.lock().unwrap().contains(group_id) {
            return Box::pin(async { Err(CloudApiError::Other("internal error".to_string())) });
        }
        self.inner.modify_target_capacity(group_id, target, dry_run)
    }

    fn terminate_instances<'a>(
        &'a self,
        group_id: &'a str,
        instance_ids: &'a [String],
    ) -> AdapterFuture<'a, TerminateOutcome> {
        self.inner.terminate_instances(group_id, instance_ids)
    }

    fn list_instances<'a>(&'a self, group_id: &'a str) -> AdapterFuture<'a, Vec<InstanceInfo>> {
        self.inner.list_instances(group_id)
    }
}

#[derive(Default)]
struct RecordingDrain {
    requests: Mutex<Vec<DrainRequest>>,
}

impl DrainSink for RecordingDrain {
    fn submit(&self, request: DrainRequest) -> PoolResult<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

// ── Fixtures ───────────────────────────────────────────────────────

const SERVICE: &str = r#"
[service]
cluster = "test-cluster"
cloud_retry_attempts = 1
cloud_retry_base_delay = "1ms"
cloud_timeout = "2s"

[service.default_signal]
namespace = "poolscale"
name = "default"
branch_or_tag = "v1"

[autoscaling]
setpoint = 0.7
setpoint_margin = 0.1
"#;

const SCALING: &str = "min_capacity = 0
max_capacity = 100
max_weight_to_add = 200
max_weight_to_remove = 50
cpus_per_unit = 1.0";

const APP_SIGNAL: &str = r#"
[pools.signal]
namespace = "jobs"
name = "queue_depth"
branch_or_tag = "v3"
"#;

fn config(keys: &str, tables: &str) -> PoolscaleConfig {
    let toml = format!(
        "{SERVICE}
[[pools]]
name = \"batch\"
app = \"jobs\"
{keys}
{tables}
[[pools.resource_groups]]
id = \"sfr-1\"

[[pools.resource_groups]]
id = \"asg-1\"
"
    );
    PoolscaleConfig::from_toml_str(&toml).unwrap()
}

/// Groups of the "batch" pool, scaled to `targets`.
async fn seed(store: &StateStore, targets: &[(&str, u64)]) -> SimulatedGroupAdapter {
    let groups = SimulatedGroupAdapter::new(store.clone(), "batch");
    groups
        .ensure_groups(&["sfr-1".to_string(), "asg-1".to_string()])
        .unwrap();
    for (id, target) in targets {
        groups.modify_target_capacity(id, *target, false).await.unwrap();
    }
    groups
}

async fn targets(groups: &SimulatedGroupAdapter) -> (u64, u64) {
    (
        groups.get_status("sfr-1").await.unwrap().target_capacity,
        groups.get_status("asg-1").await.unwrap().target_capacity,
    )
}

async fn fulfilled(groups: &SimulatedGroupAdapter) -> (u64, u64) {
    (
        groups.get_status("sfr-1").await.unwrap().fulfilled_capacity(),
        groups.get_status("asg-1").await.unwrap().fulfilled_capacity(),
    )
}

fn builder(
    config: PoolscaleConfig,
    store: &StateStore,
    factory: &Arc<ScriptedFactory>,
    notifier: &Arc<RecordingNotifier>,
) -> ControllerBuilder {
    Controller::builder(config, store.clone(), Arc::clone(factory) as Arc<dyn SignalFactory>)
        .with_notifier(Arc::clone(notifier) as _)
}

/// A controller for "batch" whose provider calls go through a [`FlakyAdapter`].
fn flaky(
    config: PoolscaleConfig,
    store: &StateStore,
    groups: &SimulatedGroupAdapter,
    factory: ScriptedFactory,
    notifier: &Arc<RecordingNotifier>,
) -> (Controller, Arc<FlakyAdapter>) {
    let adapter = Arc::new(FlakyAdapter::new(groups));
    let controller = builder(config, store, &Arc::new(factory), notifier)
        .with_adapter("batch", Arc::clone(&adapter) as _)
        .build()
        .unwrap();
    (controller, adapter)
}

const CAPACITY_LOSS_GUARD: &str = "[pools.autoscaling]
prevent_scale_down_after_capacity_loss = true
instance_loss_threshold = 2
capacity_loss_window = \"15m\"
";

struct Harness {
    controller: Controller,
    store: StateStore,
    groups: SimulatedGroupAdapter,
    factory: Arc<ScriptedFactory>,
    notifier: Arc<RecordingNotifier>,
}

async fn harness(config: PoolscaleConfig, factory: ScriptedFactory, seeded: &[(&str, u64)]) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, seeded).await;
    let factory = Arc::new(factory);
    let notifier = Arc::new(RecordingNotifier::new());
    let controller = builder(config, &store, &factory, &notifier).build().unwrap();
    Harness {
        controller,
        store,
        groups,
        factory,
        notifier,
    }
}

// ── Scaling ────────────────────────────────────────────────────────

#[tokio::test]
async fn two_groups_scale_evenly_to_max_capacity() {
    let keys = SCALING.replace("min_capacity = 0", "min_capacity = 3");
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(&keys, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.decision.current_total, 20);
    assert_eq!(report.decision.clamped_total, 100);
    assert_eq!(report.decision.delta, 80);
    assert_eq!(report.origin, SignalOrigin::Default);
    assert_eq!(targets(&h.groups).await, (50, 50));
    assert_eq!(fulfilled(&h.groups).await, (50, 50));
}

#[tokio::test]
async fn empty_pool_cold_starts_one_group() {
    let keys = SCALING.replace("cpus_per_unit = 1.0", "");
    let factory = ScriptedFactory::default().with("default", requests(20.0));
    let h = harness(config(&keys, ""), factory, &[]).await;

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.decision.reason, ScalingReason::ColdStart);
    assert_eq!(report.decision.delta, 1);
    assert_eq!(targets(&h.groups).await, (1, 0));
}

#[tokio::test]
async fn paused_pool_is_left_alone() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;
    h.controller.pause("batch", None).unwrap();

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.decision.delta, 0);
    assert_eq!(report.decision.reason, ScalingReason::Paused);
    assert_eq!(report.origin, SignalOrigin::Skipped);
    assert_eq!(targets(&h.groups).await, (10, 10));
    assert_eq!(h.factory.calls("default"), 0);

    assert!(h.controller.resume("batch").unwrap());
    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();
    assert_eq!(report.decision.clamped_total, 100);
}

#[tokio::test]
async fn scale_down_terminates_selected_instances() {
    let factory = ScriptedFactory::default().with("default", requests(7.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.decision.clamped_total, 10);
    assert_eq!(report.selection.candidates.len(), 10);
    assert_eq!(report.removed.len(), 10);
    assert_eq!(targets(&h.groups).await, (5, 5));
    assert_eq!(fulfilled(&h.groups).await, (5, 5));
}

#[tokio::test]
async fn scale_down_with_draining_queues_instances() {
    let keys = format!("{SCALING}\ndraining_enabled = true");
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let factory = Arc::new(ScriptedFactory::default().with("default", requests(7.0)));
    let notifier = Arc::new(RecordingNotifier::new());
    let drain = Arc::new(RecordingDrain::default());
    let controller = builder(config(&keys, ""), &store, &factory, &notifier)
        .with_drain(Arc::clone(&drain) as _)
        .build()
        .unwrap();

    let report = controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.removed.len(), 10);
    let queued = drain.requests.lock().unwrap().clone();
    assert_eq!(queued.len(), 10);
    assert!(queued.iter().all(|r| r.pool == "batch"));
    // The drain worker terminates later; nothing is gone yet.
    assert_eq!(fulfilled(&groups).await, (10, 10));
    assert_eq!(targets(&groups).await, (5, 5));
}

#[tokio::test]
async fn capacity_loss_suppresses_scale_down() {
    let factory = ScriptedFactory::default().with("default", requests(7.0));
    let h = harness(
        config(SCALING, CAPACITY_LOSS_GUARD),
        factory,
        &[("sfr-1", 10), ("asg-1", 10)],
    )
    .await;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    for i in 0..3 {
        h.store
            .record_capacity_loss(&CapacityLossEvent {
                pool: "batch".to_string(),
                group_id: "sfr-1".to_string(),
                instance_id: format!("lost-{i}"),
                timestamp: now - 60,
            })
            .unwrap();
    }

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();

    assert_eq!(report.decision.delta, 0);
    assert!(report.decision.rate_limited);
    assert!(report.selection.suppressed);
    assert!(report.removed.is_empty());
    assert_eq!(fulfilled(&h.groups).await, (10, 10));
}

#[tokio::test]
async fn vanished_instances_are_recorded_as_capacity_loss() {
    let demand = Arc::new(Mutex::new(7.0));
    let factory = ScriptedFactory::default().with("default", follows(&demand));
    let h = harness(
        config(SCALING, CAPACITY_LOSS_GUARD),
        factory,
        &[("sfr-1", 10), ("asg-1", 10)],
    )
    .await;

    let first = h.controller.tick("batch").await.unwrap();
    assert_eq!(first.removed.len(), 10);
    assert_eq!(first.lost_instances, 0);

    // The instances removed above are gone, but they were ours.
    let second = h.controller.tick("batch").await.unwrap();
    assert_eq!(second.lost_instances, 0);
    assert!(h.store.list_capacity_loss_since("batch", 0).unwrap().is_empty());

    let survivors: Vec<String> = h
        .groups
        .list_instances("sfr-1")
        .await
        .unwrap()
        .into_iter()
        .take(3)
        .map(|i| i.id)
        .collect();
    h.groups.terminate_instances("sfr-1", &survivors).await.unwrap();
    *demand.lock().unwrap() = 3.5;

    let third = h.controller.tick("batch").await.unwrap();
    assert_eq!(third.lost_instances, 3);
    let events = h.store.list_capacity_loss_since("batch", 0).unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.group_id == "sfr-1"));
    assert_eq!(third.decision.delta, 0);
    assert!(third.selection.suppressed);
    assert!(third.removed.is_empty());
    assert_eq!(targets(&h.groups).await, (5, 5));
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h
        .controller
        .run_once("batch", RunMode::Manual, true)
        .await
        .unwrap();

    let plan = report.plan.unwrap();
    assert_eq!(plan.total(), 100);
    assert!(report.dry_run);
    assert_eq!(targets(&h.groups).await, (10, 10));
    let history = h
        .store
        .get_metric_values(FULFILLED_CAPACITY_METRIC, MetricKind::Metadata, "batch", 0, u64::MAX)
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn ticks_record_capacity_history() {
    let factory = ScriptedFactory::default().with("default", requests(14.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h
        .controller
        .run_once("batch", RunMode::Background, false)
        .await
        .unwrap();
    assert_eq!(report.decision.reason, ScalingReason::WithinMargin);

    let history = h
        .store
        .get_metric_values(FULFILLED_CAPACITY_METRIC, MetricKind::Metadata, "batch", 0, u64::MAX)
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].1, 20.0);
}

// ── Failure routing ────────────────────────────────────────────────

#[tokio::test]
async fn default_signal_init_failure_pages_service_owner_only() {
    let factory = ScriptedFactory::default().with("default", fails_init("default"));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    assert!(h.controller.tick("batch").await.is_none());

    assert_eq!(
        h.notifier.pages(),
        vec![("batch".to_string(), ServicePage::DefaultSignalConfigurationFailed)]
    );
    assert!(h.notifier.app_notices().is_empty());
    assert_eq!(targets(&h.groups).await, (10, 10));
}

#[tokio::test]
async fn default_signal_evaluation_failure_pages_with_its_kind() {
    let factory = ScriptedFactory::default().with("default", fails_evaluation("default"));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    assert!(h.controller.tick("batch").await.is_none());

    assert_eq!(
        h.notifier.pages(),
        vec![("batch".to_string(), ServicePage::DefaultSignalEvaluationFailed)]
    );
}

#[tokio::test]
async fn app_signal_evaluation_failure_falls_back_to_default() {
    let factory = ScriptedFactory::default()
        .with("queue_depth", fails_evaluation("queue_depth"))
        .with("default", requests(1000.0));
    let h = harness(config(SCALING, APP_SIGNAL), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h.controller.tick("batch").await.unwrap();

    assert_eq!(report.origin, SignalOrigin::Default);
    assert_eq!(report.request, Some(SignalResourceRequest::cpus(1000.0)));
    assert_eq!(
        h.notifier.app_notices(),
        vec![("batch".to_string(), AppNotice::SignalEvaluationFailed)]
    );
    assert!(h.notifier.pages().is_empty());
    assert_eq!(targets(&h.groups).await, (50, 50));
}

#[tokio::test]
async fn app_signal_init_failure_is_a_configuration_notice() {
    let factory = ScriptedFactory::default()
        .with("queue_depth", fails_init("queue_depth"))
        .with("default", requests(14.0));
    let h = harness(config(SCALING, APP_SIGNAL), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h.controller.tick("batch").await.unwrap();

    assert_eq!(report.origin, SignalOrigin::Default);
    assert_eq!(
        h.notifier.app_notices(),
        vec![("batch".to_string(), AppNotice::SignalConfigurationFailed)]
    );
    assert!(h.notifier.pages().is_empty());
}

#[tokio::test]
async fn app_signal_is_preferred_when_healthy() {
    let factory = ScriptedFactory::default()
        .with("queue_depth", requests(1000.0))
        .with("default", requests(0.0));
    let h = harness(config(SCALING, APP_SIGNAL), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let report = h.controller.tick("batch").await.unwrap();

    assert_eq!(report.origin, SignalOrigin::App);
    assert_eq!(h.factory.calls("default"), 0);
    assert_eq!(
        h.controller.evaluate_signal("batch").await.unwrap(),
        Some(SignalResourceRequest::cpus(1000.0))
    );
}

#[tokio::test]
async fn manual_run_returns_signal_errors() {
    let factory = ScriptedFactory::default()
        .with("queue_depth", fails_evaluation("queue_depth"))
        .with("default", requests(1000.0));
    let h = harness(config(SCALING, APP_SIGNAL), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let err = h
        .controller
        .run_once("batch", RunMode::Manual, false)
        .await
        .unwrap_err();

    assert!(matches!(err, ControllerError::Signal(SignalError::Evaluation { .. })));
    assert!(h.notifier.all().is_empty());
    assert_eq!(h.factory.calls("default"), 0);
    assert_eq!(targets(&h.groups).await, (10, 10));
}

#[tokio::test]
async fn throttling_is_swallowed() {
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let (controller, adapter) = flaky(config(SCALING, ""), &store, &groups, factory, &notifier);
    adapter.throttle_modify.store(true, Ordering::SeqCst);

    assert!(controller.tick("batch").await.is_none());
    assert!(notifier.all().is_empty());

    let err = controller
        .run_once("batch", RunMode::Manual, false)
        .await
        .unwrap_err();
    assert!(err.is_throttled());

    adapter.throttle_modify.store(false, Ordering::SeqCst);
    assert!(controller.tick("batch").await.is_some());
    assert_eq!(targets(&groups).await, (50, 50));
}

#[tokio::test]
async fn partial_group_state_is_best_effort_in_background_only() {
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let factory = ScriptedFactory::default().with("default", requests(14.0));
    let (controller, adapter) = flaky(config(SCALING, ""), &store, &groups, factory, &notifier);

    controller.tick("batch").await.unwrap();
    adapter.unreadable("asg-1");

    let err = controller
        .run_once("batch", RunMode::Manual, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ControllerError::Pool(PoolError::PartialGroupState { ref groups }) if groups == &["asg-1".to_string()]
    ));

    let report = controller.tick("batch").await.unwrap();
    assert_eq!(report.partial_groups, vec!["asg-1".to_string()]);
    // asg-1 stands in with what the first tick read.
    assert_eq!(report.decision.current_total, 20);
    assert!(notifier.pages().is_empty());
}

#[tokio::test]
async fn never_read_group_stops_background_ticks() {
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let (controller, adapter) = flaky(config(SCALING, ""), &store, &groups, factory, &notifier);
    adapter.unreadable("asg-1");

    assert!(controller.tick("batch").await.is_none());

    assert_eq!(
        notifier.pages(),
        vec![("batch".to_string(), ServicePage::ControlLoopFailed)]
    );
    assert_eq!(targets(&groups).await, (10, 10));
}

#[tokio::test]
async fn failed_update_keeps_earlier_groups_current() {
    let store = StateStore::open_in_memory().unwrap();
    let groups = seed(&store, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let notifier = Arc::new(RecordingNotifier::new());
    let demand = Arc::new(Mutex::new(14.0));
    let factory = ScriptedFactory::default().with("default", follows(&demand));
    let (controller, adapter) = flaky(config(SCALING, ""), &store, &groups, factory, &notifier);

    controller.tick("batch").await.unwrap();
    adapter.fail_modify.lock().unwrap().insert("asg-1".to_string());
    *demand.lock().unwrap() = 1000.0;

    assert!(controller.tick("batch").await.is_none());
    assert_eq!(targets(&groups).await, (50, 10));

    // sfr-1 moved because this process moved it.
    let status = controller.status("batch").await.unwrap();
    assert!(!status.groups[0].is_stale);
    assert!(!status.groups[1].is_stale);
}

// ── Lifecycle ──────────────────────────────────────────────────────

#[tokio::test]
async fn externally_modified_groups_are_flagged_stale() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;
    h.controller.tick("batch").await.unwrap();

    h.groups.modify_target_capacity("sfr-1", 60, false).await.unwrap();

    let status = h.controller.status("batch").await.unwrap();
    assert!(status.groups[0].is_stale);
    assert!(!status.groups[1].is_stale);
    assert_eq!(status.target_capacity, 110);
    assert!(!status.paused);
}

#[tokio::test]
async fn stale_group_gives_up_instances_first() {
    let keys = SCALING.replace("max_weight_to_remove = 50", "max_weight_to_remove = 5");
    let demand = Arc::new(Mutex::new(14.0));
    let factory = ScriptedFactory::default().with("default", follows(&demand));
    let h = harness(config(&keys, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;
    h.controller.tick("batch").await.unwrap();

    // Someone lowers asg-1 by hand; its instances stay until terminated.
    h.groups.modify_target_capacity("asg-1", 5, false).await.unwrap();
    *demand.lock().unwrap() = 3.5;

    let report = h.controller.tick("batch").await.unwrap();
    assert_eq!(report.decision.clamped_total, 10);
    assert_eq!(report.selection.candidates.len(), 5);
    assert!(report.selection.candidates.iter().all(|c| c.group_id == "asg-1"));
    assert_eq!(fulfilled(&h.groups).await, (10, 5));
}

#[tokio::test]
async fn status_reads_without_waiting_for_a_tick() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let ctx = h.controller.context("batch").unwrap();

    let status = h.controller.status("batch").await.unwrap();
    assert_eq!(status.target_capacity, 20);
    assert!(ctx.book().last_known.is_empty());

    let _running = ctx.lock_tick().await;
    let status = tokio::time::timeout(Duration::from_secs(1), h.controller.status("batch"))
        .await
        .expect("status waited for the tick lock")
        .unwrap();
    assert_eq!(status.target_capacity, 20);
}

#[tokio::test]
async fn evicted_instances_leave_without_retargeting() {
    let factory = ScriptedFactory::default().with("default", requests(14.0));
    let h = harness(
        config(SCALING, CAPACITY_LOSS_GUARD),
        factory,
        &[("sfr-1", 10), ("asg-1", 10)],
    )
    .await;
    h.controller.tick("batch").await.unwrap();

    let ids = vec![
        "sfr-1-000000".to_string(),
        "asg-1-000003".to_string(),
        "i-gone".to_string(),
    ];
    let report = h
        .controller
        .evict("batch", &ids, TerminationReason::NodeMigration)
        .await
        .unwrap();

    let mut removed = report.removed.clone();
    removed.sort();
    assert_eq!(removed, vec!["asg-1-000003".to_string(), "sfr-1-000000".to_string()]);
    assert_eq!(report.unknown, vec!["i-gone".to_string()]);
    assert!(report
        .selection
        .candidates
        .iter()
        .all(|c| c.reason == TerminationReason::NodeMigration));
    assert_eq!(fulfilled(&h.groups).await, (9, 9));
    assert_eq!(targets(&h.groups).await, (10, 10));

    // Evictions are not capacity loss.
    let next = h.controller.tick("batch").await.unwrap();
    assert_eq!(next.lost_instances, 0);
}

#[tokio::test]
async fn tick_interval_follows_the_signal_period() {
    let periodic = format!("{APP_SIGNAL}period_minutes = 5\n");
    let h = harness(config(SCALING, &periodic), ScriptedFactory::default(), &[]).await;
    assert_eq!(
        h.controller.tick_interval("batch").await.unwrap(),
        Duration::from_secs(300)
    );

    let h = harness(config(SCALING, APP_SIGNAL), ScriptedFactory::default(), &[]).await;
    assert_eq!(
        h.controller.tick_interval("batch").await.unwrap(),
        Duration::from_secs(60)
    );
}

#[tokio::test]
async fn applied_config_takes_effect_next_tick() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let h = harness(config(SCALING, ""), factory, &[("sfr-1", 10), ("asg-1", 10)]).await;

    let smaller = SCALING.replace("max_capacity = 100", "max_capacity = 40");
    h.controller.apply_config(&config(&smaller, "")).await.unwrap();

    let report = h.controller.tick("batch").await.unwrap();
    assert_eq!(report.decision.clamped_total, 40);
    assert_eq!(targets(&h.groups).await, (20, 20));
}

#[tokio::test]
async fn unknown_pool_is_rejected() {
    let h = harness(config(SCALING, ""), ScriptedFactory::default(), &[]).await;
    let err = h
        .controller
        .run_once("nope", RunMode::Manual, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::UnknownPool(_)));
}

#[tokio::test]
async fn background_loop_ticks_until_shutdown() {
    let factory = ScriptedFactory::default().with("default", requests(1000.0));
    let mut fast = config(SCALING, "");
    fast.service.tick_interval = "20ms".to_string();
    let h = harness(fast, factory, &[("sfr-1", 10), ("asg-1", 10)]).await;
    let controller = Arc::new(h.controller);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_handle = tokio::spawn(poolscale_controller::run(Arc::clone(&controller), shutdown_rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).unwrap();
    loop_handle.await.unwrap();

    assert!(h.factory.calls("default") >= 2);
    assert_eq!(targets(&h.groups).await, (50, 50));
}
