//! Scenario runner - drives the dispatch core through each scenario.

use crate::backend::{BackendProfile, InFlightGauge, ScriptedBackend, ScriptedFactory};
use crate::context::SimContext;
use crate::exporter::{RunRecord, SimExport};
use crate::scenarios::ScenarioId;
use crate::store::FlakyStore;

use chorus_core::orchestrator::{CancelHandle, ProgressCallback, RunOutcome, RunProgress, RunStatus};
use chorus_core::queue::{ItemState, PromptQueue, WorkItem};
use chorus_core::rate_limiter::RateLimiter;
use chorus_core::service::{DispatchService, RunOptions};
use chorus_core::token_bucket::{BucketSpec, TokenBucket};
use chorus_core::{ChorusConfig, ProviderKind};
use chorus_env::{ChorusContext, ItemId, OrgId, RunId, StoreController};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Virtual seconds elapsed on the simulation clock
    pub virtual_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Run data, when export was requested
    pub export: Option<SimExport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Work items admitted
    pub items: u64,

    /// Queue operations applied
    pub queue_steps: u64,

    /// Items sent back to pending after a failed attempt
    pub retries: u64,

    /// Normalized results recorded by orchestrators
    pub results: u64,

    /// Failed (item, provider) results
    pub failed_results: u64,

    /// Calls cut off by the per-call timeout
    pub timeouts: u64,

    /// Highest number of simultaneous calls seen across providers
    pub max_in_flight: u64,

    /// Store operations refused during outages
    pub store_rejections: u64,
}

type Check = std::result::Result<(), String>;

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Check {
    if condition {
        Ok(())
    } else {
        Err(reason())
    }
}

fn fail<E: Display>(e: E) -> String {
    e.to_string()
}

/// Collects progress reports for export.
fn progress_recorder() -> (ProgressCallback, Arc<Mutex<Vec<RunProgress>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |p: &RunProgress| sink.lock().unwrap().push(p.clone()));
    (callback, seen)
}

/// Runs dispatch scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Work items per scenario
    num_items: usize,

    /// Base configuration for orchestrated scenarios
    config: ChorusConfig,

    /// Keep run data for export
    export: bool,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            num_items: 20,
            config: ChorusConfig::default(),
            export: false,
        }
    }

    /// Sets the number of work items.
    pub fn with_items(mut self, items: usize) -> Self {
        self.num_items = items.max(2);
        self
    }

    /// Replaces the base configuration.
    pub fn with_config(mut self, config: ChorusConfig) -> Self {
        self.config = config;
        self
    }

    /// Records run data into `ScenarioResult::export`.
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        if scenario.is_chaos() {
            warn!("🔥 CHAOS SCENARIO - Injecting faults!");
        }

        let context = SimContext::shared(self.seed);
        let mut metrics = ScenarioMetrics::default();
        let mut export = self.export.then(|| SimExport::new(scenario.name(), self.seed));

        let check = match scenario {
            ScenarioId::Partition => self.run_partition(&context, &mut metrics).await,
            ScenarioId::PriorityOrder => self.run_priority_order(&context, &mut metrics).await,
            ScenarioId::RetryBound => self.run_retry_bound(&context, &mut metrics).await,
            ScenarioId::IdempotentAdmission => self.run_idempotent_admission(&mut metrics).await,
            ScenarioId::BucketRefill => self.run_bucket_refill(&context).await,
            ScenarioId::ProviderCap => self.run_provider_cap(&context, &mut metrics, &mut export).await,
            ScenarioId::ScopeIsolation => self.run_scope_isolation(&context).await,
            ScenarioId::StoreOutage => self.run_store_outage(&context, &mut metrics, &mut export).await,
            ScenarioId::CrashRecovery => self.run_crash_recovery(&context, &mut metrics, &mut export).await,
            ScenarioId::ProviderChaos => self.run_provider_chaos(&context, &mut metrics, &mut export).await,
            ScenarioId::Cancellation => self.run_cancellation(&context, &mut metrics, &mut export).await,
        };

        let failure_reason = check.err();
        let passed = failure_reason.is_none();
        if let Some(export) = export.as_mut() {
            export.finalize(passed, failure_reason.clone());
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            virtual_secs: context.now().as_secs_f64(),
            failure_reason,
            metrics,
            export,
        }
    }

    fn run_id(&self, salt: u64) -> RunId {
        RunId::from_seed(self.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ salt)
    }

    fn items(&self, context: &SimContext, salt: u64) -> Vec<WorkItem> {
        let mut rng = context.fork_rng();
        (0..self.num_items as u64)
            .map(|i| {
                WorkItem::new(
                    ItemId::from_seed(self.seed.wrapping_mul(1_000_003) ^ (salt << 32) ^ i),
                    format!("How would you rate product #{}?", i),
                )
                .with_priority(rng.gen_range(-3..=3))
                .with_owner(format!("persona-{}", i % 4))
            })
            .collect()
    }

    fn service(
        &self,
        context: &Arc<SimContext>,
        store: Arc<FlakyStore>,
        factory: ScriptedFactory,
        tweak: impl FnOnce(&mut ChorusConfig),
    ) -> std::result::Result<DispatchService, String> {
        let mut config = self.config.clone();
        tweak(&mut config);
        DispatchService::new(config, context.clone(), Some(store), Arc::new(factory)).map_err(fail)
    }

    fn record(&self, export: &mut Option<SimExport>, outcome: &RunOutcome, progress: Vec<RunProgress>, metrics: &mut ScenarioMetrics) {
        metrics.results += outcome.results.len() as u64;
        metrics.failed_results += outcome.failures().count() as u64;
        metrics.timeouts += outcome
            .failures()
            .filter(|r| r.error.as_deref().is_some_and(|e| e.contains("timed out")))
            .count() as u64;

        if let Some(export) = export.as_mut() {
            export.add_run(RunRecord {
                state: outcome.state.clone(),
                elapsed_secs: outcome.elapsed.as_secs_f64(),
                progress,
                results: outcome.results.clone(),
            });
        }
    }

    // =========================================================================
    // QUEUE PROPERTIES
    // =========================================================================

    /// DSS-001: random operations, partition checked after every one.
    async fn run_partition(&self, context: &Arc<SimContext>, metrics: &mut ScenarioMetrics) -> Check {
        info!("DSS-001: Partition invariant under random operations");

        let store = FlakyStore::shared(context.clone());
        let queue = PromptQueue::new(self.run_id(1), Some(store));
        let mut rng = context.fork_rng();
        let pool = self.items(context, 1);

        let mut ever: HashSet<ItemId> = HashSet::new();
        let mut processing: Vec<ItemId> = Vec::new();

        for step in 0..self.num_items * 10 {
            match rng.gen_range(0..10) {
                0..=2 => {
                    let item = pool[rng.gen_range(0..pool.len())].clone().with_max_retries(rng.gen_range(0..3));
                    ever.insert(item.id);
                    queue.add(item).await;
                }
                3..=4 => {
                    if let Some(item) = queue.get().await {
                        processing.push(item.id);
                    }
                }
                5..=6 if !processing.is_empty() => {
                    let id = processing.swap_remove(rng.gen_range(0..processing.len()));
                    queue.mark_completed(id).await.map_err(fail)?;
                }
                7..=8 if !processing.is_empty() => {
                    let id = processing.swap_remove(rng.gen_range(0..processing.len()));
                    if queue.mark_failed(id, Some("scripted"), rng.gen_bool(0.7)).await.map_err(fail)? {
                        metrics.retries += 1;
                    }
                }
                9 => {
                    let requeued = queue.requeue_processing().await.map_err(fail)?;
                    ensure(requeued == processing.len(), || {
                        format!("step {}: requeued {} of {} processing", step, requeued, processing.len())
                    })?;
                    processing.clear();
                }
                _ => {}
            }
            metrics.queue_steps += 1;

            let stats = queue.stats().await;
            ensure(stats.total == ever.len(), || {
                format!("step {}: {} ids tracked across sets, {} admitted", step, stats.total, ever.len())
            })?;
            ensure(stats.processing == processing.len(), || {
                format!("step {}: {} processing, expected {}", step, stats.processing, processing.len())
            })?;
            for id in &ever {
                ensure(queue.state_of(*id).await.is_some(), || format!("step {}: item {} lost", step, id))?;
            }
        }

        metrics.items = ever.len() as u64;
        debug!("  partition held over {} steps", metrics.queue_steps);
        Ok(())
    }

    /// DSS-002: priority ordering, fixed pair then a random drain.
    async fn run_priority_order(&self, context: &Arc<SimContext>, metrics: &mut ScenarioMetrics) -> Check {
        info!("DSS-002: Priority ordering");

        let queue = PromptQueue::new(self.run_id(2), None);
        let p1 = WorkItem::new(ItemId::from_seed(1), "P1").with_priority(0);
        let p2 = WorkItem::new(ItemId::from_seed(2), "P2").with_priority(10);
        queue.add(p1).await;
        queue.add(p2.clone()).await;
        let first = queue.get().await.ok_or("queue empty after two adds")?;
        ensure(first.id == p2.id, || format!("expected P2 first, got {}", first.payload_text))?;
        queue.clear().await;

        let items = self.items(context, 2);
        metrics.items = items.len() as u64;
        queue.add_batch(items).await;

        let mut last = i32::MAX;
        while let Some(item) = queue.get().await {
            ensure(item.priority <= last, || {
                format!("priority {} released after {}", item.priority, last)
            })?;
            last = item.priority;
            queue.mark_completed(item.id).await.map_err(fail)?;
            metrics.queue_steps += 1;
        }
        Ok(())
    }

    /// DSS-003: attempts until terminal failure equal max_retries + 1.
    async fn run_retry_bound(&self, context: &Arc<SimContext>, metrics: &mut ScenarioMetrics) -> Check {
        info!("DSS-003: Retry bound");

        let queue = PromptQueue::new(self.run_id(3), Some(FlakyStore::shared(context.clone())));
        let mut rng = context.fork_rng();
        let items: Vec<WorkItem> = self
            .items(context, 3)
            .into_iter()
            .map(|item| item.with_max_retries(rng.gen_range(0..=4)))
            .collect();
        let budgets: HashMap<ItemId, u32> = items.iter().map(|i| (i.id, i.max_retries)).collect();
        metrics.items = items.len() as u64;
        queue.add_batch(items).await;

        let mut attempts: HashMap<ItemId, u32> = HashMap::new();
        while let Some(item) = queue.get().await {
            *attempts.entry(item.id).or_default() += 1;
            if queue.mark_failed(item.id, Some("provider down"), true).await.map_err(fail)? {
                metrics.retries += 1;
            }
            metrics.queue_steps += 1;
        }

        for (id, max_retries) in &budgets {
            let made = attempts.get(id).copied().unwrap_or(0);
            ensure(made == max_retries + 1, || {
                format!("item {} attempted {} times with max_retries {}", id, made, max_retries)
            })?;
            ensure(queue.state_of(*id).await == Some(ItemState::Failed), || {
                format!("item {} not terminally failed", id)
            })?;
        }
        Ok(())
    }

    /// DSS-004: re-adding pending or processing ids is a no-op.
    async fn run_idempotent_admission(&self, metrics: &mut ScenarioMetrics) -> Check {
        info!("DSS-004: Idempotent admission");

        let queue = PromptQueue::new(self.run_id(4), None);
        let items: Vec<WorkItem> = (0..self.num_items as u64)
            .map(|i| WorkItem::new(ItemId::from_seed(i), format!("q{}", i)))
            .collect();
        metrics.items = items.len() as u64;
        let added = queue.add_batch(items.clone()).await;
        ensure(added == items.len(), || format!("only {} of {} admitted", added, items.len()))?;

        let taken = queue.get_batch(items.len() / 2).await;
        let before = queue.stats().await;

        let readded = queue.add_batch(items.clone()).await;
        let after = queue.stats().await;
        ensure(readded == 0, || format!("{} live ids admitted twice", readded))?;
        ensure(before == after, || format!("stats moved: {:?} -> {:?}", before, after))?;

        // A finished id comes back as a fresh item
        let done = taken.first().ok_or("nothing released")?.id;
        queue.mark_completed(done).await.map_err(fail)?;
        ensure(queue.add(WorkItem::new(done, "again")).await, || "finished id refused".into())?;
        ensure(queue.state_of(done).await == Some(ItemState::Pending), || {
            "re-admitted id not pending".into()
        })?;
        metrics.queue_steps = (items.len() * 2 + taken.len() + 2) as u64;
        Ok(())
    }

    // =========================================================================
    // RATE LIMITING
    // =========================================================================

    /// DSS-005: capacity 10 at 1 token/s.
    async fn run_bucket_refill(&self, context: &Arc<SimContext>) -> Check {
        info!("DSS-005: Token bucket refill");

        let spec = BucketSpec {
            capacity: 10,
            refill_rate: 1.0,
            refill_interval: Duration::from_secs(1),
        };
        let store = FlakyStore::shared(context.clone());
        let bucket = TokenBucket::new("sim:refill", spec, context.clone(), Some(store)).map_err(fail)?;

        let full = bucket.acquire(10).await;
        ensure(full.allowed && full.remaining == 0, || format!("acquire(10) gave {:?}", full))?;

        let empty = bucket.acquire(1).await;
        ensure(!empty.allowed && empty.retry_after == Some(1), || {
            format!("acquire(1) on empty bucket gave {:?}", empty)
        })?;

        context.sleep(Duration::from_secs(1)).await;
        let refilled = bucket.acquire(1).await;
        ensure(refilled.allowed, || format!("acquire(1) after 1s gave {:?}", refilled))?;
        ensure(!bucket.is_degraded(), || "bucket degraded with a healthy store".into())
    }

    /// DSS-007: org A's budget is independent of org B's.
    async fn run_scope_isolation(&self, context: &Arc<SimContext>) -> Check {
        info!("DSS-007: Scope isolation");

        let mut policy = self.config.rate_limits.clone();
        policy.triggers_per_hour = 5;
        let store = FlakyStore::shared(context.clone());
        let limiter = RateLimiter::new(policy, context.clone(), Some(store)).map_err(fail)?;
        let org_a = OrgId::from_seed(self.seed);
        let org_b = OrgId::from_seed(self.seed.wrapping_add(1));

        for n in 1..=5 {
            let decision = limiter.check_trigger_limit(org_a).await.map_err(fail)?;
            ensure(decision.allowed, || format!("org A trigger {} denied", n))?;
        }
        let sixth = limiter.check_trigger_limit(org_a).await.map_err(fail)?;
        ensure(!sixth.allowed, || "org A's 6th trigger allowed".into())?;

        let other = limiter.check_trigger_limit(org_b).await.map_err(fail)?;
        ensure(other.allowed, || "org B's first trigger denied".into())
    }

    // =========================================================================
    // ORCHESTRATION
    // =========================================================================

    /// DSS-006: per-provider cap of 1, providers overlap.
    async fn run_provider_cap(
        &self,
        context: &Arc<SimContext>,
        metrics: &mut ScenarioMetrics,
        export: &mut Option<SimExport>,
    ) -> Check {
        info!("DSS-006: Per-provider concurrency cap");

        let overall = InFlightGauge::shared();
        let factory = ScriptedFactory::new()
            .with(
                ScriptedBackend::new(ProviderKind::OpenAi, BackendProfile::default(), context.clone())
                    .with_shared_gauge(overall.clone()),
            )
            .with(
                ScriptedBackend::new(ProviderKind::Google, BackendProfile::default(), context.clone())
                    .with_shared_gauge(overall.clone()),
            );
        let x = factory.backend_for(ProviderKind::OpenAi).cloned().ok_or("no backend X")?;
        let y = factory.backend_for(ProviderKind::Google).cloned().ok_or("no backend Y")?;

        let service = self.service(context, FlakyStore::shared(context.clone()), factory, |c| {
            c.run.max_concurrent_items = 8;
            c.run.max_concurrent_per_provider = 1;
        })?;
        let run_id = self.run_id(6);
        let (progress, seen) = progress_recorder();
        service
            .create_run(
                run_id,
                RunOptions {
                    providers: Some(vec![ProviderKind::OpenAi, ProviderKind::Google]),
                    progress: Some(progress),
                    ..Default::default()
                },
            )
            .await
            .map_err(fail)?;

        let queue = service.open_queue(run_id).await.map_err(fail)?;
        let items = self.items(context, 6);
        metrics.items = items.len() as u64;
        queue.add_batch(items).await;
        let outcome = service.run(run_id, queue).await.map_err(fail)?;
        let progress = seen.lock().unwrap().clone();
        self.record(export, &outcome, progress, metrics);
        metrics.max_in_flight = overall.peak() as u64;

        ensure(x.gauge().peak() == 1, || format!("provider X peaked at {} in flight", x.gauge().peak()))?;
        ensure(y.gauge().peak() == 1, || format!("provider Y peaked at {} in flight", y.gauge().peak()))?;
        ensure(overall.peak() >= 2, || "providers X and Y never overlapped".into())?;
        ensure(outcome.state.completed == self.num_items, || {
            format!("{} of {} items completed", outcome.state.completed, self.num_items)
        })
    }

    /// DSS-008: the shared store drops out mid-run.
    async fn run_store_outage(
        &self,
        context: &Arc<SimContext>,
        metrics: &mut ScenarioMetrics,
        export: &mut Option<SimExport>,
    ) -> Check {
        info!("DSS-008: Store outage mid-run");

        let store = FlakyStore::shared(context.clone());
        let factory = ScriptedFactory::new()
            .with(ScriptedBackend::new(ProviderKind::OpenAi, BackendProfile::default(), context.clone()))
            .with(ScriptedBackend::new(ProviderKind::Anthropic, BackendProfile::default(), context.clone()));
        let service = self.service(context, store.clone(), factory, |c| {
            c.run.batch_size = 4;
            c.run.progress_interval = 4;
        })?;

        // Store goes down after the first report and returns after the second
        let switch = store.clone();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let log = reports.clone();
        let progress: ProgressCallback = Arc::new(move |p: &RunProgress| {
            let mut log = log.lock().unwrap();
            log.push(p.clone());
            match log.len() {
                1 => switch.set_available(false),
                2 => switch.set_available(true),
                _ => {}
            }
        });

        let run_id = self.run_id(8);
        service
            .create_run(
                run_id,
                RunOptions {
                    org: Some(OrgId::from_seed(self.seed)),
                    providers: Some(vec![ProviderKind::OpenAi, ProviderKind::Anthropic]),
                    progress: Some(progress),
                    ..Default::default()
                },
            )
            .await
            .map_err(fail)?;

        let queue = service.open_queue(run_id).await.map_err(fail)?;
        queue.add_batch(self.items(context, 8)).await;
        metrics.items = self.num_items as u64;
        let outcome = service.run(run_id, queue.clone()).await.map_err(fail)?;
        let progress = reports.lock().unwrap().clone();
        self.record(export, &outcome, progress, metrics);
        metrics.store_rejections = store.rejected();

        ensure(store.rejected() > 0, || "outage never hit the store".into())?;
        ensure(outcome.state.completed == self.num_items, || {
            format!("{} of {} items completed through the outage", outcome.state.completed, self.num_items)
        })?;
        ensure(outcome.failures().count() == 0, || "calls failed during store outage".into())?;

        // Resync, then a fresh process must see the same picture
        queue.requeue_processing().await.map_err(fail)?;
        ensure(!queue.mirror_degraded(), || "mirror still degraded after the store returned".into())?;
        let recovered = service.open_queue(run_id).await.map_err(fail)?;
        let stats = recovered.stats().await;
        ensure(stats.completed == self.num_items && stats.pending == 0, || {
            format!("recovered mirror disagrees: {:?}", stats)
        })
    }

    /// DSS-009: crash with items processing, recover, finish.
    async fn run_crash_recovery(
        &self,
        context: &Arc<SimContext>,
        metrics: &mut ScenarioMetrics,
        export: &mut Option<SimExport>,
    ) -> Check {
        info!("DSS-009: Crash recovery");

        let store = FlakyStore::shared(context.clone());
        let run_id = self.run_id(9);
        let items = self.items(context, 9);
        let ids: Vec<ItemId> = items.iter().map(|i| i.id).collect();
        metrics.items = items.len() as u64;

        {
            let doomed = PromptQueue::new(run_id, Some(store.clone()));
            doomed.add_batch(items).await;
            let taken = doomed.get_batch(self.num_items / 2).await;
            doomed.mark_completed(taken[0].id).await.map_err(fail)?;
            debug!("  crashing with {} items processing", taken.len() - 1);
        }

        let factory = ScriptedFactory::new()
            .with(ScriptedBackend::new(ProviderKind::Google, BackendProfile::default(), context.clone()));
        let service = self.service(context, store, factory, |_| {})?;
        let queue = service.open_queue(run_id).await.map_err(fail)?;
        let stats = queue.stats().await;
        ensure(stats.processing == 0 && stats.completed == 1, || {
            format!("recovered queue in wrong shape: {:?}", stats)
        })?;
        ensure(stats.pending == self.num_items - 1, || {
            format!("{} pending after recovery, expected {}", stats.pending, self.num_items - 1)
        })?;

        service
            .create_run(
                run_id,
                RunOptions {
                    providers: Some(vec![ProviderKind::Google]),
                    ..Default::default()
                },
            )
            .await
            .map_err(fail)?;
        let outcome = service.run(run_id, queue.clone()).await.map_err(fail)?;
        self.record(export, &outcome, Vec::new(), metrics);

        for id in ids {
            ensure(queue.state_of(id).await == Some(ItemState::Completed), || {
                format!("item {} not completed after recovery", id)
            })?;
        }
        Ok(())
    }

    /// DSS-010: flaky and hanging providers.
    async fn run_provider_chaos(
        &self,
        context: &Arc<SimContext>,
        metrics: &mut ScenarioMetrics,
        export: &mut Option<SimExport>,
    ) -> Check {
        info!("DSS-010: Provider chaos");

        let flaky = BackendProfile {
            failure_rate: 0.3,
            ..Default::default()
        };
        let hanging = BackendProfile {
            failure_rate: 0.2,
            hang_rate: 0.1,
            ..Default::default()
        };
        let factory = ScriptedFactory::new()
            .with(ScriptedBackend::new(ProviderKind::OpenAi, flaky, context.clone()))
            .with(ScriptedBackend::new(ProviderKind::Google, hanging, context.clone()))
            .with(ScriptedBackend::new(ProviderKind::Anthropic, BackendProfile::default(), context.clone()));
        let service = self.service(context, FlakyStore::shared(context.clone()), factory, |c| {
            c.run.per_call_timeout = Duration::from_millis(200);
        })?;

        let run_id = self.run_id(10);
        let (progress, seen) = progress_recorder();
        let (tx, mut rx) = mpsc::channel(self.num_items * 3 + 1);
        service
            .create_run(
                run_id,
                RunOptions {
                    providers: Some(vec![ProviderKind::OpenAi, ProviderKind::Google, ProviderKind::Anthropic]),
                    progress: Some(progress),
                    sink: Some(tx),
                    ..Default::default()
                },
            )
            .await
            .map_err(fail)?;

        let queue = service.open_queue(run_id).await.map_err(fail)?;
        queue.add_batch(self.items(context, 10)).await;
        metrics.items = self.num_items as u64;
        let outcome = service.run(run_id, queue).await.map_err(fail)?;
        let progress = seen.lock().unwrap().clone();
        self.record(export, &outcome, progress, metrics);

        ensure(outcome.state.completed == self.num_items, || {
            format!("{} of {} items completed", outcome.state.completed, self.num_items)
        })?;
        ensure(outcome.results.len() == self.num_items * 3, || {
            format!("{} results for {} items x 3 providers", outcome.results.len(), self.num_items)
        })?;
        let pairs: HashSet<(ItemId, ProviderKind)> = outcome.results.iter().map(|r| (r.item_id, r.provider)).collect();
        ensure(pairs.len() == outcome.results.len(), || "duplicate (item, provider) result".into())?;
        ensure(outcome.state.failed == outcome.failures().count(), || {
            "failed counter disagrees with failed results".into()
        })?;

        let mut streamed = 0;
        while let Ok(result) = rx.try_recv() {
            ensure(result.success, || "failed result reached the sink".into())?;
            streamed += 1;
        }
        ensure(streamed == outcome.successful().count(), || {
            format!("sink got {} of {} successes", streamed, outcome.successful().count())
        })?;
        let is_final = progress_is_final(&seen.lock().unwrap(), RunStatus::Completed);
        ensure(is_final, || "no final progress report".into())
    }

    /// DSS-011: cancel after the first batch, then resume.
    async fn run_cancellation(
        &self,
        context: &Arc<SimContext>,
        metrics: &mut ScenarioMetrics,
        export: &mut Option<SimExport>,
    ) -> Check {
        info!("DSS-011: Cancellation between batches");

        let factory = ScriptedFactory::new()
            .with(ScriptedBackend::new(ProviderKind::Anthropic, BackendProfile::default(), context.clone()));
        let service = self.service(context, FlakyStore::shared(context.clone()), factory, |c| {
            c.run.batch_size = 2;
            c.run.progress_interval = 2;
        })?;
        let run_id = self.run_id(11);
        let options = |progress: Option<ProgressCallback>| RunOptions {
            providers: Some(vec![ProviderKind::Anthropic]),
            progress,
            ..Default::default()
        };

        let handle: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let slot = handle.clone();
        let canceller: ProgressCallback = Arc::new(move |p: &RunProgress| {
            if p.status == RunStatus::Running {
                if let Some(handle) = slot.lock().unwrap().as_ref() {
                    handle.cancel();
                }
            }
        });
        let orchestrator = service.create_run(run_id, options(Some(canceller))).await.map_err(fail)?;
        *handle.lock().unwrap() = Some(orchestrator.cancel_handle());

        let queue = service.open_queue(run_id).await.map_err(fail)?;
        queue.add_batch(self.items(context, 11)).await;
        metrics.items = self.num_items as u64;
        let first = service.run(run_id, queue.clone()).await.map_err(fail)?;
        self.record(export, &first, Vec::new(), metrics);

        ensure(first.state.cancelled, || "run not flagged cancelled".into())?;
        ensure(first.state.completed == 2, || format!("{} items completed before cancel", first.state.completed))?;
        ensure(queue.len().await == self.num_items - 2, || "unprocessed items left the queue".into())?;

        // The same run id can be resumed once the cancelled run is gone
        service.create_run(run_id, options(None)).await.map_err(fail)?;
        let second = service.run(run_id, queue.clone()).await.map_err(fail)?;
        self.record(export, &second, Vec::new(), metrics);
        ensure(!second.state.cancelled, || "resumed run cancelled".into())?;
        ensure(queue.stats().await.completed == self.num_items, || "resumed run left items behind".into())
    }
}

fn progress_is_final(progress: &[RunProgress], status: RunStatus) -> bool {
    progress.last().is_some_and(|p| p.status == status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_property_scenarios_pass() {
        let runner = ScenarioRunner::new(42).with_items(12);
        for scenario in ScenarioId::properties() {
            let result = runner.run(scenario).await;
            assert!(result.passed, "{} failed: {:?}", scenario, result.failure_reason);
        }
    }

    #[tokio::test]
    async fn test_chaos_scenarios_pass() {
        let runner = ScenarioRunner::new(7).with_items(10);
        for scenario in ScenarioId::chaos() {
            let result = runner.run(scenario).await;
            assert!(result.passed, "{} failed: {:?}", scenario, result.failure_reason);
        }
    }

    #[tokio::test]
    async fn test_provider_cap_records_overlap() {
        let result = ScenarioRunner::new(3).with_items(5).run(ScenarioId::ProviderCap).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.max_in_flight >= 2);
        assert_eq!(result.metrics.results, 10);
    }

    #[tokio::test]
    async fn test_export_captures_runs() {
        let result = ScenarioRunner::new(5)
            .with_items(6)
            .with_export(true)
            .run(ScenarioId::Cancellation)
            .await;
        let export = result.export.expect("export requested");
        assert!(export.passed);
        assert_eq!(export.runs.len(), 2);
        assert!(export.runs[0].state.cancelled);
    }

    #[tokio::test]
    async fn test_store_outage_is_observed() {
        let result = ScenarioRunner::new(11).with_items(12).run(ScenarioId::StoreOutage).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.store_rejections > 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_queue_scenarios_hold_for_any_seed(seed in any::<u64>()) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let runner = ScenarioRunner::new(seed).with_items(8);
                for scenario in [ScenarioId::Partition, ScenarioId::RetryBound, ScenarioId::PriorityOrder] {
                    let result = runner.run(scenario).await;
                    prop_assert!(result.passed, "{} seed {}: {:?}", scenario, seed, result.failure_reason);
                }
                Ok(())
            })?;
        }
    }
}
