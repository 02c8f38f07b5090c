//! Orchestrator - drains one run's queue against every configured provider.
//!
//! ```text
//!  loop while queue non-empty and not cancelled:
//!     batch = queue.get_batch(batch_size)
//!     for item in batch, for provider in providers:
//!         spawn ─► [budget check] ─► global permit ─► provider permit
//!                     ─► adapter.query() under per_call_timeout
//!                     ─► record NormalizedResult
//!                     ─► first provider only: queue.mark_completed(item)
//!     join the batch, report progress every `progress_interval` items
//! ```
//!
//! A failed or timed-out call becomes a failed `NormalizedResult` for that
//! (item, provider) pair. Only queue state errors and panicked tasks abort
//! `run()`. Cancellation is checked between batches; dispatched calls are
//! left to finish under their own timeout.

use crate::config::RunConfig;
use crate::error::{DispatchError, Result};
use crate::provider::{AdapterMetrics, ProviderAdapter, ProviderKind, QueryRequest};
use crate::queue::{PromptQueue, WorkItem};
use crate::rate_limiter::{RateLimitScope, RateLimiter};
use chorus_env::{ChorusContext, ItemId, OrgId, RunId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// =============================================================================
// RESULTS & PROGRESS
// =============================================================================

/// One provider's answer to one item. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub run_id: RunId,
    pub item_id: ItemId,
    pub provider: ProviderKind,
    pub model: String,
    pub text: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl NormalizedResult {
    fn failed(run_id: RunId, item_id: ItemId, adapter: &ProviderAdapter, error: String, latency: Duration) -> Self {
        Self {
            run_id,
            item_id,
            provider: adapter.provider(),
            model: adapter.model().to_string(),
            text: String::new(),
            tokens_used: 0,
            latency_ms: latency.as_millis() as u64,
            success: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
}

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: usize,
    pub elapsed_secs: f64,
    /// Extrapolated from the completion rate so far
    pub estimated_remaining_secs: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(&RunProgress) + Send + Sync>;

/// Counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub providers: Vec<ProviderKind>,
    /// Items pending or processing when the run started
    pub total: usize,
    /// Items whose first provider finished
    pub completed: usize,
    /// Failed (item, provider) calls
    pub failed: usize,
    pub cancelled: bool,
}

/// What `run()` hands back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    /// Every recorded result, failed ones included, in completion order
    pub results: Vec<NormalizedResult>,
    pub elapsed: Duration,
}

impl RunOutcome {
    /// The consumer stream: successful results only.
    pub fn successful(&self) -> impl Iterator<Item = &NormalizedResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NormalizedResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Observability view of an orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub run_id: RunId,
    pub is_running: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_results: usize,
    pub successful_results: usize,
    pub providers: Vec<ProviderKind>,
    pub adapters: Vec<AdapterMetrics>,
}

/// Rate budget enforced per call when attached to a run.
#[derive(Clone)]
pub struct RunBudget {
    pub org: OrgId,
    pub limiter: Arc<RateLimiter>,
    /// Longest a task will wait for a provider request token
    pub max_wait: Duration,
}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

#[derive(Default)]
struct Shared {
    state: RunState,
    results: Vec<NormalizedResult>,
    /// Providers whose daily token scope ran dry during this run
    exhausted: HashMap<ProviderKind, DispatchError>,
}

/// Everything a dispatch task needs; cheap to clone.
#[derive(Clone)]
struct Inner {
    run_id: RunId,
    config: RunConfig,
    adapters: Vec<Arc<ProviderAdapter>>,
    context: Arc<dyn ChorusContext>,
    global: Arc<Semaphore>,
    per_provider: HashMap<ProviderKind, Arc<Semaphore>>,
    shared: Arc<Mutex<Shared>>,
    sink: Option<mpsc::Sender<NormalizedResult>>,
    budget: Option<RunBudget>,
    temperature: f32,
    max_tokens: u32,
}

/// Bounded-concurrency driver for one run.
pub struct Orchestrator {
    inner: Inner,
    running: AtomicBool,
    cancel: CancelHandle,
    progress: Option<ProgressCallback>,
}

impl Orchestrator {
    /// Creates an orchestrator over `adapters`, one per provider.
    ///
    /// The first adapter's provider decides when an item counts as
    /// completed.
    pub fn new(
        run_id: RunId,
        adapters: Vec<Arc<ProviderAdapter>>,
        config: RunConfig,
        context: Arc<dyn ChorusContext>,
    ) -> Result<Self> {
        config.validate()?;
        if adapters.is_empty() {
            return Err(DispatchError::validation("at least one provider is required"));
        }
        let mut seen = HashSet::new();
        for adapter in &adapters {
            if !seen.insert(adapter.provider()) {
                return Err(DispatchError::validation(format!(
                    "provider {} configured twice",
                    adapter.provider()
                )));
            }
        }

        let per_provider = adapters
            .iter()
            .map(|a| (a.provider(), Arc::new(Semaphore::new(config.max_concurrent_per_provider))))
            .collect();
        let providers = adapters.iter().map(|a| a.provider()).collect();

        Ok(Self {
            inner: Inner {
                run_id,
                global: Arc::new(Semaphore::new(config.max_concurrent_items)),
                per_provider,
                shared: Arc::new(Mutex::new(Shared {
                    state: RunState {
                        run_id,
                        providers,
                        ..Default::default()
                    },
                    ..Default::default()
                })),
                config,
                adapters,
                context,
                sink: None,
                budget: None,
                temperature: 0.7,
                max_tokens: 2048,
            },
            running: AtomicBool::new(false),
            cancel: CancelHandle::default(),
            progress: None,
        })
    }

    /// Streams each successful result to `sink` as it is recorded.
    pub fn with_sink(mut self, sink: mpsc::Sender<NormalizedResult>) -> Self {
        self.inner.sink = Some(sink);
        self
    }

    /// Enforces a rate budget on every call.
    ///
    /// A provider's `concurrent_requests` limit tightens its per-provider
    /// cap for this run.
    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        let cap = self.inner.config.max_concurrent_per_provider;
        for (provider, slots) in self.inner.per_provider.iter_mut() {
            if let Some(limits) = budget.limiter.policy().providers.get(provider) {
                *slots = Arc::new(Semaphore::new(cap.min(limits.concurrent_requests as usize)));
            }
        }
        self.inner.budget = Some(budget);
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.inner.temperature = temperature;
        self.inner.max_tokens = max_tokens;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    pub fn providers(&self) -> Vec<ProviderKind> {
        self.inner.adapters.iter().map(|a| a.provider()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stops the run after the batch in flight.
    pub fn cancel(&self) {
        info!(run_id = %self.inner.run_id, "Orchestrator cancellation requested");
        self.cancel.cancel();
    }

    /// Drives the queue until it is empty or the run is cancelled.
    pub async fn run(&self, queue: Arc<PromptQueue>) -> Result<RunOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::validation(format!(
                "run {} is already running",
                self.inner.run_id
            )));
        }
        let outcome = self.drive(queue).await;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn drive(&self, queue: Arc<PromptQueue>) -> Result<RunOutcome> {
        let inner = &self.inner;
        let started = inner.context.now();
        let stats = queue.stats().await;
        self.cancel.reset();
        {
            let mut shared = inner.shared.lock().unwrap();
            shared.results.clear();
            shared.exhausted.clear();
            shared.state.total = stats.pending + stats.processing;
            shared.state.completed = 0;
            shared.state.failed = 0;
            shared.state.cancelled = false;
        }

        info!(
            run_id = %inner.run_id,
            total = stats.pending + stats.processing,
            providers = ?self.providers(),
            "Starting orchestrator"
        );

        let mut reported = 0;
        while !self.cancel.is_cancelled() && !queue.is_empty().await {
            let batch = queue.get_batch(inner.config.batch_size).await;
            if batch.is_empty() {
                break;
            }
            if let Err(e) = self.dispatch_batch(&queue, batch).await {
                error!(run_id = %inner.run_id, error = %e, "Orchestrator failed");
                return Err(e);
            }

            let completed = inner.shared.lock().unwrap().state.completed;
            let interval = inner.config.progress_interval;
            if completed / interval > reported / interval {
                reported = completed;
                self.report(RunStatus::Running, started);
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let status = if cancelled { RunStatus::Cancelled } else { RunStatus::Completed };
        let (state, results) = {
            let mut shared = inner.shared.lock().unwrap();
            shared.state.cancelled = cancelled;
            (shared.state.clone(), shared.results.clone())
        };
        self.report(status, started);

        info!(
            run_id = %inner.run_id,
            completed = state.completed,
            failed = state.failed,
            total_responses = results.len(),
            cancelled,
            "Orchestrator finished"
        );

        Ok(RunOutcome {
            state,
            results,
            elapsed: inner.context.now().saturating_sub(started),
        })
    }

    async fn dispatch_batch(&self, queue: &Arc<PromptQueue>, batch: Vec<WorkItem>) -> Result<()> {
        let inner = Arc::new(self.inner.clone());
        let mut tasks = JoinSet::new();
        for item in batch {
            let item = Arc::new(item);
            for (index, adapter) in inner.adapters.iter().enumerate() {
                tasks.spawn(dispatch_one(
                    inner.clone(),
                    queue.clone(),
                    item.clone(),
                    adapter.clone(),
                    index == 0,
                ));
            }
        }

        // Let every task finish before surfacing a failure
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| DispatchError::Internal(format!("dispatch task failed: {}", e)));
            if let Err(e) = outcome.and_then(|r| r) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn report(&self, status: RunStatus, started: Duration) {
        let Some(callback) = &self.progress else { return };
        let elapsed = self.inner.context.now().saturating_sub(started).as_secs_f64();
        let progress = {
            let shared = self.inner.shared.lock().unwrap();
            let state = &shared.state;
            let estimated_remaining_secs = if state.completed > 0 && elapsed > 0.0 {
                let rate = state.completed as f64 / elapsed;
                let remaining = state.total.saturating_sub(state.completed) as f64;
                Some((remaining / rate) as u64)
            } else {
                None
            };
            RunProgress {
                run_id: self.inner.run_id,
                status,
                total: state.total,
                completed: state.completed,
                failed: state.failed,
                results: shared.results.len(),
                elapsed_secs: elapsed,
                estimated_remaining_secs,
            }
        };

        if catch_unwind(AssertUnwindSafe(|| callback(&progress))).is_err() {
            warn!(run_id = %self.inner.run_id, "Progress callback panicked");
        }
    }

    pub fn metrics(&self) -> OrchestratorMetrics {
        let shared = self.inner.shared.lock().unwrap();
        OrchestratorMetrics {
            run_id: self.inner.run_id,
            is_running: self.is_running(),
            total: shared.state.total,
            completed: shared.state.completed,
            failed: shared.state.failed,
            total_results: shared.results.len(),
            successful_results: shared.results.iter().filter(|r| r.success).count(),
            providers: shared.state.providers.clone(),
            adapters: self.inner.adapters.iter().map(|a| a.metrics()).collect(),
        }
    }

    /// Zeroes every adapter's rolling metrics.
    pub fn reset_metrics(&self) {
        for adapter in &self.inner.adapters {
            adapter.reset_metrics();
        }
    }
}

// =============================================================================
// ONE (ITEM, PROVIDER) TASK
// =============================================================================

async fn dispatch_one(
    inner: Arc<Inner>,
    queue: Arc<PromptQueue>,
    item: Arc<WorkItem>,
    adapter: Arc<ProviderAdapter>,
    marks_completion: bool,
) -> Result<()> {
    let result = call_provider(&inner, &item, &adapter).await;
    record(&inner, result).await;

    if marks_completion {
        inner.shared.lock().unwrap().state.completed += 1;
        queue.mark_completed(item.id).await?;
    }
    Ok(())
}

async fn call_provider(inner: &Inner, item: &WorkItem, adapter: &ProviderAdapter) -> NormalizedResult {
    let provider = adapter.provider();
    let started = inner.context.now();

    if let Some(budget) = &inner.budget {
        if let Err(e) = admit(inner, budget, provider).await {
            warn!(run_id = %inner.run_id, item_id = %item.id, provider = %provider, error = %e, "Call rejected by rate budget");
            return NormalizedResult::failed(inner.run_id, item.id, adapter, e.to_string(), Duration::ZERO);
        }
    }

    let response = {
        let Ok(_global) = inner.global.acquire().await else {
            return NormalizedResult::failed(inner.run_id, item.id, adapter, "dispatch closed".into(), Duration::ZERO);
        };
        let Some(slots) = inner.per_provider.get(&provider) else {
            return NormalizedResult::failed(inner.run_id, item.id, adapter, "provider not configured".into(), Duration::ZERO);
        };
        let Ok(_slot) = slots.acquire().await else {
            return NormalizedResult::failed(inner.run_id, item.id, adapter, "dispatch closed".into(), Duration::ZERO);
        };

        let request = QueryRequest::new(item.payload_text.clone(), provider)
            .with_temperature(inner.temperature)
            .with_max_tokens(inner.max_tokens);
        tokio::time::timeout(inner.config.per_call_timeout, adapter.query(&request)).await
    };

    let latency = inner.context.now().saturating_sub(started);
    match response {
        Ok(response) if response.success => {
            debug!(run_id = %inner.run_id, item_id = %item.id, provider = %provider, "Item processed");
            if let Some(budget) = &inner.budget {
                charge_tokens(inner, budget, provider, response.tokens_used).await;
            }
            NormalizedResult {
                run_id: inner.run_id,
                item_id: item.id,
                provider,
                model: response.model,
                text: response.text,
                tokens_used: response.tokens_used,
                latency_ms: response.latency.as_millis() as u64,
                success: true,
                error: None,
            }
        }
        Ok(response) => {
            let message = response.error.unwrap_or_else(|| "unknown provider error".into());
            let err = DispatchError::ProviderQuery {
                provider: provider.to_string(),
                message,
            };
            warn!(run_id = %inner.run_id, item_id = %item.id, provider = %provider, error = %err, "Provider query failed");
            NormalizedResult::failed(inner.run_id, item.id, adapter, err.to_string(), response.latency)
        }
        Err(_) => {
            let err = DispatchError::CallTimeout {
                provider: provider.to_string(),
                timeout_ms: inner.config.per_call_timeout.as_millis() as u64,
            };
            error!(run_id = %inner.run_id, item_id = %item.id, provider = %provider, error = %err, "Provider query timed out");
            NormalizedResult::failed(inner.run_id, item.id, adapter, err.to_string(), latency)
        }
    }
}

/// Checks the provider request scope, and fails fast once the daily token
/// scope has run dry for this run.
async fn admit(inner: &Inner, budget: &RunBudget, provider: ProviderKind) -> Result<()> {
    if let Some(err) = inner.shared.lock().unwrap().exhausted.get(&provider) {
        return Err(err.clone());
    }
    budget
        .limiter
        .acquire_or_wait(RateLimitScope::provider_request(budget.org, provider), 1, budget.max_wait)
        .await
        .map(|_| ())
}

async fn charge_tokens(inner: &Inner, budget: &RunBudget, provider: ProviderKind, tokens: u64) {
    match budget.limiter.check_daily_token_limit(budget.org, provider, tokens).await {
        Ok(decision) if decision.allowed => {}
        Ok(decision) => {
            warn!(run_id = %inner.run_id, provider = %provider, scope = %decision.scope, "Daily token budget exhausted");
            inner.shared.lock().unwrap().exhausted.insert(
                provider,
                DispatchError::RateLimitExceeded {
                    scope: decision.scope,
                    retry_after_secs: decision.retry_after.unwrap_or(1),
                },
            );
        }
        Err(e) => warn!(run_id = %inner.run_id, provider = %provider, error = %e, "Token accounting failed"),
    }
}

async fn record(inner: &Inner, result: NormalizedResult) {
    {
        let mut shared = inner.shared.lock().unwrap();
        if !result.success {
            shared.state.failed += 1;
        }
        shared.results.push(result.clone());
    }
    if result.success {
        if let Some(sink) = &inner.sink {
            if sink.send(result).await.is_err() {
                debug!(run_id = %inner.run_id, "Result sink closed");
            }
        }
    }
}
