//! Dispatch service - the per-process owner of shared dispatch state.
//!
//! Holds the store, the rate limiter and the adapter registry, and bounds
//! how many runs execute at once.
//!
//! ```text
//!   create_run(id) ──► trigger limit ──► Orchestrator (registered)
//!   run(id, queue) ──► runs slot ──► Orchestrator::run ──► unregistered
//! ```

use crate::config::{ChorusConfig, ProviderCredentials, StoreBackend};
use crate::error::{DispatchError, Result};
use crate::orchestrator::{NormalizedResult, Orchestrator, ProgressCallback, RunBudget, RunOutcome};
use crate::persistence::SledStore;
use crate::provider::ProviderKind;
use crate::queue::PromptQueue;
use crate::rate_limiter::RateLimiter;
use crate::registry::{AdapterRegistry, BackendFactory, HttpBackendFactory};
use chorus_env::{ChorusContext, KvStore, MemoryStore, OrgId, RunId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

/// Per-run knobs for `create_run`.
#[derive(Default)]
pub struct RunOptions {
    /// Owning organization; enables trigger and per-call budgets
    pub org: Option<OrgId>,
    /// Overrides the configured provider list
    pub providers: Option<Vec<ProviderKind>>,
    pub progress: Option<ProgressCallback>,
    pub sink: Option<mpsc::Sender<NormalizedResult>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_concurrent: usize,
    pub active: usize,
    pub available_slots: usize,
}

pub struct DispatchService {
    config: ChorusConfig,
    context: Arc<dyn ChorusContext>,
    store: Option<Arc<dyn KvStore>>,
    limiter: Arc<RateLimiter>,
    registry: AdapterRegistry,
    slots: Semaphore,
    runs: Mutex<HashMap<RunId, Arc<Orchestrator>>>,
}

impl DispatchService {
    pub fn new(
        config: ChorusConfig,
        context: Arc<dyn ChorusContext>,
        store: Option<Arc<dyn KvStore>>,
        factory: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limits.clone(),
            context.clone(),
            store.clone(),
        )?);
        let registry = AdapterRegistry::new(factory, config.retry.clone(), context.clone());
        Ok(Self {
            slots: Semaphore::new(config.max_concurrent_runs),
            config,
            context,
            store,
            limiter,
            registry,
            runs: Mutex::new(HashMap::new()),
        })
    }

    /// Builds a service talking to the real provider APIs, with the store
    /// selected by `config.store` and keys read from the environment.
    pub fn from_config(config: ChorusConfig, context: Arc<dyn ChorusContext>) -> Result<Self> {
        config.validate()?;
        let store: Option<Arc<dyn KvStore>> = match config.store.backend {
            StoreBackend::None => None,
            StoreBackend::Memory => Some(MemoryStore::shared()),
            StoreBackend::Sled => {
                let path = config
                    .store
                    .path
                    .clone()
                    .ok_or_else(|| DispatchError::validation("store.path is required for the sled backend"))?;
                Some(Arc::new(SledStore::open(path)?))
            }
        };

        let credentials = ProviderCredentials::from_env();
        let available = AdapterRegistry::available(&credentials);
        for provider in config.active_providers() {
            if !available.contains(&provider) {
                warn!(provider = %provider, "No API key configured for provider");
            }
        }

        let factory = Arc::new(HttpBackendFactory::new(credentials, config.run.per_call_timeout));
        Self::new(config, context, store, factory)
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> Option<&Arc<dyn KvStore>> {
        self.store.as_ref()
    }

    /// Opens the queue for a run, recovering it from the store if one is
    /// configured.
    pub async fn open_queue(&self, run_id: RunId) -> Result<Arc<PromptQueue>> {
        let queue = match &self.store {
            Some(store) => PromptQueue::recover(run_id, store.clone()).await?,
            None => PromptQueue::new(run_id, None),
        };
        Ok(Arc::new(queue))
    }

    /// Registers an orchestrator for `run_id`.
    ///
    /// With an org, the trigger scope is charged once here and every call
    /// of the run is checked against that org's provider budgets.
    pub async fn create_run(&self, run_id: RunId, options: RunOptions) -> Result<Arc<Orchestrator>> {
        if self.runs.lock().unwrap().contains_key(&run_id) {
            return Err(DispatchError::validation(format!("run {} already exists", run_id)));
        }

        if let Some(org) = options.org {
            let decision = self.limiter.check_trigger_limit(org).await?;
            if !decision.allowed {
                return Err(DispatchError::RateLimitExceeded {
                    scope: decision.scope,
                    retry_after_secs: decision.retry_after.unwrap_or(1),
                });
            }
        }

        let providers = options.providers.unwrap_or_else(|| self.config.active_providers());
        let adapters = self.registry.adapters_for(&providers, &self.config.providers.models)?;
        let mut orchestrator = Orchestrator::new(run_id, adapters, self.config.run.clone(), self.context.clone())?
            .with_sampling(self.config.providers.temperature, self.config.providers.max_tokens);
        if let Some(org) = options.org {
            orchestrator = orchestrator.with_budget(RunBudget {
                org,
                limiter: self.limiter.clone(),
                max_wait: self.config.run.per_call_timeout,
            });
        }
        if let Some(progress) = options.progress {
            orchestrator = orchestrator.with_progress(progress);
        }
        if let Some(sink) = options.sink {
            orchestrator = orchestrator.with_sink(sink);
        }

        let orchestrator = Arc::new(orchestrator);
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run_id) {
            return Err(DispatchError::validation(format!("run {} already exists", run_id)));
        }
        runs.insert(run_id, orchestrator.clone());
        info!(run_id = %run_id, providers = ?providers, "Created run");
        Ok(orchestrator)
    }

    /// Runs a registered orchestrator once a run slot frees up. The run is
    /// unregistered afterwards whatever the outcome.
    pub async fn run(&self, run_id: RunId, queue: Arc<PromptQueue>) -> Result<RunOutcome> {
        let orchestrator = self
            .runs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| DispatchError::validation(format!("run {} not found", run_id)))?;

        let outcome = match self.slots.acquire().await {
            Ok(_slot) => orchestrator.run(queue).await,
            Err(e) => Err(DispatchError::Internal(format!("run slots closed: {}", e))),
        };
        self.runs.lock().unwrap().remove(&run_id);
        outcome
    }

    /// Requests cancellation of a registered run. False if unknown.
    pub fn cancel_run(&self, run_id: RunId) -> bool {
        match self.runs.lock().unwrap().get(&run_id) {
            Some(orchestrator) => {
                orchestrator.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs.lock().unwrap().keys().copied().collect()
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            max_concurrent: self.config.max_concurrent_runs,
            active: self.runs.lock().unwrap().len(),
            available_slots: self.slots.available_permits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BackendError, Completion, ProviderBackend, QueryRequest};
    use crate::queue::WorkItem;
    use crate::test_clock::ManualClock;
    use async_trait::async_trait;
    use chorus_env::ItemId;

    struct EchoBackend;

    #[async_trait]
    impl ProviderBackend for EchoBackend {
        async fn complete(
            &self,
            request: &QueryRequest,
            model: &str,
            _system_prompt: &str,
        ) -> std::result::Result<Completion, BackendError> {
            Ok(Completion {
                text: request.text.to_uppercase(),
                model: model.to_string(),
                tokens_used: 3,
            })
        }
    }

    struct EchoFactory;

    impl BackendFactory for EchoFactory {
        fn backend(&self, _provider: ProviderKind, _model: &str) -> Result<Arc<dyn ProviderBackend>> {
            Ok(Arc::new(EchoBackend))
        }
    }

    fn service(config: ChorusConfig) -> DispatchService {
        DispatchService::new(config, ManualClock::shared(), Some(MemoryStore::shared()), Arc::new(EchoFactory)).unwrap()
    }

    async fn fill(queue: &PromptQueue, n: u64) {
        for seed in 0..n {
            queue.add(WorkItem::new(ItemId::from_seed(seed), format!("q{}", seed))).await;
        }
    }

    #[tokio::test]
    async fn test_create_and_run() {
        let service = service(ChorusConfig::default());
        let run_id = RunId::from_seed(1);
        service.create_run(run_id, RunOptions::default()).await.unwrap();
        assert_eq!(service.active_runs(), vec![run_id]);

        let queue = service.open_queue(run_id).await.unwrap();
        fill(&queue, 3).await;
        let outcome = service.run(run_id, queue).await.unwrap();

        assert_eq!(outcome.state.completed, 3);
        assert_eq!(outcome.successful().count(), 9);
        assert!(service.active_runs().is_empty());
        assert_eq!(service.pool_stats().available_slots, 5);
    }

    #[tokio::test]
    async fn test_duplicate_run_rejected() {
        let service = service(ChorusConfig::default());
        let run_id = RunId::from_seed(2);
        service.create_run(run_id, RunOptions::default()).await.unwrap();
        let again = service.create_run(run_id, RunOptions::default()).await;
        assert!(matches!(again, Err(DispatchError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let service = service(ChorusConfig::default());
        let queue = Arc::new(PromptQueue::new(RunId::from_seed(3), None));
        assert!(service.run(RunId::from_seed(3), queue).await.is_err());
        assert!(!service.cancel_run(RunId::from_seed(3)));
    }

    #[tokio::test]
    async fn test_trigger_limit_per_org() {
        let mut config = ChorusConfig::default();
        config.rate_limits.triggers_per_hour = 1;
        let service = service(config);
        let org = OrgId::from_seed(9);
        let options = || RunOptions {
            org: Some(org),
            ..Default::default()
        };

        service.create_run(RunId::from_seed(1), options()).await.unwrap();
        let second = service.create_run(RunId::from_seed(2), options()).await;
        assert!(matches!(second, Err(DispatchError::RateLimitExceeded { .. })));

        // Another org has its own budget
        service
            .create_run(
                RunId::from_seed(3),
                RunOptions {
                    org: Some(OrgId::from_seed(10)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_stats_and_cancel() {
        let service = service(ChorusConfig::default());
        service
            .create_run(
                RunId::from_seed(4),
                RunOptions {
                    providers: Some(vec![ProviderKind::Anthropic]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = service.pool_stats();
        assert_eq!(stats.max_concurrent, 5);
        assert_eq!(stats.active, 1);
        assert!(service.cancel_run(RunId::from_seed(4)));
    }

    #[tokio::test]
    async fn test_queue_reopened_from_store() {
        let service = service(ChorusConfig::default());
        let run_id = RunId::from_seed(5);
        let queue = service.open_queue(run_id).await.unwrap();
        fill(&queue, 2).await;
        drop(queue);

        let reopened = service.open_queue(run_id).await.unwrap();
        assert_eq!(reopened.stats().await.pending, 2);
    }
}
