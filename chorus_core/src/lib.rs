//! Chorus Core - rate-limited prompt dispatch across LLM providers
//!
//! A simulation run fans every queued prompt out to several providers:
//! 1. **Admission**: token buckets (`token_bucket`, `rate_limiter`) charge
//!    triggers, requests and tokens against per-org budgets
//! 2. **Work tracking**: a priority queue (`queue`) with a durable mirror
//!    (`queue_mirror`, `persistence`) that survives restarts
//! 3. **Execution**: provider adapters with retry (`provider`, `retry`,
//!    `http_backend`) driven by a bounded-concurrency `orchestrator`

pub mod config;
pub mod error;
pub mod http_backend;
pub mod orchestrator;
pub mod persistence;
pub mod provider;
pub mod queue;
pub mod queue_mirror;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod service;
pub mod token_bucket;

#[cfg(test)]
mod test_clock;

// Re-export key types for convenience
pub use config::{ChorusConfig, ProviderLimits, RateLimitPolicy, RetryPolicy, RunConfig, StoreBackend};
pub use error::{DispatchError, Result};
pub use orchestrator::{
    CancelHandle, NormalizedResult, Orchestrator, OrchestratorMetrics, RunBudget, RunOutcome, RunProgress,
    RunState, RunStatus,
};
pub use persistence::SledStore;
pub use provider::{ProviderAdapter, ProviderBackend, ProviderKind, QueryRequest, QueryResponse};
pub use queue::{PromptQueue, QueueStats, WorkItem};
pub use rate_limiter::{RateLimitScope, RateLimiter};
pub use registry::{AdapterRegistry, BackendFactory};
pub use service::{DispatchService, PoolStats, RunOptions};
pub use token_bucket::{BucketSpec, RateLimitDecision, TokenBucket};
