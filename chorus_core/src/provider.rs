//! Provider Adapter boundary - the only call surface into external LLM APIs.
//!
//! A `ProviderAdapter` wraps one `ProviderBackend` (the raw HTTP client, or a
//! scripted stand-in in simulation) and gives the orchestrator a uniform
//! contract:
//!
//! - `query()` never returns an error; terminal failures come back as a
//!   `QueryResponse` with `success == false`
//! - each call is retried with exponential backoff (see `retry`)
//! - every adapter keeps rolling metrics for observability
//!
//! ```text
//!   Orchestrator ──query()──► ProviderAdapter ──complete()──► ProviderBackend
//!                              │ retry loop                    │ one attempt
//!                              │ metrics                       │ (HTTP / scripted)
//! ```

use crate::config::RetryPolicy;
use crate::retry::{retry_with_backoff, RetryOutcome};
use async_trait::async_trait;
use chorus_env::ChorusContext;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

/// Default system prompt for simulation queries.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about products and services.
When recommending or discussing brands, products, or companies:
- Be informative and balanced
- Mention relevant alternatives when appropriate
- Provide context for your recommendations
- Be honest about pros and cons";

/// The closed set of supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Google,
    Anthropic,
    Perplexity,
}

impl ProviderKind {
    /// Returns every provider.
    pub fn all() -> Vec<ProviderKind> {
        vec![
            ProviderKind::OpenAi,
            ProviderKind::Google,
            ProviderKind::Anthropic,
            ProviderKind::Perplexity,
        ]
    }

    /// Returns the provider's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Perplexity => "perplexity",
        }
    }

    /// Model used when the caller does not pick one.
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o",
            ProviderKind::Google => "gemini-1.5-flash",
            ProviderKind::Anthropic => "claude-3-5-sonnet-20241022",
            ProviderKind::Perplexity => "llama-3.1-sonar-large-128k-online",
        }
    }

    /// System prompt used when the request carries none.
    pub fn system_prompt(&self) -> String {
        match self {
            ProviderKind::Perplexity => format!("{}\n- Cite sources when available", DEFAULT_SYSTEM_PROMPT),
            _ => DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" => Ok(ProviderKind::OpenAi),
            "google" | "gemini" => Ok(ProviderKind::Google),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "perplexity" => Ok(ProviderKind::Perplexity),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

/// Request to query an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    pub provider: ProviderKind,
    /// Overrides the adapter's model when set
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl QueryRequest {
    /// Creates a request with default sampling parameters.
    pub fn new(text: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            text: text.into(),
            provider,
            model: None,
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: None,
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the completion length cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sets the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Response from a provider, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub provider: ProviderKind,
    pub model: String,
    pub text: String,
    pub tokens_used: u64,
    pub latency: Duration,
    pub success: bool,
    pub error: Option<String>,
    /// Attempts spent, including the successful one
    pub attempts: u32,
}

/// One completion produced by a backend.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub tokens_used: u64,
}

/// A single backend attempt failed.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Empty completion")]
    Empty,

    #[error("Missing API key for {0}")]
    MissingKey(ProviderKind),
}

impl BackendError {
    /// Returns false for failures that another attempt cannot fix.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BackendError::MissingKey(_))
    }
}

/// One raw attempt against a provider. No retries, no metrics.
#[async_trait]
pub trait ProviderBackend: Send + Sync + 'static {
    /// Performs exactly one completion call.
    async fn complete(
        &self,
        request: &QueryRequest,
        model: &str,
        system_prompt: &str,
    ) -> Result<Completion, BackendError>;
}

/// Rolling adapter metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterMetrics {
    pub provider: Option<ProviderKind>,
    pub model: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_attempts: u64,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
}

impl AdapterMetrics {
    /// Average latency of successful requests.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.successful_requests > 0 {
            self.total_latency_ms as f64 / self.successful_requests as f64
        } else {
            0.0
        }
    }

    /// Average tokens of successful requests.
    pub fn avg_tokens(&self) -> f64 {
        if self.successful_requests > 0 {
            self.total_tokens as f64 / self.successful_requests as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }
}

/// Retrying, metered wrapper around one provider backend.
pub struct ProviderAdapter {
    provider: ProviderKind,
    model: String,
    backend: Arc<dyn ProviderBackend>,
    retry: RetryPolicy,
    context: Arc<dyn ChorusContext>,
    metrics: Mutex<AdapterMetrics>,
}

impl ProviderAdapter {
    /// Creates an adapter. `model` falls back to the provider default.
    pub fn new(
        provider: ProviderKind,
        model: Option<String>,
        backend: Arc<dyn ProviderBackend>,
        retry: RetryPolicy,
        context: Arc<dyn ChorusContext>,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        Self {
            provider,
            metrics: Mutex::new(AdapterMetrics {
                provider: Some(provider),
                model: model.clone(),
                ..Default::default()
            }),
            model,
            backend,
            retry,
            context,
        }
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Queries the provider, retrying failed attempts with backoff.
    ///
    /// Never returns an error: after the last attempt the failure is
    /// folded into the response.
    pub async fn query(&self, request: &QueryRequest) -> QueryResponse {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());
        let system_prompt = request
            .system_prompt
            .clone()
            .unwrap_or_else(|| self.provider.system_prompt());
        let start = self.context.now();

        let model_ref: &str = &model;
        let system_ref: &str = &system_prompt;
        let outcome = retry_with_backoff(
            self.context.as_ref(),
            &self.retry,
            BackendError::is_retryable,
            |attempt| async move {
                debug!(provider = %self.provider, attempt, "Provider attempt");
                self.backend.complete(request, model_ref, system_ref).await
            },
        )
        .await;

        let latency = self.context.now().saturating_sub(start);
        self.finish(outcome, model, latency)
    }

    fn finish(
        &self,
        outcome: RetryOutcome<Completion, BackendError>,
        model: String,
        latency: Duration,
    ) -> QueryResponse {
        let latency_ms = latency.as_millis() as u64;
        let mut metrics = self.metrics.lock().unwrap();
        metrics.total_requests += 1;
        metrics.total_attempts += outcome.attempts as u64;

        match outcome.result {
            Ok(completion) => {
                metrics.successful_requests += 1;
                metrics.total_tokens += completion.tokens_used;
                metrics.total_latency_ms += latency_ms;
                info!(
                    provider = %self.provider,
                    model = %completion.model,
                    tokens = completion.tokens_used,
                    latency_ms,
                    "LLM query successful"
                );
                QueryResponse {
                    provider: self.provider,
                    model: completion.model,
                    text: completion.text,
                    tokens_used: completion.tokens_used,
                    latency,
                    success: true,
                    error: None,
                    attempts: outcome.attempts,
                }
            }
            Err(e) => {
                metrics.failed_requests += 1;
                error!(
                    provider = %self.provider,
                    model = %model,
                    attempts = outcome.attempts,
                    latency_ms,
                    error = %e,
                    "LLM query failed"
                );
                QueryResponse {
                    provider: self.provider,
                    model,
                    text: String::new(),
                    tokens_used: 0,
                    latency,
                    success: false,
                    error: Some(e.to_string()),
                    attempts: outcome.attempts,
                }
            }
        }
    }

    /// Snapshot of the rolling metrics.
    pub fn metrics(&self) -> AdapterMetrics {
        self.metrics.lock().unwrap().clone()
    }

    /// Zeroes the rolling metrics.
    pub fn reset_metrics(&self) {
        let mut metrics = self.metrics.lock().unwrap();
        *metrics = AdapterMetrics {
            provider: Some(self.provider),
            model: self.model.clone(),
            ..Default::default()
        };
    }

    /// Checks that the provider answers a tiny prompt.
    ///
    /// Bypasses retries and metrics.
    pub async fn health_check(&self) -> bool {
        let request = QueryRequest::new("Hello", self.provider).with_max_tokens(10);
        let system_prompt = self.provider.system_prompt();
        self.backend
            .complete(&request, &self.model, &system_prompt)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_env::TokioContext;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` attempts, then answers.
    struct CountingBackend {
        failures: u32,
        calls: AtomicU32,
        error: BackendError,
    }

    impl CountingBackend {
        fn new(failures: u32) -> Self {
            Self { failures, calls: AtomicU32::new(0), error: BackendError::Transport("reset".into()) }
        }
    }

    #[async_trait]
    impl ProviderBackend for CountingBackend {
        async fn complete(&self, request: &QueryRequest, model: &str, _system: &str) -> Result<Completion, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            Ok(Completion {
                text: format!("answer to {}", request.text),
                model: model.to_string(),
                tokens_used: 42,
            })
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn adapter(backend: Arc<CountingBackend>) -> ProviderAdapter {
        ProviderAdapter::new(ProviderKind::OpenAi, None, backend, fast_retry(), TokioContext::shared())
    }

    #[tokio::test]
    async fn test_query_success() {
        let backend = Arc::new(CountingBackend::new(0));
        let adapter = adapter(backend.clone());

        let response = adapter.query(&QueryRequest::new("best crm?", ProviderKind::OpenAi)).await;

        assert!(response.success);
        assert_eq!(response.text, "answer to best crm?");
        assert_eq!(response.model, "gpt-4o");
        assert_eq!(response.tokens_used, 42);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_query_recovers_after_transient_failures() {
        let backend = Arc::new(CountingBackend::new(2));
        let adapter = adapter(backend.clone());

        let response = adapter.query(&QueryRequest::new("q", ProviderKind::OpenAi)).await;

        assert!(response.success);
        assert_eq!(response.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_query_failure_is_folded_into_response() {
        let backend = Arc::new(CountingBackend::new(10));
        let adapter = adapter(backend.clone());

        let response = adapter.query(&QueryRequest::new("q", ProviderKind::OpenAi)).await;

        assert!(!response.success);
        assert!(response.text.is_empty());
        assert!(response.error.as_deref().unwrap().contains("reset"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_retried() {
        let backend = Arc::new(CountingBackend {
            failures: 10,
            calls: AtomicU32::new(0),
            error: BackendError::MissingKey(ProviderKind::OpenAi),
        });
        let adapter = adapter(backend.clone());

        let response = adapter.query(&QueryRequest::new("q", ProviderKind::OpenAi)).await;

        assert!(!response.success);
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_get_metrics() {
        let adapter = adapter(Arc::new(CountingBackend::new(0)));
        adapter.query(&QueryRequest::new("a", ProviderKind::OpenAi)).await;
        adapter.query(&QueryRequest::new("b", ProviderKind::OpenAi)).await;

        let metrics = adapter.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.total_tokens, 84);
        assert_eq!(metrics.avg_tokens(), 42.0);
        assert_eq!(metrics.success_rate(), 1.0);

        adapter.reset_metrics();
        assert_eq!(adapter.metrics().total_requests, 0);
        assert_eq!(adapter.metrics().model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(adapter(Arc::new(CountingBackend::new(0))).health_check().await);
        assert!(!adapter(Arc::new(CountingBackend::new(1))).health_check().await);
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_perplexity_prompt_asks_for_sources() {
        assert!(ProviderKind::Perplexity.system_prompt().contains("Cite sources"));
        assert!(!ProviderKind::OpenAi.system_prompt().contains("Cite sources"));
    }
}
