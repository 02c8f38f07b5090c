//! Configuration for runs, rate limits, retries, stores and providers.
//!
//! Every struct implements `Default` with the production values and is
//! `#[serde(default)]`, so a config file only needs the fields it changes:
//!
//! ```json
//! {
//!   "run": { "max_concurrent_items": 8, "per_call_timeout_secs": 60 },
//!   "rate_limits": { "triggers_per_hour": 10 },
//!   "store": { "backend": "sled", "path": "/var/lib/chorus" }
//! }
//! ```

use crate::error::{DispatchError, Result};
use crate::provider::ProviderKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// (De)serializes a `Duration` as fractional seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// =============================================================================
// RUN CONFIG
// =============================================================================

/// Bounds for one orchestrator run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Global cap on simultaneous in-flight (item, provider) calls
    pub max_concurrent_items: usize,

    /// Cap on simultaneous in-flight calls to any single provider
    pub max_concurrent_per_provider: usize,

    /// Timeout for one adapter call, retries included
    #[serde(rename = "per_call_timeout_secs", with = "duration_secs")]
    pub per_call_timeout: Duration,

    /// Items pulled from the queue per batch
    pub batch_size: usize,

    /// Progress callback fires every N completed items
    pub progress_interval: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 5,
            max_concurrent_per_provider: 10,
            per_call_timeout: Duration::from_secs(120),
            batch_size: 10,
            progress_interval: 5,
        }
    }
}

impl RunConfig {
    /// Rejects bounds that would stall or spin a run.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_items == 0 {
            return Err(DispatchError::validation("max_concurrent_items must be at least 1"));
        }
        if self.max_concurrent_per_provider == 0 {
            return Err(DispatchError::validation("max_concurrent_per_provider must be at least 1"));
        }
        if self.per_call_timeout.is_zero() {
            return Err(DispatchError::validation("per_call_timeout must be positive"));
        }
        if self.batch_size == 0 {
            return Err(DispatchError::validation("batch_size must be at least 1"));
        }
        if self.progress_interval == 0 {
            return Err(DispatchError::validation("progress_interval must be at least 1"));
        }
        Ok(())
    }
}

// =============================================================================
// RATE LIMITS
// =============================================================================

/// Per-provider request and token budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    /// Caps in-flight calls to the provider for runs with a rate budget
    pub concurrent_requests: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            concurrent_requests: 10,
        }
    }
}

impl ProviderLimits {
    /// Daily token ceiling derived from the per-minute budget.
    pub fn daily_token_limit(&self) -> u64 {
        self.tokens_per_minute * 60 * 24
    }
}

/// Rate-limit policy for every scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Simulation triggers allowed per hour per organization
    pub triggers_per_hour: u32,

    /// Limits per provider; a provider without an entry is unlimited
    pub providers: HashMap<ProviderKind, ProviderLimits>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(ProviderKind::OpenAi, ProviderLimits::default());
        providers.insert(ProviderKind::Google, ProviderLimits::default());
        providers.insert(
            ProviderKind::Anthropic,
            ProviderLimits {
                requests_per_minute: 50,
                tokens_per_minute: 80_000,
                concurrent_requests: 5,
            },
        );
        providers.insert(
            ProviderKind::Perplexity,
            ProviderLimits {
                requests_per_minute: 20,
                tokens_per_minute: 50_000,
                concurrent_requests: 3,
            },
        );
        Self {
            triggers_per_hour: 5,
            providers,
        }
    }
}

impl RateLimitPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.triggers_per_hour == 0 {
            return Err(DispatchError::validation("triggers_per_hour must be at least 1"));
        }
        for (provider, limits) in &self.providers {
            if limits.requests_per_minute == 0 || limits.tokens_per_minute == 0 || limits.concurrent_requests == 0 {
                return Err(DispatchError::validation(format!(
                    "rate limits for {} must be positive",
                    provider
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// RETRY
// =============================================================================

/// Backoff policy shared by every provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per query, the first one included
    pub max_attempts: u32,

    #[serde(rename = "base_backoff_secs", with = "duration_secs")]
    pub base_backoff: Duration,

    #[serde(rename = "min_backoff_secs", with = "duration_secs")]
    pub min_backoff: Duration,

    #[serde(rename = "max_backoff_secs", with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DispatchError::validation("retry.max_attempts must be at least 1"));
        }
        if self.min_backoff > self.max_backoff {
            return Err(DispatchError::validation("retry.min_backoff exceeds retry.max_backoff"));
        }
        Ok(())
    }
}

// =============================================================================
// STORE
// =============================================================================

/// Which shared store backs rate limits and queue mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// No shared store; everything is process-local
    None,
    /// In-process map shared by every component of this process
    Memory,
    /// Embedded sled database at `path`
    Sled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: None,
        }
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Which providers a run fans out to, and how they are queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: Vec<ProviderKind>,

    /// Model overrides; providers absent here use their default model
    pub models: HashMap<ProviderKind, String>,

    pub temperature: f32,
    pub max_tokens: u32,

    /// Perplexity is gated behind a feature flag
    pub perplexity_enabled: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: vec![ProviderKind::OpenAi, ProviderKind::Google, ProviderKind::Anthropic],
            models: HashMap::new(),
            temperature: 0.7,
            max_tokens: 2048,
            perplexity_enabled: false,
        }
    }
}

/// API keys for the HTTP backends.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub openai: Option<String>,
    pub google: Option<String>,
    pub anthropic: Option<String>,
    pub perplexity: Option<String>,
}

impl ProviderCredentials {
    /// Reads `OPENAI_API_KEY`, `GOOGLE_API_KEY`, `ANTHROPIC_API_KEY` and
    /// `PERPLEXITY_API_KEY`. Empty values count as missing.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            openai: read("OPENAI_API_KEY"),
            google: read("GOOGLE_API_KEY"),
            anthropic: read("ANTHROPIC_API_KEY"),
            perplexity: read("PERPLEXITY_API_KEY"),
        }
    }

    pub fn key_for(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::OpenAi => self.openai.as_deref(),
            ProviderKind::Google => self.google.as_deref(),
            ProviderKind::Anthropic => self.anthropic.as_deref(),
            ProviderKind::Perplexity => self.perplexity.as_deref(),
        }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

/// Everything a dispatch service needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusConfig {
    pub run: RunConfig,
    pub rate_limits: RateLimitPolicy,
    pub retry: RetryPolicy,
    pub store: StoreConfig,
    pub providers: ProviderSettings,

    /// Runs executing at once in one service
    pub max_concurrent_runs: usize,
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            rate_limits: RateLimitPolicy::default(),
            retry: RetryPolicy::default(),
            store: StoreConfig::default(),
            providers: ProviderSettings::default(),
            max_concurrent_runs: 5,
        }
    }
}

impl ChorusConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DispatchError::Config(format!("Invalid config JSON: {}", e)))
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.run.validate()?;
        self.rate_limits.validate()?;
        self.retry.validate()?;
        if self.max_concurrent_runs == 0 {
            return Err(DispatchError::validation("max_concurrent_runs must be at least 1"));
        }
        if self.store.backend == StoreBackend::Sled && self.store.path.is_none() {
            return Err(DispatchError::validation("store.path is required for the sled backend"));
        }
        if self.providers.enabled.is_empty() {
            return Err(DispatchError::validation("at least one provider must be enabled"));
        }
        Ok(())
    }

    /// Enabled providers, with Perplexity dropped unless its flag is on.
    pub fn active_providers(&self) -> Vec<ProviderKind> {
        self.providers
            .enabled
            .iter()
            .copied()
            .filter(|p| *p != ProviderKind::Perplexity || self.providers.perplexity_enabled)
            .collect()
    }
}
