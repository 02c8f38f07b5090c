//! Named rate-limit scopes composed from token buckets.
//!
//! | scope              | key                                  | bucket                          |
//! |--------------------|--------------------------------------|---------------------------------|
//! | `Trigger`          | `simulation:{org}`                   | triggers/hour, refilled hourly  |
//! | `ProviderRequest`  | `llm:{org}:{provider}`               | requests/min, refilled per min  |
//! | `DailyTokens`      | `tokens:{org}:{provider}:daily`      | tpm * 60 * 24, refilled daily   |
//!
//! Buckets are created on first use and live as long as the limiter. A
//! provider with no configured limits is never throttled.

use crate::config::RateLimitPolicy;
use crate::error::{DispatchError, Result};
use crate::provider::ProviderKind;
use crate::token_bucket::{BucketSpec, RateLimitDecision, TokenBucket};
use chorus_env::{ChorusContext, KvStore, OrgId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Trigger,
    ProviderRequest,
    DailyTokens,
}

/// One rate-limited scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitScope {
    pub kind: ScopeKind,
    pub org: OrgId,
    /// Set for the per-provider scopes
    pub provider: Option<ProviderKind>,
}

impl RateLimitScope {
    pub fn trigger(org: OrgId) -> Self {
        Self {
            kind: ScopeKind::Trigger,
            org,
            provider: None,
        }
    }

    pub fn provider_request(org: OrgId, provider: ProviderKind) -> Self {
        Self {
            kind: ScopeKind::ProviderRequest,
            org,
            provider: Some(provider),
        }
    }

    pub fn daily_tokens(org: OrgId, provider: ProviderKind) -> Self {
        Self {
            kind: ScopeKind::DailyTokens,
            org,
            provider: Some(provider),
        }
    }

    /// Store key of the backing bucket.
    pub fn key(&self) -> String {
        match (self.kind, self.provider) {
            (ScopeKind::Trigger, _) => format!("simulation:{}", self.org),
            (ScopeKind::ProviderRequest, Some(p)) => format!("llm:{}:{}", self.org, p),
            (ScopeKind::DailyTokens, Some(p)) => format!("tokens:{}:{}:daily", self.org, p),
            (_, None) => format!("simulation:{}", self.org),
        }
    }

    /// Bucket shape under `policy`, or `None` if the scope is unlimited.
    fn bucket_spec(&self, policy: &RateLimitPolicy) -> Option<BucketSpec> {
        match self.kind {
            ScopeKind::Trigger => Some(BucketSpec::per_interval(policy.triggers_per_hour as u64, HOUR)),
            ScopeKind::ProviderRequest => {
                let limits = policy.providers.get(&self.provider?)?;
                Some(BucketSpec::per_interval(limits.requests_per_minute as u64, MINUTE))
            }
            ScopeKind::DailyTokens => {
                let limits = policy.providers.get(&self.provider?)?;
                Some(BucketSpec::per_interval(limits.daily_token_limit(), DAY))
            }
        }
    }
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Observability view of one active scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: RateLimitScope,
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the scope is full again
    pub reset_at: f64,
    pub is_limited: bool,
    /// Answered from the local fallback
    pub degraded: bool,
}

/// Per-process rate limiter over every scope.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    context: Arc<dyn ChorusContext>,
    store: Option<Arc<dyn KvStore>>,
    buckets: Mutex<HashMap<RateLimitScope, Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// Creates a limiter. Buckets share `store` when one is given.
    pub fn new(
        policy: RateLimitPolicy,
        context: Arc<dyn ChorusContext>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            context,
            store,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    fn bucket(&self, scope: &RateLimitScope) -> Result<Option<Arc<TokenBucket>>> {
        let Some(spec) = scope.bucket_spec(&self.policy) else {
            return Ok(None);
        };
        let mut buckets = self.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get(scope) {
            return Ok(Some(bucket.clone()));
        }
        let bucket = Arc::new(TokenBucket::new(
            scope.key(),
            spec,
            self.context.clone(),
            self.store.clone(),
        )?);
        buckets.insert(*scope, bucket.clone());
        Ok(Some(bucket))
    }

    /// Takes `tokens` from `scope`.
    pub async fn check(&self, scope: RateLimitScope, tokens: u64) -> Result<RateLimitDecision> {
        match self.bucket(&scope)? {
            Some(bucket) => Ok(bucket.acquire(tokens).await),
            None => Ok(RateLimitDecision::unlimited(scope.key(), self.context.unix_secs())),
        }
    }

    /// One simulation trigger for `org`.
    pub async fn check_trigger_limit(&self, org: OrgId) -> Result<RateLimitDecision> {
        self.check(RateLimitScope::trigger(org), 1).await
    }

    /// One request from `org` to `provider`.
    pub async fn check_provider_limit(&self, org: OrgId, provider: ProviderKind) -> Result<RateLimitDecision> {
        self.check(RateLimitScope::provider_request(org, provider), 1).await
    }

    /// Charges `tokens` against the daily token ceiling of (`org`, `provider`).
    pub async fn check_daily_token_limit(
        &self,
        org: OrgId,
        provider: ProviderKind,
        tokens: u64,
    ) -> Result<RateLimitDecision> {
        self.check(RateLimitScope::daily_tokens(org, provider), tokens).await
    }

    /// Current state of every scope of `org` touched so far.
    pub async fn snapshot(&self, org: OrgId) -> Vec<ScopeSnapshot> {
        let mut active: Vec<(RateLimitScope, Arc<TokenBucket>)> = {
            let buckets = self.buckets.lock().unwrap();
            buckets
                .iter()
                .filter(|(scope, _)| scope.org == org)
                .map(|(scope, bucket)| (*scope, bucket.clone()))
                .collect()
        };
        active.sort_by_key(|(scope, _)| scope.key());

        let now = self.context.unix_secs();
        let mut snapshots = Vec::with_capacity(active.len());
        for (scope, bucket) in active {
            let info = bucket.info().await;
            let spec = bucket.spec();
            let missing = (info.capacity as f64 - info.current_tokens).max(0.0);
            snapshots.push(ScopeSnapshot {
                key: info.key,
                limit: info.capacity,
                remaining: info.current_tokens.floor() as u64,
                reset_at: now + missing / spec.refill_rate * spec.refill_interval.as_secs_f64(),
                is_limited: info.current_tokens < 1.0,
                degraded: bucket.is_degraded(),
                scope,
            });
        }
        snapshots
    }

    /// Waits out a denial if it clears within `max_wait`, otherwise rejects.
    ///
    /// The wait does not re-acquire; the caller proceeds as if admitted.
    pub async fn wait_or_reject(&self, decision: &RateLimitDecision, max_wait: Duration) -> Result<()> {
        if decision.allowed {
            return Ok(());
        }
        let retry_after = decision.retry_after.unwrap_or(1);
        if Duration::from_secs(retry_after) <= max_wait {
            info!(scope = %decision.scope, retry_after, "Waiting for rate limit reset");
            self.context.sleep(Duration::from_secs(retry_after)).await;
            return Ok(());
        }
        Err(DispatchError::RateLimitExceeded {
            scope: decision.scope.clone(),
            retry_after_secs: retry_after,
        })
    }

    /// Takes `tokens` from `scope`, waiting out denials for at most
    /// `max_wait` in total.
    ///
    /// Every wake-up re-checks the bucket, so concurrent waiters are only
    /// admitted as fast as the scope refills.
    pub async fn acquire_or_wait(
        &self,
        scope: RateLimitScope,
        tokens: u64,
        max_wait: Duration,
    ) -> Result<RateLimitDecision> {
        let mut budget = max_wait;
        loop {
            let decision = self.check(scope, tokens).await?;
            if decision.allowed {
                return Ok(decision);
            }
            self.wait_or_reject(&decision, budget).await?;
            budget = budget.saturating_sub(Duration::from_secs(decision.retry_after.unwrap_or(1)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderLimits;
    use crate::test_clock::ManualClock;
    use chorus_env::MemoryStore;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(RateLimitPolicy::default(), clock, Some(MemoryStore::shared())).unwrap()
    }

    #[tokio::test]
    async fn test_trigger_scope_isolation() {
        let limiter = limiter(ManualClock::shared());
        let org_a = OrgId::from_seed(1);
        let org_b = OrgId::from_seed(2);

        for _ in 0..5 {
            assert!(limiter.check_trigger_limit(org_a).await.unwrap().allowed);
        }
        let sixth = limiter.check_trigger_limit(org_a).await.unwrap();
        assert!(!sixth.allowed);
        assert!(sixth.retry_after.unwrap() > 0);

        assert!(limiter.check_trigger_limit(org_b).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_provider_scopes_are_independent() {
        let mut policy = RateLimitPolicy::default();
        policy.providers.insert(
            ProviderKind::Perplexity,
            ProviderLimits {
                requests_per_minute: 1,
                ..Default::default()
            },
        );
        let limiter = RateLimiter::new(policy, ManualClock::shared(), None).unwrap();
        let org = OrgId::from_seed(7);

        assert!(limiter.check_provider_limit(org, ProviderKind::Perplexity).await.unwrap().allowed);
        assert!(!limiter.check_provider_limit(org, ProviderKind::Perplexity).await.unwrap().allowed);
        assert!(limiter.check_provider_limit(org, ProviderKind::OpenAi).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_unlimited() {
        let mut policy = RateLimitPolicy::default();
        policy.providers.remove(&ProviderKind::Google);
        let limiter = RateLimiter::new(policy, ManualClock::shared(), None).unwrap();
        let org = OrgId::from_seed(3);

        for _ in 0..500 {
            assert!(limiter.check_provider_limit(org, ProviderKind::Google).await.unwrap().allowed);
        }
        assert!(limiter.snapshot(org).await.is_empty());
    }

    #[tokio::test]
    async fn test_daily_token_ceiling() {
        let limiter = limiter(ManualClock::shared());
        let org = OrgId::from_seed(4);
        let ceiling = ProviderLimits::default().daily_token_limit();

        let first = limiter
            .check_daily_token_limit(org, ProviderKind::OpenAi, ceiling - 10)
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 10);

        let over = limiter.check_daily_token_limit(org, ProviderKind::OpenAi, 11).await.unwrap();
        assert!(!over.allowed);
        assert_eq!(over.scope, format!("tokens:{}:openai:daily", org));
    }

    #[tokio::test]
    async fn test_wait_or_reject() {
        let clock = ManualClock::shared();
        let limiter = limiter(clock.clone());
        let org = OrgId::from_seed(5);

        for _ in 0..5 {
            limiter.check_trigger_limit(org).await.unwrap();
        }
        let denied = limiter.check_trigger_limit(org).await.unwrap();
        assert_eq!(denied.retry_after, Some(720));

        let err = limiter
            .wait_or_reject(&denied, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.retry_after_secs(), Some(720));
        assert_eq!(clock.now(), Duration::ZERO);

        limiter
            .wait_or_reject(&denied, Duration::from_secs(900))
            .await
            .unwrap();
        assert_eq!(clock.now(), Duration::from_secs(720));
        assert!(limiter.check_trigger_limit(org).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_acquire_or_wait_charges_every_admission() {
        let clock = ManualClock::frozen();
        let mut policy = RateLimitPolicy::default();
        policy.providers.insert(
            ProviderKind::OpenAi,
            ProviderLimits {
                requests_per_minute: 2,
                ..Default::default()
            },
        );
        let limiter = Arc::new(RateLimiter::new(policy, clock.clone(), None).unwrap());
        let org = OrgId::from_seed(11);
        let scope = RateLimitScope::provider_request(org, ProviderKind::OpenAi);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            tasks.spawn(async move {
                limiter.acquire_or_wait(scope, 1, Duration::from_secs(120)).await.is_ok()
            });
        }
        let mut admitted = 0u64;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap() {
                admitted += 1;
            }
        }

        // No time passes, so nothing refills past the initial 2
        assert_eq!(clock.now(), Duration::ZERO);
        assert_eq!(admitted, 2);
    }

    #[tokio::test]
    async fn test_acquire_or_wait_gives_up_when_wait_exceeds_budget() {
        let clock = ManualClock::shared();
        let limiter = limiter(clock.clone());
        let org = OrgId::from_seed(12);
        for _ in 0..5 {
            limiter.check_trigger_limit(org).await.unwrap();
        }

        let err = limiter
            .acquire_or_wait(RateLimitScope::trigger(org), 1, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimitExceeded { .. }));
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_snapshot_lists_active_scopes() {
        let limiter = limiter(ManualClock::shared());
        let org = OrgId::from_seed(6);
        let other = OrgId::from_seed(60);

        limiter.check_trigger_limit(org).await.unwrap();
        limiter.check_provider_limit(org, ProviderKind::Anthropic).await.unwrap();
        limiter.check_trigger_limit(other).await.unwrap();

        let snapshot = limiter.snapshot(org).await;
        assert_eq!(snapshot.len(), 2);

        let anthropic = snapshot
            .iter()
            .find(|s| s.scope.kind == ScopeKind::ProviderRequest)
            .unwrap();
        assert_eq!(anthropic.limit, 50);
        assert_eq!(anthropic.remaining, 49);
        assert!(!anthropic.is_limited);
    }

    #[test]
    fn test_scope_keys() {
        let org = OrgId::from_seed(9);
        assert_eq!(RateLimitScope::trigger(org).key(), format!("simulation:{}", org));
        assert_eq!(
            RateLimitScope::provider_request(org, ProviderKind::Anthropic).key(),
            format!("llm:{}:anthropic", org)
        );
    }
}
