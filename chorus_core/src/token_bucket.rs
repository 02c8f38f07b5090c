//! Token bucket with a shared-store backend and a local fallback.
//!
//! Refill is lazy: nothing runs in the background, the level is brought up
//! to date whenever the bucket is touched.
//!
//! ```text
//! tokens = min(capacity, tokens + elapsed / refill_interval * refill_rate)
//!
//!   acquire(n) ──► shared store reachable? ──yes──► read-modify-write ratelimit:{key}
//!                         │
//!                         no  (warn once, flag degraded)
//!                         ▼
//!                  local in-process bucket
//! ```
//!
//! Callers never see a store error. While the store is down the decision
//! is only accurate for this process; the transition into and out of that
//! mode is logged and exposed through `is_degraded()`.

use crate::error::{DispatchError, Result};
use chorus_env::{ChorusContext, EnvError, KvStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Slack for float drift when comparing a refilled level to a request.
const LEVEL_EPSILON: f64 = 1e-6;

/// Minimum lifetime of a bucket key in the shared store.
const MIN_STORE_TTL: Duration = Duration::from_secs(3600);

/// Shape of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub capacity: u64,
    /// Tokens added per `refill_interval`
    pub refill_rate: f64,
    pub refill_interval: Duration,
}

impl BucketSpec {
    /// `capacity` tokens, fully refilled once per `interval`.
    pub fn per_interval(capacity: u64, interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate: capacity as f64,
            refill_interval: interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(DispatchError::validation("bucket capacity must be positive"));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(DispatchError::validation("bucket refill_rate must be positive"));
        }
        if self.refill_interval.is_zero() {
            return Err(DispatchError::validation("bucket refill_interval must be positive"));
        }
        Ok(())
    }

    /// Seconds needed to accumulate `deficit` tokens.
    fn seconds_for(&self, deficit: f64) -> f64 {
        deficit / self.refill_rate * self.refill_interval.as_secs_f64()
    }

    /// Tokens accumulated over `seconds`.
    fn seconds_to_tokens(&self, seconds: f64) -> f64 {
        seconds / self.refill_interval.as_secs_f64() * self.refill_rate
    }
}

/// Outcome of one `acquire`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    /// Bucket key the decision came from
    pub scope: String,
    pub allowed: bool,
    /// Whole tokens left after this call
    pub remaining: u64,
    pub limit: u64,
    /// Unix seconds at which the bucket will be full again
    pub reset_at: f64,
    /// Whole seconds to wait before the same request can succeed
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    /// Decision for a scope that has no configured limit.
    pub fn unlimited(scope: impl Into<String>, now: f64) -> Self {
        Self {
            scope: scope.into(),
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            reset_at: now,
            retry_after: None,
        }
    }
}

/// Snapshot of a bucket for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub key: String,
    pub capacity: u64,
    pub current_tokens: f64,
    pub refill_rate: f64,
    pub refill_interval_secs: f64,
}

#[derive(Debug, Clone, Copy)]
struct Level {
    tokens: f64,
    last_update: f64,
}

/// Token bucket keyed by scope.
pub struct TokenBucket {
    key: String,
    spec: BucketSpec,
    context: Arc<dyn ChorusContext>,
    store: Option<Arc<dyn KvStore>>,
    /// Local level; also serializes acquires from this process
    local: Mutex<Level>,
    degraded: AtomicBool,
}

impl TokenBucket {
    /// Creates a full bucket. Without a store it is purely local.
    pub fn new(
        key: impl Into<String>,
        spec: BucketSpec,
        context: Arc<dyn ChorusContext>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        spec.validate()?;
        let now = context.unix_secs();
        Ok(Self {
            key: key.into(),
            local: Mutex::new(Level {
                tokens: spec.capacity as f64,
                last_update: now,
            }),
            spec,
            context,
            store,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn spec(&self) -> &BucketSpec {
        &self.spec
    }

    /// True while the shared store is unreachable and the local bucket
    /// is answering instead.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn store_key(&self) -> String {
        format!("ratelimit:{}", self.key)
    }

    /// Keys outlive a full refill so an idle bucket does not reset early.
    fn store_ttl(&self) -> Duration {
        let full = Duration::from_secs_f64(self.spec.seconds_for(self.spec.capacity as f64).ceil());
        full.max(MIN_STORE_TTL)
    }

    fn refill(&self, level: Level, now: f64) -> f64 {
        let elapsed = (now - level.last_update).max(0.0);
        let refilled = level.tokens + self.spec.seconds_to_tokens(elapsed);
        refilled.clamp(0.0, self.spec.capacity as f64)
    }

    /// Tries to take `tokens` from the bucket.
    pub async fn acquire(&self, tokens: u64) -> RateLimitDecision {
        let mut local = self.local.lock().await;
        let now = self.context.unix_secs();
        let requested = tokens as f64;

        if let Some(store) = &self.store {
            match self.acquire_shared(store.as_ref(), requested, now).await {
                Ok((level, allowed)) => {
                    self.mark_healthy();
                    *local = level;
                    return self.decide(level.tokens, allowed, requested, now);
                }
                Err(e) => self.mark_degraded(&e),
            }
        }

        let current = self.refill(*local, now);
        let (tokens_after, allowed) = take(current, requested);
        *local = Level {
            tokens: tokens_after,
            last_update: now,
        };
        self.decide(tokens_after, allowed, requested, now)
    }

    async fn acquire_shared(
        &self,
        store: &dyn KvStore,
        requested: f64,
        now: f64,
    ) -> std::result::Result<(Level, bool), EnvError> {
        let key = self.store_key();
        let data = store.hgetall(&key).await?;

        let stored = Level {
            tokens: data
                .get("tokens")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(self.spec.capacity as f64),
            last_update: data
                .get("last_update")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(now),
        };
        let current = self.refill(stored, now);
        let (tokens_after, allowed) = take(current, requested);

        store.hset(&key, "tokens", &tokens_after.to_string()).await?;
        store.hset(&key, "last_update", &now.to_string()).await?;
        store.expire(&key, self.store_ttl()).await?;

        Ok((
            Level {
                tokens: tokens_after,
                last_update: now,
            },
            allowed,
        ))
    }

    fn decide(&self, tokens_after: f64, allowed: bool, requested: f64, now: f64) -> RateLimitDecision {
        let capacity = self.spec.capacity as f64;
        let retry_after = if allowed {
            None
        } else {
            let wait = self.spec.seconds_for(requested - tokens_after);
            Some(wait.ceil().max(1.0) as u64)
        };
        RateLimitDecision {
            scope: self.key.clone(),
            allowed,
            remaining: (tokens_after + LEVEL_EPSILON).floor() as u64,
            limit: self.spec.capacity,
            reset_at: now + self.spec.seconds_for(capacity - tokens_after),
            retry_after,
        }
    }

    /// Current level without consuming anything.
    pub async fn info(&self) -> BucketInfo {
        let local = self.local.lock().await;
        let now = self.context.unix_secs();

        let mut level = *local;
        if let Some(store) = &self.store {
            match store.hgetall(&self.store_key()).await {
                Ok(data) => {
                    self.mark_healthy();
                    if let (Some(tokens), Some(last_update)) = (
                        data.get("tokens").and_then(|v| v.parse::<f64>().ok()),
                        data.get("last_update").and_then(|v| v.parse::<f64>().ok()),
                    ) {
                        level = Level { tokens, last_update };
                    } else {
                        level = Level {
                            tokens: self.spec.capacity as f64,
                            last_update: now,
                        };
                    }
                }
                Err(e) => self.mark_degraded(&e),
            }
        }

        BucketInfo {
            key: self.key.clone(),
            capacity: self.spec.capacity,
            current_tokens: self.refill(level, now),
            refill_rate: self.spec.refill_rate,
            refill_interval_secs: self.spec.refill_interval.as_secs_f64(),
        }
    }

    fn mark_degraded(&self, error: &EnvError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(key = %self.key, error = %error, "Rate limit store unavailable, using local bucket");
        } else {
            debug!(key = %self.key, error = %error, "Rate limit store still unavailable");
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            warn!(key = %self.key, "Rate limit store reachable again, leaving local fallback");
        }
    }
}

/// Takes `requested` from `current` if enough is there.
fn take(current: f64, requested: f64) -> (f64, bool) {
    if current + LEVEL_EPSILON >= requested {
        ((current - requested).max(0.0), true)
    } else {
        (current, false)
    }
}
