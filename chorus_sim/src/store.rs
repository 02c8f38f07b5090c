//! Simulated shared store with fault injection.

use crate::context::SimContext;
use async_trait::async_trait;
use chorus_env::{ChorusContext, EnvError, KvStore, MemoryStore, StoreController};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// `MemoryStore` behind an outage switch and a virtual-time delay.
///
/// Clones share data and switches, so a scenario can hold one handle as
/// the controller while the queue and limiter hold others.
#[derive(Clone)]
pub struct FlakyStore {
    data: MemoryStore,
    context: Arc<SimContext>,
    available: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
    operations: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl FlakyStore {
    pub fn new(context: Arc<SimContext>) -> Self {
        Self {
            data: MemoryStore::new(),
            context,
            available: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            operations: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn shared(context: Arc<SimContext>) -> Arc<Self> {
        Arc::new(Self::new(context))
    }

    /// Operations attempted so far.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Operations refused during outages.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Raw view of the surviving data, bypassing the outage switch.
    pub fn backing(&self) -> &MemoryStore {
        &self.data
    }

    async fn gate(&self) -> Result<(), EnvError> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            self.context.sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::unavailable("simulated outage"));
        }
        Ok(())
    }
}

impl StoreController for FlakyStore {
    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn set_latency_ms(&self, latency_ms: u64) {
        self.latency_ms.store(latency_ms, Ordering::Relaxed);
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EnvError> {
        self.gate().await?;
        self.data.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), EnvError> {
        self.gate().await?;
        self.data.hset(key, field, value).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, EnvError> {
        self.gate().await?;
        self.data.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EnvError> {
        self.gate().await?;
        self.data.hgetall(key).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), EnvError> {
        self.gate().await?;
        self.data.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, EnvError> {
        self.gate().await?;
        self.data.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, EnvError> {
        self.gate().await?;
        self.data.smembers(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), EnvError> {
        self.gate().await?;
        self.data.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), EnvError> {
        self.gate().await?;
        self.data.expire(key, ttl).await
    }

    async fn ping(&self) -> Result<(), EnvError> {
        self.gate().await
    }
}
