//! Shared key/value store abstraction.

use async_trait::async_trait;
use crate::error::EnvError;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Abstraction over the shared store used by rate limiters and queue mirrors.
///
/// The surface is deliberately small: string hashes, string sets, key
/// deletion and expiry. Anything richer belongs in the caller.
///
/// # Implementations
///
/// - **Production**: `SledStore` (embedded, durable) or any networked store
/// - **In-process**: `MemoryStore`
/// - **Simulation**: `FlakyStore` with injectable outages and latency
///
/// # Keyspace
///
/// ```text
/// ratelimit:{scope}                  hash  { tokens, last_update }
/// simulation:{run}:queue:pending     hash  { item_id -> WorkItem json }
/// simulation:{run}:queue:processing  hash  { item_id -> WorkItem json }
/// simulation:{run}:queue:completed   set   { item_id }
/// simulation:{run}:queue:failed      set   { item_id }
/// ```
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads one field of a hash.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EnvError>;

    /// Writes one field of a hash, creating the hash if needed.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), EnvError>;

    /// Removes one field of a hash.
    ///
    /// # Returns
    /// `true` if the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, EnvError>;

    /// Reads every field of a hash. A missing key yields an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EnvError>;

    /// Adds a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), EnvError>;

    /// Removes a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, EnvError>;

    /// Reads every member of a set. A missing key yields an empty set.
    async fn smembers(&self, key: &str) -> Result<HashSet<String>, EnvError>;

    /// Deletes a key of any type.
    async fn delete(&self, key: &str) -> Result<(), EnvError>;

    /// Sets a time-to-live on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), EnvError>;

    /// Cheap round trip used to probe availability.
    async fn ping(&self) -> Result<(), EnvError>;
}

/// Fault-injection handle for a store in simulation.
pub trait StoreController: Send + Sync {
    /// Makes every subsequent operation succeed (`true`) or fail with
    /// `EnvError::StoreUnavailable` (`false`).
    fn set_available(&self, available: bool);

    /// Returns the current availability switch.
    fn is_available(&self) -> bool;

    /// Adds a fixed delay to every operation.
    fn set_latency_ms(&self, latency_ms: u64);
}
