//! Embedded persistent store backed by sled.
//!
//! Lets the queue mirror and rate-limit buckets survive a process restart
//! on a single host without an external server.
//!
//! Layout inside the database:
//!
//! ```text
//! tree "meta"    key                 -> b"h" | b"s"
//! tree "hashes"  key \0 field        -> value
//! tree "sets"    key \0 member       -> []
//! tree "expiry"  key                 -> unix millis (u64 big-endian)
//! ```
//!
//! Single writes are left to sled's periodic background flush. `delete`
//! and `flush` force a sync.

use async_trait::async_trait;
use chorus_env::{EnvError, KvStore};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HASH_TAG: &[u8] = b"h";
const SET_TAG: &[u8] = b"s";

fn storage_error(op: &str, e: sled::Error) -> EnvError {
    EnvError::store(format!("{} failed: {}", op, e))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn prefix(key: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(key.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(0);
    bytes
}

fn compound(key: &str, member: &str) -> Vec<u8> {
    let mut bytes = prefix(key);
    bytes.extend_from_slice(member.as_bytes());
    bytes
}

fn decode(bytes: &[u8]) -> Result<String, EnvError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| EnvError::SerializationError(e.to_string()))
}

/// `KvStore` on an embedded sled database.
pub struct SledStore {
    db: sled::Db,
    meta: sled::Tree,
    hashes: sled::Tree,
    sets: sled::Tree,
    expiry: sled::Tree,
}

impl SledStore {
    /// Opens (or creates) a persistent store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EnvError> {
        let db = sled::open(path).map_err(|e| storage_error("Opening sled DB", e))?;
        Self::from_db(db)
    }

    /// Creates a store that is deleted when dropped.
    pub fn open_temp() -> Result<Self, EnvError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| storage_error("Opening temp DB", e))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, EnvError> {
        let tree = |name: &str| db.open_tree(name).map_err(|e| storage_error("Opening tree", e));
        Ok(Self {
            meta: tree("meta")?,
            hashes: tree("hashes")?,
            sets: tree("sets")?,
            expiry: tree("expiry")?,
            db,
        })
    }

    /// Forces buffered writes to disk.
    pub async fn flush(&self) -> Result<(), EnvError> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|e| storage_error("Flush", e))
    }

    /// Type tag of a live key, dropping it first if it has expired.
    fn tag(&self, key: &str) -> Result<Option<sled::IVec>, EnvError> {
        if let Some(deadline) = self.expiry.get(key).map_err(|e| storage_error("Reading expiry", e))? {
            let mut millis = [0u8; 8];
            if deadline.len() == 8 {
                millis.copy_from_slice(&deadline);
            }
            if u64::from_be_bytes(millis) <= unix_millis() {
                self.remove_key(key)?;
                return Ok(None);
            }
        }
        self.meta.get(key).map_err(|e| storage_error("Reading meta", e))
    }

    fn claim(&self, key: &str, tag: &[u8]) -> Result<(), EnvError> {
        match self.tag(key)? {
            Some(existing) if existing.as_ref() != tag => Err(EnvError::store(format!(
                "WRONGTYPE operation against key {}",
                key
            ))),
            Some(_) => Ok(()),
            None => {
                self.meta
                    .insert(key, tag)
                    .map_err(|e| storage_error("Writing meta", e))?;
                Ok(())
            }
        }
    }

    fn check_type(&self, key: &str, tag: &[u8]) -> Result<bool, EnvError> {
        match self.tag(key)? {
            None => Ok(false),
            Some(existing) if existing.as_ref() == tag => Ok(true),
            Some(_) => Err(EnvError::store(format!("WRONGTYPE operation against key {}", key))),
        }
    }

    fn remove_key(&self, key: &str) -> Result<(), EnvError> {
        for tree in [&self.hashes, &self.sets] {
            let doomed: Vec<sled::IVec> = tree
                .scan_prefix(prefix(key))
                .keys()
                .collect::<Result<_, _>>()
                .map_err(|e| storage_error("Scanning key", e))?;
            for k in doomed {
                tree.remove(k).map_err(|e| storage_error("Removing entry", e))?;
            }
        }
        self.meta.remove(key).map_err(|e| storage_error("Removing meta", e))?;
        self.expiry.remove(key).map_err(|e| storage_error("Removing expiry", e))?;
        Ok(())
    }

    fn members(&self, tree: &sled::Tree, key: &str) -> Result<Vec<(String, sled::IVec)>, EnvError> {
        let start = prefix(key).len();
        let mut out = Vec::new();
        for entry in tree.scan_prefix(prefix(key)) {
            let (k, v) = entry.map_err(|e| storage_error("Iteration", e))?;
            out.push((decode(&k[start..])?, v));
        }
        Ok(out)
    }
}

#[async_trait]
impl KvStore for SledStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EnvError> {
        if !self.check_type(key, HASH_TAG)? {
            return Ok(None);
        }
        match self.hashes.get(compound(key, field)).map_err(|e| storage_error("Get", e))? {
            Some(v) => Ok(Some(decode(&v)?)),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), EnvError> {
        self.claim(key, HASH_TAG)?;
        self.hashes
            .insert(compound(key, field), value.as_bytes())
            .map_err(|e| storage_error("Insert", e))?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, EnvError> {
        if !self.check_type(key, HASH_TAG)? {
            return Ok(false);
        }
        let removed = self
            .hashes
            .remove(compound(key, field))
            .map_err(|e| storage_error("Remove", e))?
            .is_some();
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EnvError> {
        if !self.check_type(key, HASH_TAG)? {
            return Ok(HashMap::new());
        }
        self.members(&self.hashes, key)?
            .into_iter()
            .map(|(field, v)| Ok::<_, EnvError>((field, decode(&v)?)))
            .collect()
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), EnvError> {
        self.claim(key, SET_TAG)?;
        self.sets
            .insert(compound(key, member), &[] as &[u8])
            .map_err(|e| storage_error("Insert", e))?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, EnvError> {
        if !self.check_type(key, SET_TAG)? {
            return Ok(false);
        }
        let removed = self
            .sets
            .remove(compound(key, member))
            .map_err(|e| storage_error("Remove", e))?
            .is_some();
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, EnvError> {
        if !self.check_type(key, SET_TAG)? {
            return Ok(HashSet::new());
        }
        Ok(self
            .members(&self.sets, key)?
            .into_iter()
            .map(|(member, _)| member)
            .collect())
    }

    /// Deletes are how mirrors are cleared and rewritten, so they also
    /// force everything written so far to disk.
    async fn delete(&self, key: &str) -> Result<(), EnvError> {
        self.remove_key(key)?;
        self.flush().await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), EnvError> {
        if self.tag(key)?.is_none() {
            return Ok(());
        }
        let deadline = unix_millis().saturating_add(ttl.as_millis() as u64);
        self.expiry
            .insert(key, &deadline.to_be_bytes()[..])
            .map_err(|e| storage_error("Writing expiry", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), EnvError> {
        self.meta
            .contains_key("__ping__")
            .map(|_| ())
            .map_err(|e| storage_error("Ping", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{PromptQueue, WorkItem};
    use chorus_env::{ItemId, RunId};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hash_and_set_round_trip() {
        let store = SledStore::open_temp().unwrap();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        store.sadd("s", "x").await.unwrap();

        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
        assert!(store.smembers("s").await.unwrap().contains("x"));

        assert!(store.hdel("h", "a").await.unwrap());
        assert!(store.srem("s", "x").await.unwrap());
        assert!(store.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_do_not_bleed_into_each_other() {
        let store = SledStore::open_temp().unwrap();
        store.hset("run", "a", "1").await.unwrap();
        store.hset("run:queue", "b", "2").await.unwrap();

        assert_eq!(store.hgetall("run").await.unwrap().len(), 1);
        store.delete("run").await.unwrap();
        assert_eq!(store.hgetall("run:queue").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let store = SledStore::open_temp().unwrap();
        store.sadd("k", "x").await.unwrap();
        assert!(store.hset("k", "f", "v").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_keys_vanish() {
        let store = SledStore::open_temp().unwrap();
        store.hset("ratelimit:x", "tokens", "3").await.unwrap();
        store.expire("ratelimit:x", Duration::ZERO).await.unwrap();
        assert!(store.hgetall("ratelimit:x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unflushed_writes_survive_explicit_flush_and_reopen() {
        let path = std::env::temp_dir().join(format!("chorus-sled-{}", std::process::id()));
        {
            let store = SledStore::open(&path).unwrap();
            store.hset("simulation:r:queue:pending", "a", "{}").await.unwrap();
            store.sadd("simulation:r:queue:completed", "b").await.unwrap();
            // Visible immediately, without a per-write sync
            assert_eq!(store.hget("simulation:r:queue:pending", "a").await.unwrap().as_deref(), Some("{}"));
            store.flush().await.unwrap();
        }
        {
            let store = SledStore::open(&path).unwrap();
            assert!(store.hgetall("simulation:r:queue:pending").await.unwrap().contains_key("a"));
            assert!(store.smembers("simulation:r:queue:completed").await.unwrap().contains("b"));
        }
        std::fs::remove_dir_all(&path).ok();
    }

    #[tokio::test]
    async fn test_queue_recovers_from_sled() {
        let store = Arc::new(SledStore::open_temp().unwrap());
        let run_id = RunId::from_seed(11);
        let queue = PromptQueue::new(run_id, Some(store.clone()));
        queue
            .add_batch(vec![
                WorkItem::new(ItemId::from_seed(1), "a"),
                WorkItem::new(ItemId::from_seed(2), "b"),
            ])
            .await;
        queue.get().await.unwrap();
        drop(queue);

        let recovered = PromptQueue::recover(run_id, store).await.unwrap();
        assert_eq!(recovered.stats().await.pending, 2);
    }
}
