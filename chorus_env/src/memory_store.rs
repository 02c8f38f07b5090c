//! In-process implementation of KvStore.

use crate::error::EnvError;
use crate::store::KvStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Store backed by a process-local map.
///
/// Shares nothing across processes; useful as the shared store of a
/// single-process deployment and in tests. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped store for sharing across components.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns true if no live key exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, e| !e.is_expired(now));
        f(&mut entries)
    }
}

fn wrong_type(key: &str) -> EnvError {
    EnvError::store(format!("WRONGTYPE operation against key {}", key))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, EnvError> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), EnvError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(h) => {
                    h.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                Value::Set(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, EnvError> {
        self.with_entries(|entries| match entries.get_mut(key) {
            None => Ok(false),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.remove(field).is_some()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, EnvError> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), EnvError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(s) => {
                    s.insert(member.to_string());
                    Ok(())
                }
                Value::Hash(_) => Err(wrong_type(key)),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, EnvError> {
        self.with_entries(|entries| match entries.get_mut(key) {
            None => Ok(false),
            Some(Entry { value: Value::Set(s), .. }) => Ok(s.remove(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn smembers(&self, key: &str) -> Result<HashSet<String>, EnvError> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashSet::new()),
            Some(Entry { value: Value::Set(s), .. }) => Ok(s.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), EnvError> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), EnvError> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), EnvError> {
        Ok(())
    }
}
