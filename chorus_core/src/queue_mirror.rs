//! Best-effort write-through copy of one run's queue state.
//!
//! ```text
//! simulation:{run}:queue:pending     hash  item_id -> MirrorEntry json
//! simulation:{run}:queue:processing  hash  item_id -> MirrorEntry json
//! simulation:{run}:queue:completed   set   item_id
//! simulation:{run}:queue:failed      set   item_id
//! ```
//!
//! Writes never fail the caller. A failed write flips the mirror into
//! degraded mode (logged once) and marks it diverged: it may now lag the
//! in-memory queue until the next resync.

use crate::error::{DispatchError, Result};
use crate::queue::WorkItem;
use chorus_env::{EnvError, ItemId, KvStore, RunId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A mirrored item with its admission sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEntry {
    /// Breaks priority ties after a restart; entries written without one
    /// read as 0
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub item: WorkItem,
}

/// Raw contents of the mirror, decoded.
#[derive(Debug, Default)]
pub struct MirrorState {
    pub pending: Vec<MirrorEntry>,
    pub processing: Vec<MirrorEntry>,
    pub completed: HashSet<ItemId>,
    pub failed: HashSet<ItemId>,
}

pub struct QueueMirror {
    run_id: RunId,
    store: Option<Arc<dyn KvStore>>,
    pending_key: String,
    processing_key: String,
    completed_key: String,
    failed_key: String,
    /// Last store round trip failed
    degraded: AtomicBool,
    /// At least one write was lost since the last resync
    diverged: AtomicBool,
}

impl QueueMirror {
    pub fn new(run_id: RunId, store: Option<Arc<dyn KvStore>>) -> Self {
        let prefix = format!("simulation:{}:queue", run_id);
        Self {
            run_id,
            store,
            pending_key: format!("{}:pending", prefix),
            processing_key: format!("{}:processing", prefix),
            completed_key: format!("{}:completed", prefix),
            failed_key: format!("{}:failed", prefix),
            degraded: AtomicBool::new(false),
            diverged: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn is_diverged(&self) -> bool {
        self.diverged.load(Ordering::SeqCst)
    }

    fn note<T>(&self, op: &str, result: std::result::Result<T, EnvError>) -> Option<T> {
        match result {
            Ok(value) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    warn!(run_id = %self.run_id, "Queue mirror reachable again");
                }
                Some(value)
            }
            Err(e) => {
                self.diverged.store(true, Ordering::SeqCst);
                if !self.degraded.swap(true, Ordering::SeqCst) {
                    warn!(run_id = %self.run_id, op, error = %e, "Queue mirror unavailable, continuing in memory");
                } else {
                    debug!(run_id = %self.run_id, op, error = %e, "Queue mirror write skipped");
                }
                None
            }
        }
    }

    fn encode(item: &WorkItem, seq: u64) -> Option<String> {
        let entry = MirrorEntry { seq, item: item.clone() };
        match serde_json::to_string(&entry) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Failed to encode work item for mirror");
                None
            }
        }
    }

    /// Item admitted to pending.
    pub async fn admit(&self, item: &WorkItem, seq: u64) {
        let Some(store) = &self.store else { return };
        let Some(json) = Self::encode(item, seq) else { return };
        let id = item.id.to_string();
        let result = async {
            store.srem(&self.completed_key, &id).await?;
            store.srem(&self.failed_key, &id).await?;
            store.hset(&self.pending_key, &id, &json).await
        }
        .await;
        self.note("admit", result);
    }

    /// Item handed out by `get()`.
    pub async fn start(&self, item: &WorkItem, seq: u64) {
        let Some(store) = &self.store else { return };
        let Some(json) = Self::encode(item, seq) else { return };
        let id = item.id.to_string();
        let result = async {
            store.hset(&self.processing_key, &id, &json).await?;
            store.hdel(&self.pending_key, &id).await.map(|_| ())
        }
        .await;
        self.note("start", result);
    }

    /// Item finished successfully.
    pub async fn complete(&self, id: ItemId) {
        self.finish(id, true).await;
    }

    /// Item failed terminally.
    pub async fn fail(&self, id: ItemId) {
        self.finish(id, false).await;
    }

    async fn finish(&self, id: ItemId, completed: bool) {
        let Some(store) = &self.store else { return };
        let id = id.to_string();
        let set = if completed { &self.completed_key } else { &self.failed_key };
        let result = async {
            store.sadd(set, &id).await?;
            store.hdel(&self.processing_key, &id).await.map(|_| ())
        }
        .await;
        self.note(if completed { "complete" } else { "fail" }, result);
    }

    /// Item moved from processing back to pending.
    pub async fn requeue(&self, item: &WorkItem, seq: u64) {
        let Some(store) = &self.store else { return };
        let Some(json) = Self::encode(item, seq) else { return };
        let id = item.id.to_string();
        let result = async {
            store.hset(&self.pending_key, &id, &json).await?;
            store.hdel(&self.processing_key, &id).await.map(|_| ())
        }
        .await;
        self.note("requeue", result);
    }

    /// Drops a stale processing entry.
    pub async fn forget_processing(&self, id: ItemId) {
        let Some(store) = &self.store else { return };
        let result = store.hdel(&self.processing_key, &id.to_string()).await;
        self.note("forget", result);
    }

    /// Processing entries, or `None` when there is no reachable store.
    pub async fn processing_entries(&self) -> Result<Option<Vec<MirrorEntry>>> {
        let Some(store) = &self.store else { return Ok(None) };
        let result = store.hgetall(&self.processing_key).await;
        match self.note("read processing", result) {
            Some(raw) => Ok(Some(decode_items(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads every collection. Fails if the store is unreachable.
    pub async fn load(&self) -> Result<MirrorState> {
        let Some(store) = &self.store else {
            return Ok(MirrorState::default());
        };
        let pending = store.hgetall(&self.pending_key).await?;
        let processing = store.hgetall(&self.processing_key).await?;
        let completed = store.smembers(&self.completed_key).await?;
        let failed = store.smembers(&self.failed_key).await?;

        Ok(MirrorState {
            pending: decode_items(&pending)?,
            processing: decode_items(&processing)?,
            completed: decode_ids(&completed)?,
            failed: decode_ids(&failed)?,
        })
    }

    /// Removes every collection of the run.
    pub async fn clear(&self) {
        let Some(store) = &self.store else { return };
        let result = async {
            store.delete(&self.pending_key).await?;
            store.delete(&self.processing_key).await?;
            store.delete(&self.completed_key).await?;
            store.delete(&self.failed_key).await
        }
        .await;
        if self.note("clear", result).is_some() {
            self.diverged.store(false, Ordering::SeqCst);
        }
    }

    /// Rewrites the mirror from an authoritative in-memory view.
    pub async fn resync<'a>(
        &self,
        pending: impl Iterator<Item = (&'a WorkItem, u64)>,
        processing: impl Iterator<Item = (&'a WorkItem, u64)>,
        completed: &HashSet<ItemId>,
        failed: &HashSet<ItemId>,
    ) {
        let Some(store) = &self.store else { return };
        let pending: Vec<(String, String)> = pending
            .filter_map(|(item, seq)| Self::encode(item, seq).map(|json| (item.id.to_string(), json)))
            .collect();
        let processing: Vec<(String, String)> = processing
            .filter_map(|(item, seq)| Self::encode(item, seq).map(|json| (item.id.to_string(), json)))
            .collect();

        let result = async {
            store.delete(&self.pending_key).await?;
            store.delete(&self.processing_key).await?;
            store.delete(&self.completed_key).await?;
            store.delete(&self.failed_key).await?;
            for (id, json) in &pending {
                store.hset(&self.pending_key, id, json).await?;
            }
            for (id, json) in &processing {
                store.hset(&self.processing_key, id, json).await?;
            }
            for id in completed {
                store.sadd(&self.completed_key, &id.to_string()).await?;
            }
            for id in failed {
                store.sadd(&self.failed_key, &id.to_string()).await?;
            }
            Ok::<(), EnvError>(())
        }
        .await;

        if self.note("resync", result).is_some() {
            self.diverged.store(false, Ordering::SeqCst);
            info!(run_id = %self.run_id, "Queue mirror resynchronized");
        }
    }
}

fn decode_items(raw: &HashMap<String, String>) -> Result<Vec<MirrorEntry>> {
    let mut entries = Vec::with_capacity(raw.len());
    for (key, json) in raw {
        let entry: MirrorEntry = serde_json::from_str(json)
            .map_err(|e| DispatchError::queue_state(format!("Corrupt mirror entry {}: {}", key, e)))?;
        if entry.item.id.to_string() != *key {
            return Err(DispatchError::queue_state(format!(
                "Mirror entry {} holds item {}",
                key, entry.item.id
            )));
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn decode_ids(raw: &HashSet<String>) -> Result<HashSet<ItemId>> {
    raw.iter()
        .map(|s| {
            s.parse::<ItemId>()
                .map_err(|e| DispatchError::queue_state(format!("Corrupt mirror id {}: {}", s, e)))
        })
        .collect()
}
