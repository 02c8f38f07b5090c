//! Priority-ordered, retry-aware work queue for one run.
//!
//! ```text
//!            get()                 mark_completed()
//!  PENDING ─────────► PROCESSING ──────────────────► COMPLETED
//!     ▲                   │
//!     │  mark_failed(retry), retry_count < max_retries
//!     └───────────────────┤   (priority -= 1, retry_count += 1)
//!                         │
//!                         └─ mark_failed, retries exhausted ─► FAILED
//! ```
//!
//! Every admitted id is in exactly one of the four sets. The in-memory heap
//! is authoritative for ordering (priority first, then admission order); the
//! `QueueMirror` is only consulted to recover after a crash.

use crate::error::{DispatchError, Result};
use crate::queue_mirror::{MirrorEntry, QueueMirror};
use chorus_env::{ItemId, KvStore, RunId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Default retry budget per item.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// One unit of dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub payload_text: String,
    #[serde(default)]
    pub conversation_ref: Option<String>,
    #[serde(default)]
    pub owner_ref: Option<String>,
    /// Higher is released first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl WorkItem {
    pub fn new(id: ItemId, payload_text: impl Into<String>) -> Self {
        Self {
            id,
            payload_text: payload_text.into(),
            conversation_ref: None,
            owner_ref: None,
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_conversation(mut self, conversation_ref: impl Into<String>) -> Self {
        self.conversation_ref = Some(conversation_ref.into());
        self
    }

    pub fn with_owner(mut self, owner_ref: impl Into<String>) -> Self {
        self.owner_ref = Some(owner_ref.into());
        self
    }
}

/// Counts of each set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub run_id: RunId,
    /// Items waiting in the heap
    pub queue_size: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Where an id currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: i32,
    seq: u64,
    id: ItemId,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    /// Data of every pending or processing item
    items: HashMap<ItemId, WorkItem>,
    /// Admission sequence of every pending or processing item
    seqs: HashMap<ItemId, u64>,
    pending: HashSet<ItemId>,
    processing: HashSet<ItemId>,
    completed: HashSet<ItemId>,
    failed: HashSet<ItemId>,
    next_seq: u64,
}

impl QueueInner {
    /// Admits `item` behind everything admitted so far.
    fn push(&mut self, item: WorkItem) -> u64 {
        let seq = self.next_seq;
        self.push_at(item, seq);
        seq
    }

    /// Admits `item` at a known sequence, e.g. one restored from the mirror.
    fn push_at(&mut self, item: WorkItem, seq: u64) {
        self.heap.push(HeapEntry {
            priority: item.priority,
            seq,
            id: item.id,
        });
        self.next_seq = self.next_seq.max(seq + 1);
        self.pending.insert(item.id);
        self.seqs.insert(item.id, seq);
        self.items.insert(item.id, item);
    }

    fn pop(&mut self) -> Option<(WorkItem, u64)> {
        while let Some(entry) = self.heap.pop() {
            if !self.pending.remove(&entry.id) {
                continue;
            }
            if let Some(item) = self.items.get(&entry.id) {
                self.processing.insert(entry.id);
                return Some((item.clone(), entry.seq));
            }
        }
        None
    }

    fn is_finished(&self, id: &ItemId) -> bool {
        self.completed.contains(id) || self.failed.contains(id)
    }

    fn state_of(&self, id: &ItemId) -> Option<ItemState> {
        if self.pending.contains(id) {
            Some(ItemState::Pending)
        } else if self.processing.contains(id) {
            Some(ItemState::Processing)
        } else if self.completed.contains(id) {
            Some(ItemState::Completed)
        } else if self.failed.contains(id) {
            Some(ItemState::Failed)
        } else {
            None
        }
    }

    fn take_processing(&mut self, id: ItemId) -> Result<WorkItem> {
        if !self.processing.remove(&id) {
            let state = self.state_of(&id);
            return Err(DispatchError::queue_state(match state {
                Some(state) => format!("Item {} is {:?}, not processing", id, state),
                None => format!("Unknown item {}", id),
            }));
        }
        self.seqs.remove(&id);
        self.items
            .remove(&id)
            .ok_or_else(|| DispatchError::queue_state(format!("Item {} has no data", id)))
    }
}

/// Work queue for one run.
pub struct PromptQueue {
    run_id: RunId,
    inner: Mutex<QueueInner>,
    mirror: QueueMirror,
}

impl PromptQueue {
    /// Creates an empty queue. With a store, state is mirrored to it.
    pub fn new(run_id: RunId, store: Option<Arc<dyn KvStore>>) -> Self {
        Self {
            run_id,
            inner: Mutex::new(QueueInner::default()),
            mirror: QueueMirror::new(run_id, store),
        }
    }

    /// Rebuilds a queue from its mirror after a restart.
    ///
    /// Completed and failed ids are restored as-is, pending items are
    /// re-admitted at their original sequence, and items that were
    /// processing when the previous process died go back to pending.
    ///
    /// A crash in the middle of a mirror write can leave an id in two
    /// collections. Terminal beats processing, which beats pending.
    pub async fn recover(run_id: RunId, store: Arc<dyn KvStore>) -> Result<Self> {
        let queue = Self::new(run_id, Some(store));
        let state = queue.mirror.load().await?;

        let stale: Vec<ItemId> = {
            let mut inner = queue.inner.lock().await;
            let completed = state.completed;
            let failed: HashSet<ItemId> = state
                .failed
                .into_iter()
                .filter(|id| !completed.contains(id))
                .collect();
            inner.completed = completed;
            inner.failed = failed;

            let processing_ids: HashSet<ItemId> = state.processing.iter().map(|e| e.item.id).collect();
            for entry in state.pending {
                let id = entry.item.id;
                if !inner.is_finished(&id) && !processing_ids.contains(&id) {
                    inner.push_at(entry.item, entry.seq);
                }
            }

            state
                .processing
                .iter()
                .map(|e| e.item.id)
                .filter(|id| inner.is_finished(id))
                .collect()
        };

        // Finished between the terminal-set write and the processing delete
        for id in stale {
            warn!(run_id = %run_id, item_id = %id, "Dropping processing entry of finished item");
            queue.mirror.forget_processing(id).await;
        }

        let requeued = queue.requeue_processing().await?;
        let stats = queue.stats().await;
        info!(
            run_id = %run_id,
            pending = stats.pending,
            completed = stats.completed,
            failed = stats.failed,
            requeued,
            "Recovered prompt queue from mirror"
        );
        Ok(queue)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// True while the mirror's store is unreachable.
    pub fn mirror_degraded(&self) -> bool {
        self.mirror.is_degraded()
    }

    /// Admits an item. Returns false if it is already pending or processing.
    ///
    /// A completed or failed id is admitted again as a fresh item.
    pub async fn add(&self, item: WorkItem) -> bool {
        let mut inner = self.inner.lock().await;
        self.add_locked(&mut inner, item).await
    }

    async fn add_locked(&self, inner: &mut QueueInner, item: WorkItem) -> bool {
        let id = item.id;
        if inner.pending.contains(&id) || inner.processing.contains(&id) {
            debug!(run_id = %self.run_id, item_id = %id, "Item already queued");
            return false;
        }
        if inner.completed.remove(&id) || inner.failed.remove(&id) {
            debug!(run_id = %self.run_id, item_id = %id, "Re-admitting finished item");
        }

        let priority = item.priority;
        let seq = inner.push(item.clone());
        self.mirror.admit(&item, seq).await;
        debug!(
            run_id = %self.run_id,
            item_id = %id,
            priority,
            queue_size = inner.heap.len(),
            "Added item to queue"
        );
        true
    }

    /// Admits several items, returning how many were new.
    pub async fn add_batch(&self, items: Vec<WorkItem>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut added = 0;
        for item in items {
            if self.add_locked(&mut inner, item).await {
                added += 1;
            }
        }
        added
    }

    /// Releases the highest-priority pending item.
    pub async fn get(&self) -> Option<WorkItem> {
        let mut inner = self.inner.lock().await;
        let (item, seq) = inner.pop()?;
        self.mirror.start(&item, seq).await;
        debug!(run_id = %self.run_id, item_id = %item.id, remaining = inner.heap.len(), "Released item");
        Some(item)
    }

    /// Releases up to `n` items in admission order.
    pub async fn get_batch(&self, n: usize) -> Vec<WorkItem> {
        let mut inner = self.inner.lock().await;
        let mut batch = Vec::with_capacity(n.min(inner.pending.len()));
        while batch.len() < n {
            let Some((item, seq)) = inner.pop() else { break };
            self.mirror.start(&item, seq).await;
            batch.push(item);
        }
        batch
    }

    /// Moves a processing item to completed.
    pub async fn mark_completed(&self, id: ItemId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.take_processing(id).map_err(|e| {
            error!(run_id = %self.run_id, item_id = %id, error = %e, "Cannot complete item");
            e
        })?;
        inner.completed.insert(id);
        self.mirror.complete(id).await;
        debug!(run_id = %self.run_id, item_id = %id, "Marked item completed");
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// With `retry` and budget left the item goes back to pending one
    /// priority lower and this returns true. Otherwise it is terminally
    /// failed and this returns false.
    pub async fn mark_failed(&self, id: ItemId, reason: Option<&str>, retry: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let mut item = inner.take_processing(id).map_err(|e| {
            error!(run_id = %self.run_id, item_id = %id, error = %e, "Cannot fail item");
            e
        })?;

        if retry && item.retry_count < item.max_retries {
            item.retry_count += 1;
            item.priority = item.priority.saturating_sub(1);
            warn!(
                run_id = %self.run_id,
                item_id = %id,
                retry_count = item.retry_count,
                priority = item.priority,
                reason = reason.unwrap_or(""),
                "Re-queued failed item"
            );
            let seq = inner.push(item.clone());
            self.mirror.requeue(&item, seq).await;
            return Ok(true);
        }

        inner.failed.insert(id);
        self.mirror.fail(id).await;
        error!(
            run_id = %self.run_id,
            item_id = %id,
            attempts = item.retry_count + 1,
            reason = reason.unwrap_or(""),
            "Marked item failed"
        );
        Ok(false)
    }

    /// Sends every processing item back to pending, at its original
    /// admission sequence.
    ///
    /// Candidates are the in-memory processing set plus whatever the mirror
    /// still lists as processing. A mirror entry for an id that memory has
    /// already finished is stale if the mirror missed writes, and a state
    /// error otherwise.
    pub async fn requeue_processing(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;

        let mut candidates: BTreeMap<ItemId, (WorkItem, u64)> = inner
            .processing
            .iter()
            .filter_map(|id| Some((*id, (inner.items.get(id)?.clone(), *inner.seqs.get(id)?))))
            .collect();

        if let Some(entries) = self.mirror.processing_entries().await? {
            for MirrorEntry { item, seq } in entries {
                match inner.state_of(&item.id) {
                    Some(ItemState::Completed) | Some(ItemState::Failed) => {
                        if !self.mirror.is_diverged() {
                            return Err(DispatchError::queue_state(format!(
                                "Item {} is processing in the mirror but finished in memory",
                                item.id
                            )));
                        }
                        warn!(run_id = %self.run_id, item_id = %item.id, "Dropping stale mirror entry");
                        self.mirror.forget_processing(item.id).await;
                    }
                    Some(ItemState::Pending) => self.mirror.forget_processing(item.id).await,
                    Some(ItemState::Processing) | None => {
                        candidates.entry(item.id).or_insert((item, seq));
                    }
                }
            }
        }

        let count = candidates.len();
        for (id, (item, seq)) in candidates {
            inner.processing.remove(&id);
            self.mirror.requeue(&item, seq).await;
            inner.push_at(item, seq);
        }

        if self.mirror.is_diverged() {
            let entry = |id: &ItemId| Some((inner.items.get(id)?, *inner.seqs.get(id)?));
            let pending = inner.pending.iter().filter_map(entry);
            let processing = inner.processing.iter().filter_map(entry);
            self.mirror.resync(pending, processing, &inner.completed, &inner.failed).await;
        }

        if count > 0 {
            info!(run_id = %self.run_id, count, "Re-queued processing items");
        }
        Ok(count)
    }

    /// Wipes all four sets and the mirror.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = QueueInner::default();
        self.mirror.clear().await;
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let (pending, processing, completed, failed) = (
            inner.pending.len(),
            inner.processing.len(),
            inner.completed.len(),
            inner.failed.len(),
        );
        QueueStats {
            run_id: self.run_id,
            queue_size: pending,
            pending,
            processing,
            completed,
            failed,
            total: pending + processing + completed + failed,
        }
    }

    /// State of one id, if it was ever admitted.
    pub async fn state_of(&self, id: ItemId) -> Option<ItemState> {
        self.inner.lock().await.state_of(&id)
    }

    /// True when nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.pending.is_empty()
    }

    /// Number of pending items.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_env::MemoryStore;
    use proptest::prelude::*;

    fn item(seed: u64, priority: i32) -> WorkItem {
        WorkItem::new(ItemId::from_seed(seed), format!("prompt {}", seed)).with_priority(priority)
    }

    #[tokio::test]
    async fn test_higher_priority_released_first() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 0)).await;
        queue.add(item(2, 10)).await;

        assert_eq!(queue.get().await.unwrap().id, ItemId::from_seed(2));
        assert_eq!(queue.get().await.unwrap().id, ItemId::from_seed(1));
        assert!(queue.get().await.is_none());
    }

    #[tokio::test]
    async fn test_ties_release_oldest_first() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        for seed in [5, 3, 9] {
            queue.add(item(seed, 1)).await;
        }
        let order: Vec<ItemId> = queue.get_batch(10).await.into_iter().map(|i| i.id).collect();
        assert_eq!(
            order,
            vec![ItemId::from_seed(5), ItemId::from_seed(3), ItemId::from_seed(9)]
        );
    }

    #[tokio::test]
    async fn test_add_is_idempotent_while_queued() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        assert!(queue.add(item(1, 0)).await);
        assert!(!queue.add(item(1, 5)).await);
        assert_eq!(queue.len().await, 1);

        queue.get().await.unwrap();
        assert!(!queue.add(item(1, 0)).await);
        let stats = queue.stats().await;
        assert_eq!((stats.pending, stats.processing, stats.total), (0, 1, 1));
    }

    #[tokio::test]
    async fn test_add_batch_counts_new_items() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 0)).await;
        let added = queue.add_batch(vec![item(1, 0), item(2, 0), item(3, 0), item(2, 0)]).await;
        assert_eq!(added, 2);
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_retry_demotes_priority() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 5)).await;
        queue.add(item(2, 5)).await;

        let first = queue.get().await.unwrap();
        assert_eq!(first.id, ItemId::from_seed(1));
        assert!(queue.mark_failed(first.id, Some("timeout"), true).await.unwrap());

        // The healthy item now overtakes the retried one
        let next = queue.get().await.unwrap();
        assert_eq!(next.id, ItemId::from_seed(2));
        let retried = queue.get().await.unwrap();
        assert_eq!(retried.id, ItemId::from_seed(1));
        assert_eq!(retried.priority, 4);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 0).with_max_retries(2)).await;

        let mut attempts = 0;
        loop {
            let current = queue.get().await.unwrap();
            attempts += 1;
            if !queue.mark_failed(current.id, None, true).await.unwrap() {
                break;
            }
        }
        assert_eq!(attempts, 3);
        assert_eq!(queue.state_of(ItemId::from_seed(1)).await, Some(ItemState::Failed));
    }

    #[tokio::test]
    async fn test_mark_failed_without_retry_is_terminal() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 0)).await;
        let current = queue.get().await.unwrap();
        assert!(!queue.mark_failed(current.id, Some("bad"), false).await.unwrap());
        assert_eq!(queue.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_state_errors() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        let err = queue.mark_completed(ItemId::from_seed(42)).await.unwrap_err();
        assert!(matches!(err, DispatchError::QueueState(_)));

        queue.add(item(1, 0)).await;
        // Pending, not processing
        assert!(queue.mark_failed(ItemId::from_seed(1), None, true).await.is_err());
    }

    #[tokio::test]
    async fn test_completed_id_can_be_readmitted() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add(item(1, 0)).await;
        let current = queue.get().await.unwrap();
        queue.mark_completed(current.id).await.unwrap();

        assert!(queue.add(item(1, 0)).await);
        let stats = queue.stats().await;
        assert_eq!((stats.pending, stats.completed, stats.total), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_mirror_tracks_transitions() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(7);
        let queue = PromptQueue::new(run_id, Some(store.clone()));
        let prefix = format!("simulation:{}:queue", run_id);

        queue.add(item(1, 0)).await;
        queue.add(item(2, 0)).await;
        let first = queue.get().await.unwrap();
        queue.mark_completed(first.id).await.unwrap();
        let second = queue.get().await.unwrap();

        let processing = store.hgetall(&format!("{}:processing", prefix)).await.unwrap();
        assert!(processing.contains_key(&second.id.to_string()));
        let completed = store.smembers(&format!("{}:completed", prefix)).await.unwrap();
        assert!(completed.contains(&first.id.to_string()));
        assert!(store.hgetall(&format!("{}:pending", prefix)).await.unwrap().is_empty());

        queue.clear().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_recover_after_crash() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(8);
        {
            let queue = PromptQueue::new(run_id, Some(store.clone()));
            queue.add_batch((1..=4).map(|s| item(s, s as i32)).collect()).await;
            let done = queue.get().await.unwrap();
            queue.mark_completed(done.id).await.unwrap();
            queue.get().await.unwrap();
            // process dies with one item processing
        }

        let recovered = PromptQueue::recover(run_id, store.clone()).await.unwrap();
        let stats = recovered.stats().await;
        assert_eq!((stats.pending, stats.processing, stats.completed), (3, 0, 1));
        assert_eq!(recovered.state_of(ItemId::from_seed(4)).await, Some(ItemState::Completed));

        // Item 3 was in flight; it is back, still ahead of lower priorities
        assert_eq!(recovered.get().await.unwrap().id, ItemId::from_seed(3));
    }

    #[tokio::test]
    async fn test_recover_after_crash_mid_finish() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(12);
        let done = ItemId::from_seed(1);
        {
            let queue = PromptQueue::new(run_id, Some(store.clone()));
            queue.add_batch(vec![item(1, 5), item(2, 0)]).await;
            assert_eq!(queue.get().await.unwrap().id, done);
            // Process dies after the completed-set write, before the
            // processing entry is deleted
            store
                .sadd(&format!("simulation:{}:queue:completed", run_id), &done.to_string())
                .await
                .unwrap();
        }

        let recovered = PromptQueue::recover(run_id, store.clone()).await.unwrap();
        assert_eq!(recovered.state_of(done).await, Some(ItemState::Completed));
        let stats = recovered.stats().await;
        assert_eq!((stats.pending, stats.processing, stats.completed), (1, 0, 1));

        let processing = store
            .hgetall(&format!("simulation:{}:queue:processing", run_id))
            .await
            .unwrap();
        assert!(processing.is_empty());
        assert_eq!(recovered.get().await.unwrap().id, ItemId::from_seed(2));
    }

    #[tokio::test]
    async fn test_recover_keeps_admission_order_of_ties() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(13);
        {
            let queue = PromptQueue::new(run_id, Some(store.clone()));
            for seed in [5, 3, 9, 7] {
                queue.add(item(seed, 1)).await;
            }
            // Oldest item is in flight when the process dies
            assert_eq!(queue.get().await.unwrap().id, ItemId::from_seed(5));
        }

        let recovered = PromptQueue::recover(run_id, store).await.unwrap();
        recovered.add(item(1, 1)).await;
        let order: Vec<ItemId> = recovered.get_batch(10).await.into_iter().map(|i| i.id).collect();
        assert_eq!(
            order,
            [5, 3, 9, 7, 1].into_iter().map(ItemId::from_seed).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_requeue_processing_from_memory_without_store() {
        let queue = PromptQueue::new(RunId::from_seed(1), None);
        queue.add_batch(vec![item(1, 0), item(2, 0)]).await;
        queue.get_batch(2).await;

        assert_eq!(queue.requeue_processing().await.unwrap(), 2);
        let stats = queue.stats().await;
        assert_eq!((stats.pending, stats.processing), (2, 0));
    }

    #[tokio::test]
    async fn test_corrupt_mirror_is_state_error() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(9);
        store
            .hset(&format!("simulation:{}:queue:processing", run_id), "not-an-id", "{")
            .await
            .unwrap();

        let err = PromptQueue::recover(run_id, store).await.err().unwrap();
        assert!(matches!(err, DispatchError::QueueState(_)));
    }

    #[tokio::test]
    async fn test_mirror_inconsistency_is_state_error() {
        let store = MemoryStore::shared();
        let run_id = RunId::from_seed(10);
        let queue = PromptQueue::new(run_id, Some(store.clone()));
        queue.add(item(1, 0)).await;
        let current = queue.get().await.unwrap();
        queue.mark_completed(current.id).await.unwrap();

        // Another writer resurrects the entry behind our back
        let json = serde_json::to_string(&current).unwrap();
        store
            .hset(&format!("simulation:{}:queue:processing", run_id), &current.id.to_string(), &json)
            .await
            .unwrap();

        assert!(matches!(
            queue.requeue_processing().await,
            Err(DispatchError::QueueState(_))
        ));
    }

    // =========================================================================
    // Properties
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Op {
        Add(u64, i32),
        Get,
        Complete(usize),
        Fail(usize, bool),
        Requeue,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..12, -3i32..3).prop_map(|(s, p)| Op::Add(s, p)),
            Just(Op::Get),
            (0usize..8).prop_map(Op::Complete),
            (0usize..8, any::<bool>()).prop_map(|(i, r)| Op::Fail(i, r)),
            Just(Op::Requeue),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every admitted id sits in exactly one set after any operation.
        #[test]
        fn prop_partition_invariant(ops in prop::collection::vec(arb_op(), 1..60)) {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let queue = PromptQueue::new(RunId::from_seed(1), Some(MemoryStore::shared()));
                let mut admitted = HashSet::new();
                let mut in_flight: Vec<ItemId> = Vec::new();

                for op in ops {
                    match op {
                        Op::Add(seed, priority) => {
                            queue.add(item(seed, priority)).await;
                            admitted.insert(ItemId::from_seed(seed));
                        }
                        Op::Get => {
                            if let Some(got) = queue.get().await {
                                in_flight.push(got.id);
                            }
                        }
                        Op::Complete(i) if !in_flight.is_empty() => {
                            let id = in_flight.remove(i % in_flight.len());
                            queue.mark_completed(id).await.unwrap();
                        }
                        Op::Fail(i, retry) if !in_flight.is_empty() => {
                            let id = in_flight.remove(i % in_flight.len());
                            queue.mark_failed(id, None, retry).await.unwrap();
                        }
                        Op::Requeue => {
                            queue.requeue_processing().await.unwrap();
                            in_flight.clear();
                        }
                        _ => {}
                    }

                    let inner = queue.inner.lock().await;
                    for id in &admitted {
                        let memberships = [
                            inner.pending.contains(id),
                            inner.processing.contains(id),
                            inner.completed.contains(id),
                            inner.failed.contains(id),
                        ]
                        .iter()
                        .filter(|m| **m)
                        .count();
                        assert_eq!(memberships, 1, "item {} in {} sets", id, memberships);
                    }
                }
            });
        }

        /// `get()` never returns an item while a higher-priority one is pending.
        #[test]
        fn prop_priority_order(priorities in prop::collection::vec(-50i32..50, 1..40)) {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let queue = PromptQueue::new(RunId::from_seed(2), None);
                for (seed, priority) in priorities.iter().enumerate() {
                    queue.add(item(seed as u64, *priority)).await;
                }
                let mut last = i32::MAX;
                while let Some(next) = queue.get().await {
                    assert!(next.priority <= last);
                    last = next.priority;
                }
            });
        }

        /// An item is terminally failed after exactly `max_retries + 1` attempts.
        #[test]
        fn prop_retry_bound(max_retries in 0u32..6) {
            tokio::runtime::Runtime::new().unwrap().block_on(async {
                let queue = PromptQueue::new(RunId::from_seed(3), None);
                queue.add(item(1, 0).with_max_retries(max_retries)).await;

                let mut attempts = 0;
                while let Some(current) = queue.get().await {
                    attempts += 1;
                    queue.mark_failed(current.id, None, true).await.unwrap();
                }
                assert_eq!(attempts, max_retries + 1);
                assert_eq!(queue.state_of(ItemId::from_seed(1)).await, Some(ItemState::Failed));
            });
        }
    }
}
