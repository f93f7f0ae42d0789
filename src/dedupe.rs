//! Deduplication and batching for the notification family.
//!
//! Deduplication: a send carrying a dedup key is dropped (not an error)
//! when the same key was successfully sent within the window. Entries are
//! created or refreshed only after a successful send, so a failed send
//! does not suppress its own retry.
//!
//! Batching: batchable items below the top priority tier accumulate per
//! `(target, recipient)` key. A batch flushes into one combined item,
//! carrying the highest priority among its members and the members in
//! submission order, when it reaches `max_size` or a periodic sweep finds
//! it older than `timeout`. Flushed batches are deleted.

use crate::clock::Clock;
use crate::scheduler::Priority;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One distinct dedup key's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DedupEntry {
    last_sent_at_ms: u64,
    /// Successful sends recorded under this key.
    sends: u64,
}

/// Suppresses repeat sends of the same key inside a rolling window
/// (default 5 minutes).
pub struct DedupMap {
    clock: Arc<dyn Clock>,
    window_ms: u64,
    entries: Mutex<HashMap<String, DedupEntry>>,
    deduped: AtomicU64,
}

impl DedupMap {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);

    pub fn new(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            clock,
            window_ms: window.as_millis() as u64,
            entries: Mutex::new(HashMap::new()),
            deduped: AtomicU64::new(0),
        }
    }

    /// Whether a send with `key` should be dropped. Counts the drop.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let Some(entry) = entries.get(key) else { return false };
        if now.saturating_sub(entry.last_sent_at_ms) >= self.window_ms {
            return false;
        }
        self.deduped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, sends = entry.sends, "duplicate send suppressed");
        true
    }

    /// Record a successful send, refreshing the window for `key`.
    pub fn mark_sent(&self, key: &str) {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.last_sent_at_ms = now;
                e.sends += 1;
            })
            .or_insert(DedupEntry { last_sent_at_ms: now, sends: 1 });
    }

    /// Drop expired entries. Run from a periodic sweep.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|_, e| now.saturating_sub(e.last_sent_at_ms) < self.window_ms);
        before - entries.len()
    }

    /// Sends dropped as duplicates, lifetime.
    pub fn deduped_count(&self) -> u64 {
        self.deduped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A flushed batch, ready to become one synthesized queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedBatch<G, M> {
    pub target: G,
    pub recipient: String,
    /// Highest priority among the members.
    pub priority: Priority,
    /// Members in submission order.
    pub items: Vec<M>,
}

struct PendingBatch<M> {
    items: Vec<M>,
    priority: Priority,
    created_at_ms: u64,
}

/// Accumulates batchable items per `(target, recipient)` key.
pub struct Batcher<G, M> {
    clock: Arc<dyn Clock>,
    max_size: usize,
    timeout_ms: u64,
    pending: Mutex<HashMap<(G, String), PendingBatch<M>>>,
    flushed: AtomicU64,
}

impl<G, M> Batcher<G, M>
where
    G: Copy + Eq + Hash,
{
    pub const DEFAULT_MAX_SIZE: usize = 10;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(clock: Arc<dyn Clock>, max_size: usize, timeout: Duration) -> Self {
        Self {
            clock,
            max_size: max_size.max(1),
            timeout_ms: timeout.as_millis() as u64,
            pending: Mutex::new(HashMap::new()),
            flushed: AtomicU64::new(0),
        }
    }

    /// Add one item. Returns the batch when this push filled it.
    pub fn push(
        &self,
        target: G,
        recipient: &str,
        priority: Priority,
        item: M,
    ) -> Option<FlushedBatch<G, M>> {
        let now = self.clock.now_millis();
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let key = (target, recipient.to_string());
        let batch = pending.entry(key).or_insert_with(|| PendingBatch {
            items: Vec::new(),
            priority,
            created_at_ms: now,
        });
        batch.items.push(item);
        batch.priority = batch.priority.max(priority);
        if batch.items.len() >= self.max_size {
            if let Some((key, batch)) = pending.remove_entry(&(target, recipient.to_string())) {
                self.flushed.fetch_add(1, Ordering::Relaxed);
                return Some(FlushedBatch {
                    target: key.0,
                    recipient: key.1,
                    priority: batch.priority,
                    items: batch.items,
                });
            }
        }
        None
    }

    /// Flush every batch older than the timeout. Run from a periodic sweep.
    pub fn sweep(&self) -> Vec<FlushedBatch<G, M>> {
        let now = self.clock.now_millis();
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<(G, String)> = pending
            .iter()
            .filter(|(_, b)| now.saturating_sub(b.created_at_ms) >= self.timeout_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let mut flushed = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(batch) = pending.remove(&key) {
                self.flushed.fetch_add(1, Ordering::Relaxed);
                flushed.push(FlushedBatch {
                    target: key.0,
                    recipient: key.1,
                    priority: batch.priority,
                    items: batch.items,
                });
            }
        }
        flushed
    }

    /// Batches flushed, lifetime.
    pub fn flushed_count(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Batches currently accumulating.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
