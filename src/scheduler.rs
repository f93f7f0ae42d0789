//! Generic priority scheduler shared by the inference and notification
//! request families.
//!
//! Semantics:
//! - Insertion is priority-ordered, FIFO within a priority tier (binary
//!   heap keyed on priority with a sequence tie-break).
//! - A single worker loop per scheduler instance pops at most one item per
//!   poll, consumes the target's limiter through the queued wrapper, runs
//!   the caller's unit of work under a type-specific timeout, and resolves
//!   the caller over a oneshot channel. Delivery is at most once.
//! - A recoverable limiter denial with retry budget left re-enqueues the
//!   item after a jittered delay, preserving its priority.
//! - A work failure with an unused fallback target substitutes the fallback
//!   and re-enqueues once, without consuming a retry.
//! - Targets whose rolling success rate drops below 70% (after a minimum
//!   sample count) or whose moving-average latency exceeds their ceiling
//!   are unhealthy; new items route to the fallback automatically.
//! - `clear_target` rejects all matching queued items immediately;
//!   in-flight items are not interrupted, only their re-enqueue is
//!   suppressed.
//! - `clear_all` closes the queue: everything still queued, sleeping in a
//!   retry, or submitted afterwards resolves as `Cancelled`, so callers
//!   always hear back. The worker loop reopens the queue when it starts.

use crate::error::AdmissionError;
use crate::limiter::QueuedLimiter;
use crate::resource::ResourceKind;
use crate::violations::ViolationTracker;
use futures::future::BoxFuture;
use rand::{rng, Rng};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Success rate below which a target is unhealthy.
const HEALTH_SUCCESS_FLOOR: f64 = 0.7;
/// Smoothing factor of the latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.1;

/// Request priority. Ordered; `Emergency` is reserved for the notification
/// family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
    Emergency,
}

/// A schedulable destination: a model or a notification channel, each
/// backed by exactly one limiter resource.
pub trait Target:
    Copy + Eq + Hash + std::fmt::Display + Send + Sync + 'static
{
    fn resource(&self) -> ResourceKind;
}

/// Caller-supplied unit of work, re-invokable for retries and fallback
/// substitution. The string error is an opaque failure message; the
/// scheduler classifies timeouts itself.
pub type Work<T, G> = Arc<dyn Fn(G) -> BoxFuture<'static, Result<T, String>> + Send + Sync>;

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct RequestOptions<G> {
    pub priority: Priority,
    pub timeout: Duration,
    pub retry_on_limit: bool,
    pub max_retries: u32,
    pub fallback: Option<G>,
}

impl<G> RequestOptions<G> {
    pub fn new(priority: Priority, timeout: Duration) -> Self {
        Self { priority, timeout, retry_on_limit: false, max_retries: 0, fallback: None }
    }

    #[must_use]
    pub fn with_retry(mut self, max_retries: u32) -> Self {
        self.retry_on_limit = true;
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: G) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Fixed cadences and health knobs for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub name: &'static str,
    pub poll_interval: Duration,
    /// Base re-enqueue delay after a recoverable denial; equal-jittered.
    pub retry_delay: Duration,
    /// Moving-average latency above which a target is unhealthy.
    pub latency_ceiling_ms: f64,
    /// Completed attempts before the health gate arms.
    pub min_health_samples: u64,
}

struct Item<T, G> {
    /// Sequence at first submission; cancellation watermark.
    born: u64,
    /// Sequence of the latest enqueue; heap FIFO tie-break.
    seq: u64,
    priority: Priority,
    target: G,
    work: Work<T, G>,
    opts: RequestOptions<G>,
    retry_count: u32,
    fallback_used: bool,
    responder: oneshot::Sender<Result<T, AdmissionError>>,
}

struct HeapItem<T, G>(Item<T, G>);

impl<T, G> PartialEq for HeapItem<T, G> {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.seq == other.0.seq
    }
}
impl<T, G> Eq for HeapItem<T, G> {}
impl<T, G> PartialOrd for HeapItem<T, G> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<T, G> Ord for HeapItem<T, G> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

#[derive(Debug, Clone, Default)]
struct TargetStats {
    ema_latency_ms: f64,
    attempts: u64,
    successes: u64,
    last_used: Option<Instant>,
}

impl TargetStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Reportable per-target metrics.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub ema_latency_ms: f64,
    pub success_rate: f64,
    pub attempts: u64,
    /// Milliseconds since the target last completed an attempt.
    pub idle_ms: Option<u64>,
    pub healthy: bool,
}

/// Priority queue plus single worker loop for one request family.
pub struct Scheduler<T, G: Target> {
    settings: SchedulerSettings,
    limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
    violations: Arc<ViolationTracker>,
    queue: Mutex<BinaryHeap<HeapItem<T, G>>>,
    stats: Mutex<HashMap<G, TargetStats>>,
    seq: AtomicU64,
    /// Per-target cancellation watermark: items born at or before it are
    /// rejected instead of re-enqueued.
    cleared: Mutex<HashMap<G, u64>>,
    /// Set by `clear_all`; submissions and re-enqueues resolve as
    /// `Cancelled` while the queue is closed.
    closed: AtomicBool,
}

impl<T, G> Scheduler<T, G>
where
    T: Send + 'static,
    G: Target,
{
    pub fn new(
        settings: SchedulerSettings,
        limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
        violations: Arc<ViolationTracker>,
    ) -> Self {
        Self {
            settings,
            limiters,
            violations,
            queue: Mutex::new(BinaryHeap::new()),
            stats: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            cleared: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.settings.name
    }

    /// Queue an item and receive its eventual outcome.
    pub fn submit(
        &self,
        target: G,
        work: Work<T, G>,
        opts: RequestOptions<G>,
    ) -> oneshot::Receiver<Result<T, AdmissionError>> {
        let (tx, rx) = oneshot::channel();
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(Err(AdmissionError::Cancelled));
            return rx;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let item = Item {
            born: seq,
            seq,
            priority: opts.priority,
            target,
            work,
            opts,
            retry_count: 0,
            fallback_used: false,
            responder: tx,
        };
        tracing::debug!(
            scheduler = self.settings.name,
            target = %target,
            priority = ?item.priority,
            "request queued"
        );
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).push(HeapItem(item));
        rx
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Reject all queued items for `target` immediately and suppress the
    /// re-enqueue of anything currently in flight against it.
    pub fn clear_target(&self, target: G) -> usize {
        let watermark = self.seq.load(Ordering::SeqCst);
        self.cleared.lock().unwrap_or_else(|p| p.into_inner()).insert(target, watermark);

        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let drained = std::mem::take(&mut *queue).into_vec();
        let mut rejected = 0;
        for HeapItem(item) in drained {
            if item.target == target {
                let _ = item.responder.send(Err(AdmissionError::Cancelled));
                rejected += 1;
            } else {
                queue.push(HeapItem(item));
            }
        }
        if rejected > 0 {
            tracing::info!(
                scheduler = self.settings.name,
                target = %target,
                rejected,
                "queue cleared for target"
            );
        }
        rejected
    }

    /// Close the queue and reject everything still in it. The worker's
    /// final act at shutdown; retries that fire afterwards resolve as
    /// `Cancelled` instead of landing in a dead queue.
    pub fn clear_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let drained = std::mem::take(&mut *queue).into_vec();
        let rejected = drained.len();
        for HeapItem(item) in drained {
            let _ = item.responder.send(Err(AdmissionError::Cancelled));
        }
        rejected
    }

    fn is_cleared(&self, item: &Item<T, G>) -> bool {
        self.cleared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&item.target)
            .is_some_and(|watermark| item.born <= *watermark)
    }

    /// Whether the health gate currently passes for `target`.
    pub fn target_healthy(&self, target: G) -> bool {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        match stats.get(&target) {
            Some(s) if s.attempts >= self.settings.min_health_samples => {
                s.success_rate() >= HEALTH_SUCCESS_FLOOR
                    && s.ema_latency_ms <= self.settings.latency_ceiling_ms
            }
            _ => true,
        }
    }

    pub fn target_reports(&self) -> Vec<TargetReport> {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats
            .iter()
            .map(|(target, s)| TargetReport {
                target: target.to_string(),
                ema_latency_ms: s.ema_latency_ms,
                success_rate: s.success_rate(),
                attempts: s.attempts,
                idle_ms: s.last_used.map(|at| at.elapsed().as_millis() as u64),
                healthy: s.attempts < self.settings.min_health_samples
                    || (s.success_rate() >= HEALTH_SUCCESS_FLOOR
                        && s.ema_latency_ms <= self.settings.latency_ceiling_ms),
            })
            .collect()
    }

    fn record_outcome(&self, target: G, latency: Duration, success: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats.entry(target).or_default();
        let latency_ms = latency.as_millis() as f64;
        entry.ema_latency_ms = if entry.attempts == 0 {
            latency_ms
        } else {
            LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * entry.ema_latency_ms
        };
        entry.attempts += 1;
        if success {
            entry.successes += 1;
        }
        entry.last_used = Some(Instant::now());
    }

    fn requeue(&self, mut item: Item<T, G>) {
        if self.closed.load(Ordering::SeqCst) || self.is_cleared(&item) {
            let _ = item.responder.send(Err(AdmissionError::Cancelled));
            return;
        }
        item.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).push(HeapItem(item));
    }

    fn schedule_retry(self: &Arc<Self>, item: Item<T, G>) {
        // Equal jitter: at least half the configured delay, at most all of it.
        let millis = self.settings.retry_delay.as_millis() as u64;
        let jittered = if millis > 1 {
            rng().random_range(millis / 2..=millis)
        } else {
            millis
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(jittered)).await;
            scheduler.requeue(item);
        });
    }

    /// Pop and process the queue head. Returns false when the queue was
    /// empty.
    pub async fn process_one(self: &Arc<Self>) -> bool {
        let Some(HeapItem(mut item)) =
            self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop()
        else {
            return false;
        };
        if item.responder.is_closed() {
            return true; // caller gave up; nothing to deliver
        }
        if self.is_cleared(&item) {
            let _ = item.responder.send(Err(AdmissionError::Cancelled));
            return true;
        }

        // Health-gated routing, independent of error-triggered fallback.
        if !item.fallback_used && !self.target_healthy(item.target) {
            if let Some(fallback) = item.opts.fallback {
                tracing::warn!(
                    scheduler = self.settings.name,
                    from = %item.target,
                    to = %fallback,
                    "target unhealthy, routing to fallback"
                );
                item.target = fallback;
                item.fallback_used = true;
            }
        }

        let resource = item.target.resource();
        let Some(limiter) = self.limiters.get(&resource) else {
            let _ = item.responder.send(Err(AdmissionError::UnknownResource(resource)));
            return true;
        };

        match limiter.consume(1).await {
            Ok(permit) => {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(item.opts.timeout, (item.work)(item.target)).await;
                let latency = started.elapsed();
                drop(permit);
                self.finish(item, outcome, latency);
            }
            Err(err) => {
                let snapshot = limiter.limiter().inspect();
                self.violations.record_denial(
                    resource,
                    snapshot.remaining,
                    err.retry_after().map(|d| d.as_millis() as u64).unwrap_or(0),
                );
                if item.opts.retry_on_limit
                    && err.is_recoverable()
                    && item.retry_count < item.opts.max_retries
                {
                    item.retry_count += 1;
                    tracing::debug!(
                        scheduler = self.settings.name,
                        target = %item.target,
                        retry = item.retry_count,
                        "denied, retry scheduled"
                    );
                    self.schedule_retry(item);
                } else {
                    let _ = item.responder.send(Err(err));
                }
            }
        }
        true
    }

    fn finish(
        &self,
        mut item: Item<T, G>,
        outcome: Result<Result<T, String>, tokio::time::error::Elapsed>,
        latency: Duration,
    ) {
        match outcome {
            Ok(Ok(value)) => {
                self.record_outcome(item.target, latency, true);
                let _ = item.responder.send(Ok(value));
            }
            Ok(Err(message)) => {
                self.record_outcome(item.target, latency, false);
                if let Some(fallback) = self.substitution(&item) {
                    tracing::warn!(
                        scheduler = self.settings.name,
                        from = %item.target,
                        to = %fallback,
                        error = %message,
                        "work failed, substituting fallback"
                    );
                    item.target = fallback;
                    item.fallback_used = true;
                    self.requeue(item);
                } else {
                    let _ = item.responder.send(Err(AdmissionError::WorkFailed(message)));
                }
            }
            Err(_elapsed) => {
                self.record_outcome(item.target, latency, false);
                if let Some(fallback) = self.substitution(&item) {
                    tracing::warn!(
                        scheduler = self.settings.name,
                        from = %item.target,
                        to = %fallback,
                        "work timed out, substituting fallback"
                    );
                    item.target = fallback;
                    item.fallback_used = true;
                    self.requeue(item);
                } else {
                    let _ = item.responder.send(Err(AdmissionError::WorkTimeout {
                        elapsed: latency,
                        limit: item.opts.timeout,
                    }));
                }
            }
        }
    }

    /// Fallback substitution applies once, and only before any retry.
    fn substitution(&self, item: &Item<T, G>) -> Option<G> {
        if item.fallback_used || item.retry_count > 0 {
            return None;
        }
        item.opts.fallback.filter(|fb| *fb != item.target)
    }

    /// Spawn the worker loop; processes at most one item per poll.
    pub fn spawn_worker(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(scheduler = scheduler.settings.name, "worker loop started");
            scheduler.closed.store(false, Ordering::SeqCst);
            let mut tick = tokio::time::interval(scheduler.settings.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        scheduler.process_one().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            let rejected = scheduler.clear_all();
            tracing::info!(
                scheduler = scheduler.settings.name,
                rejected,
                "worker loop stopped"
            );
        })
    }
}
