//! Outbound notification scheduling.
//!
//! Instantiation of the generic [`Scheduler`] for the notification family
//! (bot and mail channels), layered with deduplication and batching:
//! - A send carrying a dedup key seen within the window is dropped and
//!   acknowledged as [`SendOutcome::Deduped`].
//! - Batchable sends below `Emergency` accumulate per
//!   `(channel, recipient)` and are acknowledged as
//!   [`SendOutcome::Batched`]; the flushed batch becomes one synthesized,
//!   non-batchable item carrying the highest member priority.
//! - Everything else is queued directly and awaited to a terminal
//!   [`SendOutcome::Sent`] or a typed failure.
//!
//! Dedup entries are only refreshed after a successful delivery.

use crate::dedupe::{Batcher, DedupMap, FlushedBatch};
use crate::error::AdmissionError;
use crate::limiter::QueuedLimiter;
use crate::resource::ResourceKind;
use crate::scheduler::{Priority, RequestOptions, Scheduler, SchedulerSettings, Target, TargetReport, Work};
use crate::violations::ViolationTracker;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A notification channel, each backed by its own limiter resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    Bot,
    Mail,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "channel-bot",
            Self::Mail => "channel-mail",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Target for Channel {
    fn resource(&self) -> ResourceKind {
        match self {
            Self::Bot => ResourceKind::ChannelBot,
            Self::Mail => ResourceKind::ChannelMail,
        }
    }
}

/// Caller-supplied transport: deliver `message` to `recipient` over the
/// routed channel.
pub type SendFn =
    Arc<dyn Fn(Channel, String, String) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// One outbound notification.
#[derive(Clone)]
pub struct NotificationConfig {
    pub channel: Channel,
    pub priority: Priority,
    pub recipient: String,
    pub message: String,
    pub dedup_key: Option<String>,
    pub batchable: bool,
    pub fallback: Option<Channel>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl NotificationConfig {
    pub fn new(
        channel: Channel,
        recipient: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            priority: Priority::Normal,
            recipient: recipient.into(),
            message: message.into(),
            dedup_key: None,
            batchable: false,
            fallback: None,
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn batchable(mut self) -> Self {
        self.batchable = true;
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, channel: Channel) -> Self {
        self.fallback = Some(channel);
        self
    }
}

/// Terminal acknowledgement of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendOutcome {
    /// Delivered (possibly after retry or over the fallback channel).
    Sent,
    /// Dropped as a duplicate inside the dedup window. Not an error.
    Deduped,
    /// Accepted into a batch; delivery happens when the batch flushes.
    Batched,
}

/// Reportable notification-layer counters.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyStats {
    pub queue_depth: usize,
    pub deduped: u64,
    pub batches_flushed: u64,
    pub pending_batches: usize,
    pub dedup_entries: usize,
}

struct BatchMember {
    message: String,
    dedup_key: Option<String>,
    send: SendFn,
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        name: "notify",
        poll_interval: Duration::from_secs(1),
        retry_delay: Duration::from_secs(2),
        latency_ceiling_ms: 10_000.0,
        min_health_samples: 5,
    }
}

const BATCH_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Defaults for synthesized batch items.
const BATCH_SEND_TIMEOUT: Duration = Duration::from_secs(15);
const BATCH_SEND_RETRIES: u32 = 3;

/// Priority scheduler for outbound notifications, with dedup and batching.
pub struct NotificationScheduler {
    inner: Arc<Scheduler<(), Channel>>,
    dedup: Arc<DedupMap>,
    batcher: Arc<Batcher<Channel, BatchMember>>,
}

impl NotificationScheduler {
    pub fn new(
        limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
        violations: Arc<ViolationTracker>,
        clock: Arc<dyn crate::clock::Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Scheduler::new(settings(), limiters, violations)),
            dedup: Arc::new(DedupMap::new(clock.clone(), DedupMap::DEFAULT_WINDOW)),
            batcher: Arc::new(Batcher::new(
                clock,
                Batcher::<Channel, BatchMember>::DEFAULT_MAX_SIZE,
                Batcher::<Channel, BatchMember>::DEFAULT_TIMEOUT,
            )),
        }
    }

    /// Send (or batch, or drop) one notification.
    pub async fn send(
        &self,
        config: NotificationConfig,
        send_fn: SendFn,
    ) -> Result<SendOutcome, AdmissionError> {
        if let Some(key) = &config.dedup_key {
            if self.dedup.is_duplicate(key) {
                tracing::debug!(channel = %config.channel, key = %key, "notification deduped");
                return Ok(SendOutcome::Deduped);
            }
        }

        if config.batchable && config.priority < Priority::Emergency {
            let member = BatchMember {
                message: config.message.clone(),
                dedup_key: config.dedup_key.clone(),
                send: send_fn.clone(),
            };
            if let Some(batch) =
                self.batcher.push(config.channel, &config.recipient, config.priority, member)
            {
                self.dispatch_batch(batch);
            }
            return Ok(SendOutcome::Batched);
        }

        let rx = self.enqueue(
            config.channel,
            config.priority,
            config.timeout,
            config.max_retries,
            config.fallback,
            config.recipient.clone(),
            config.message.clone(),
            send_fn,
        );
        rx.await.unwrap_or(Err(AdmissionError::Cancelled))?;
        if let Some(key) = &config.dedup_key {
            self.dedup.mark_sent(key);
        }
        Ok(SendOutcome::Sent)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        &self,
        channel: Channel,
        priority: Priority,
        timeout: Duration,
        max_retries: u32,
        fallback: Option<Channel>,
        recipient: String,
        message: String,
        send_fn: SendFn,
    ) -> tokio::sync::oneshot::Receiver<Result<(), AdmissionError>> {
        let work: Work<(), Channel> =
            Arc::new(move |routed| send_fn(routed, recipient.clone(), message.clone()));
        let mut opts = RequestOptions::new(priority, timeout).with_retry(max_retries);
        if let Some(fb) = fallback {
            opts = opts.with_fallback(fb);
        }
        self.inner.submit(channel, work, opts)
    }

    fn dispatch_batch(&self, batch: FlushedBatch<Channel, BatchMember>) {
        dispatch_batch(&self.inner, &self.dedup, batch);
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    pub fn clear_channel(&self, channel: Channel) -> usize {
        self.inner.clear_target(channel)
    }

    pub fn channel_healthy(&self, channel: Channel) -> bool {
        self.inner.target_healthy(channel)
    }

    pub fn reports(&self) -> Vec<TargetReport> {
        self.inner.target_reports()
    }

    pub fn stats(&self) -> NotifyStats {
        NotifyStats {
            queue_depth: self.inner.queue_depth(),
            deduped: self.dedup.deduped_count(),
            batches_flushed: self.batcher.flushed_count(),
            pending_batches: self.batcher.pending_count(),
            dedup_entries: self.dedup.len(),
        }
    }

    /// Spawn the worker loop plus the batch and dedup sweeps.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.inner.spawn_worker(shutdown.clone())];

        let batcher = Arc::clone(&self.batcher);
        let inner = Arc::clone(&self.inner);
        let sweep_dedup = Arc::clone(&self.dedup);
        let mut sweep_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(BATCH_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for batch in batcher.sweep() {
                            dispatch_batch(&inner, &sweep_dedup, batch);
                        }
                    }
                    changed = sweep_shutdown.changed() => {
                        if changed.is_err() || *sweep_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let dedup = Arc::clone(&self.dedup);
        let mut cleanup_shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEDUP_CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let dropped = dedup.cleanup();
                        if dropped > 0 {
                            tracing::debug!(dropped, "dedup entries expired");
                        }
                    }
                    changed = cleanup_shutdown.changed() => {
                        if changed.is_err() || *cleanup_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}

/// Turn a flushed batch into one synthesized, non-batchable item. Member
/// dedup keys are only marked sent once the combined delivery succeeds.
fn dispatch_batch(
    inner: &Arc<Scheduler<(), Channel>>,
    dedup: &Arc<DedupMap>,
    batch: FlushedBatch<Channel, BatchMember>,
) {
    let count = batch.items.len();
    let combined = batch
        .items
        .iter()
        .map(|m| m.message.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let keys: Vec<String> = batch.items.iter().filter_map(|m| m.dedup_key.clone()).collect();
    let Some(first) = batch.items.into_iter().next() else { return };

    tracing::debug!(
        channel = %batch.target,
        recipient = %batch.recipient,
        count,
        "batch flushed"
    );
    let recipient = batch.recipient;
    let send_fn = first.send;
    let work: Work<(), Channel> =
        Arc::new(move |routed| send_fn(routed, recipient.clone(), combined.clone()));
    let opts =
        RequestOptions::new(batch.priority, BATCH_SEND_TIMEOUT).with_retry(BATCH_SEND_RETRIES);
    let rx = inner.submit(batch.target, work, opts);

    let dedup = Arc::clone(dedup);
    let channel = batch.target;
    tokio::spawn(async move {
        match rx.await.unwrap_or(Err(AdmissionError::Cancelled)) {
            Ok(()) => {
                for key in keys {
                    dedup.mark_sent(&key);
                }
            }
            Err(err) => {
                tracing::warn!(channel = %channel, error = %err, "batched send failed");
            }
        }
    });
}
