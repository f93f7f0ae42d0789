//! Bounded, timeout-aware waiting on top of the point limiter.
//!
//! Wraps one resource's [`PointLimiter`] with:
//! - `max_concurrency`: simultaneous in-flight consumers, enforced with a
//!   semaphore whose permit travels inside the returned [`AdmissionPermit`].
//! - `max_queue_size`: callers allowed to wait for a slot; beyond that the
//!   wrapper fails fast with `QueueFull`.
//! - `timeout`: the longest any caller waits before `QueueTimeout`.
//!
//! A waiting caller sleeps for the limiter's advertised `retry_after`
//! (capped by its deadline) between attempts, so denials turn into bounded
//! waits instead of hot spins. Every wait in this module has a deadline.

use crate::error::{AdmissionError, ConfigError};
use crate::limiter::core::PointLimiter;
use crate::limiter::Admission;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Queue shape for one resource, tuned to its criticality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    max_concurrency: usize,
    max_queue_size: usize,
    timeout: Duration,
}

impl QueuePolicy {
    pub fn new(
        max_concurrency: usize,
        max_queue_size: usize,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self { max_concurrency, max_queue_size, timeout })
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Proof of admission. Holding it keeps one concurrency slot occupied;
/// dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _slot: OwnedSemaphorePermit,
    remaining: u64,
}

impl AdmissionPermit {
    /// Points left in the window at grant time.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

/// Decrements the waiter count when a queued caller leaves, on any path.
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One resource's limiter plus its waiting room.
#[derive(Debug)]
pub struct QueuedLimiter {
    limiter: Arc<PointLimiter>,
    policy: QueuePolicy,
    slots: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl QueuedLimiter {
    pub fn new(limiter: PointLimiter, policy: QueuePolicy) -> Self {
        let slots = Arc::new(Semaphore::new(policy.max_concurrency()));
        Self { limiter: Arc::new(limiter), policy, slots, waiting: AtomicUsize::new(0) }
    }

    /// The wrapped limiter, for inspection and config swaps.
    pub fn limiter(&self) -> &PointLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Callers currently waiting for a slot or a window.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Consume without waiting: a denial or an occupied slot fails fast.
    pub fn try_consume(&self, points: u64) -> Result<AdmissionPermit, AdmissionError> {
        let slot = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| AdmissionError::QueueFull(self.limiter.resource()))?;
        match self.limiter.consume(points) {
            Admission::Granted { remaining } => Ok(AdmissionPermit { _slot: slot, remaining }),
            Admission::Denied { retry_after, .. } => Err(AdmissionError::RateLimited {
                resource: self.limiter.resource(),
                retry_after,
            }),
        }
    }

    /// Consume, waiting up to the policy timeout for a slot and a window.
    ///
    /// Callers that can be granted immediately bypass the waiting room.
    /// Otherwise the caller joins it, bounded by `max_queue_size`
    /// (`QueueFull` beyond that) and by the policy timeout (`QueueTimeout`).
    pub async fn consume(&self, points: u64) -> Result<AdmissionPermit, AdmissionError> {
        let resource = self.limiter.resource();

        // Fast path: free slot and open budget.
        if let Ok(slot) = self.slots.clone().try_acquire_owned() {
            match self.limiter.consume(points) {
                Admission::Granted { remaining } => {
                    return Ok(AdmissionPermit { _slot: slot, remaining });
                }
                Admission::Denied { .. } => drop(slot),
            }
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.policy.max_queue_size() {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(resource = %resource, "admission queue full");
            return Err(AdmissionError::QueueFull(resource));
        }
        let _guard = WaitGuard(&self.waiting);

        let deadline = Instant::now() + self.policy.timeout();
        let slot = tokio::time::timeout_at(deadline, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| AdmissionError::QueueTimeout(resource))?
            .map_err(|_| AdmissionError::QueueTimeout(resource))?;

        loop {
            match self.limiter.consume(points) {
                Admission::Granted { remaining } => {
                    return Ok(AdmissionPermit { _slot: slot, remaining });
                }
                Admission::Denied { retry_after, .. } => {
                    let now = Instant::now();
                    if now + retry_after >= deadline {
                        tracing::debug!(
                            resource = %resource,
                            wait_ms = retry_after.as_millis() as u64,
                            "window wait exceeds queue deadline"
                        );
                        return Err(AdmissionError::QueueTimeout(resource));
                    }
                    tokio::time::sleep(retry_after.max(Duration::from_millis(10))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::limiter::LimiterConfig;
    use crate::resource::ResourceKind;

    fn queued(points: u64, window: Duration, policy: QueuePolicy) -> QueuedLimiter {
        let cfg = LimiterConfig::new(points, window).unwrap();
        let limiter =
            PointLimiter::new(ResourceKind::ModelA, cfg, Arc::new(MonotonicClock::default()));
        QueuedLimiter::new(limiter, policy)
    }

    #[tokio::test]
    async fn grants_within_budget() {
        let policy = QueuePolicy::new(2, 10, Duration::from_secs(1)).unwrap();
        let q = queued(5, Duration::from_secs(60), policy);

        let permit = q.consume(1).await.unwrap();
        assert_eq!(permit.remaining(), 4);
    }

    #[tokio::test]
    async fn try_consume_fails_fast_on_denial() {
        let policy = QueuePolicy::new(2, 10, Duration::from_secs(1)).unwrap();
        let q = queued(1, Duration::from_secs(60), policy);

        assert!(q.try_consume(1).is_ok());
        let err = q.try_consume(1).unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_wait_times_out() {
        let policy = QueuePolicy::new(1, 10, Duration::from_millis(200)).unwrap();
        let q = queued(1, Duration::from_secs(60), policy);

        let first = q.consume(1).await.unwrap();
        let err = q.consume(1).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueTimeout(ResourceKind::ModelA));
        drop(first);
    }

    #[tokio::test]
    async fn queue_full_when_waiting_room_at_capacity() {
        let policy = QueuePolicy::new(1, 0, Duration::from_millis(100)).unwrap();
        let q = Arc::new(queued(10, Duration::from_secs(60), policy));

        // Hold the only slot so the next caller must wait, for which there
        // is no room.
        let held = q.consume(1).await.unwrap();
        let err = q.consume(1).await.unwrap_err();
        assert_eq!(err, AdmissionError::QueueFull(ResourceKind::ModelA));
        drop(held);
    }

    #[tokio::test]
    async fn slot_released_on_permit_drop() {
        let policy = QueuePolicy::new(1, 5, Duration::from_secs(1)).unwrap();
        let q = queued(10, Duration::from_secs(60), policy);

        let permit = q.consume(1).await.unwrap();
        drop(permit);
        assert!(q.consume(1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_within_deadline() {
        // 1 point per 1s window; the second consume waits out the window.
        let clock = crate::clock::ManualClock::new();
        let cfg = LimiterConfig::new(1, Duration::from_secs(1)).unwrap();
        let limiter = PointLimiter::new(ResourceKind::ModelA, cfg, Arc::new(clock.clone()));
        let policy = QueuePolicy::new(2, 5, Duration::from_secs(5)).unwrap();
        let q = Arc::new(QueuedLimiter::new(limiter, policy));

        let first = q.consume(1).await.unwrap();
        drop(first);

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.consume(1).await })
        };
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        clock.advance(1_100);
        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }
}
