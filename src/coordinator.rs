//! The single entry point tying the crate together.
//!
//! Owns one limiter per [`ResourceKind`], the adaptive controller, both
//! schedulers, and the violation log. `start` spawns every background loop
//! against one shared shutdown signal; `shutdown` flips it and awaits them.
//! Both are idempotent. Admission operations before `start` (or after
//! `shutdown`) fail with `NotInitialized`.
//!
//! The caller-supplied [`MetricsSampler`] is teed: every fresh sample also
//! lands in the violation tracker, so denial records carry the load the
//! controller saw most recently.

use crate::adaptive::{
    AdaptationRecord, AdaptiveController, ControllerSettings, ControllerStatus, ProfileKind,
};
use crate::ai::{InferenceOptions, InferenceScheduler, InferenceWork, ModelTarget};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{AdmissionError, ConfigError};
use crate::limiter::{AdmissionPermit, LimiterSnapshot, PointLimiter, QueuedLimiter};
use crate::notify::{NotificationConfig, NotificationScheduler, NotifyStats, SendFn, SendOutcome};
use crate::resource::{baselines, ResourceBaseline, ResourceKind};
use crate::scheduler::TargetReport;
use crate::stress::{MetricsSampler, SamplerHealth, StressSample};
use crate::violations::{ViolationStats, ViolationTracker};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Queue depth above which a scheduler counts as unhealthy in reports.
const HEALTHY_QUEUE_DEPTH: usize = 100;

/// Forwards fresh samples to the violation tracker on the way to the
/// controller.
struct TeeSampler {
    inner: Arc<dyn MetricsSampler>,
    violations: Arc<ViolationTracker>,
}

#[async_trait::async_trait]
impl MetricsSampler for TeeSampler {
    async fn sample(&self) -> Result<StressSample, Box<dyn std::error::Error + Send + Sync>> {
        let sample = self.inner.sample().await?;
        self.violations.note_load(sample);
        Ok(sample)
    }
}

/// Full system snapshot, serializable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub resources: HashMap<ResourceKind, LimiterSnapshot>,
    pub inference_queue_depth: usize,
    pub inference_targets: Vec<TargetReport>,
    pub notifications: NotifyStats,
    pub notification_targets: Vec<TargetReport>,
    pub violations: ViolationStats,
    pub controller: ControllerStatus,
    pub tunnel_connected: bool,
}

/// Structured health summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub resources_configured: usize,
    pub inference_queue_depth: usize,
    pub inference_queue_ok: bool,
    pub notification_queue_depth: usize,
    pub notification_queue_ok: bool,
    pub sampler_health: SamplerHealth,
    pub tunnel_connected: bool,
    /// Resources currently serving a block lockout.
    pub blocked_resources: Vec<ResourceKind>,
}

/// Owns every admission-control component and their background loops.
pub struct Coordinator {
    limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
    violations: Arc<ViolationTracker>,
    controller: Arc<AdaptiveController>,
    inference: InferenceScheduler,
    notifications: NotificationScheduler,
    tunnel_connected: AtomicBool,
    started: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Production wiring: monotonic clock and the built-in baseline table.
    pub fn new(sampler: Arc<dyn MetricsSampler>) -> Self {
        Self::with_parts(sampler, baselines(), Arc::new(MonotonicClock::default()))
    }

    /// Explicit wiring, used by tests to inject a manual clock or a trimmed
    /// baseline table.
    pub fn with_parts(
        sampler: Arc<dyn MetricsSampler>,
        baselines: HashMap<ResourceKind, ResourceBaseline>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut limiters = HashMap::new();
        for (kind, baseline) in &baselines {
            let limiter = PointLimiter::new(*kind, baseline.limiter.clone(), clock.clone());
            limiters.insert(*kind, Arc::new(QueuedLimiter::new(limiter, baseline.queue.clone())));
        }

        let violations = Arc::new(ViolationTracker::new(clock.clone()));
        let tee = Arc::new(TeeSampler { inner: sampler, violations: Arc::clone(&violations) });
        let controller = Arc::new(AdaptiveController::new(
            ControllerSettings::default(),
            tee,
            limiters.clone(),
            baselines,
            clock.clone(),
        ));
        let inference = InferenceScheduler::new(limiters.clone(), Arc::clone(&violations));
        let notifications = NotificationScheduler::new(
            limiters.clone(),
            Arc::clone(&violations),
            clock,
        );

        Self {
            limiters,
            violations,
            controller,
            inference,
            notifications,
            tunnel_connected: AtomicBool::new(true),
            started: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn every background loop. Calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let mut tasks = Vec::new();
        tasks.extend(self.controller.spawn(rx.clone()));
        tasks.push(self.inference.spawn_worker(rx.clone()));
        tasks.extend(self.notifications.spawn(rx));

        *self.shutdown.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        *self.tasks.lock().unwrap_or_else(|p| p.into_inner()) = tasks;
        tracing::info!(resources = self.limiters.len(), "admission control started");
    }

    /// Stop every background loop and reject whatever is still queued.
    /// Calling twice is a no-op.
    pub async fn shutdown(&self) {
        let sender = self.shutdown.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(sender) = sender else { return };
        let _ = sender.send(true);

        let tasks =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("admission control stopped");
    }

    fn ensure_started(&self) -> Result<(), AdmissionError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdmissionError::NotInitialized)
        }
    }

    fn limiter(&self, resource: ResourceKind) -> Result<&Arc<QueuedLimiter>, AdmissionError> {
        self.limiters.get(&resource).ok_or(AdmissionError::UnknownResource(resource))
    }

    /// Consume `points` from one resource, either failing fast or waiting
    /// in the resource's queue. Denials are logged as violations.
    pub async fn consume(
        &self,
        resource: ResourceKind,
        points: u64,
        use_queue: bool,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.ensure_started()?;
        let limiter = self.limiter(resource)?;
        let outcome = if use_queue {
            limiter.consume(points).await
        } else {
            limiter.try_consume(points)
        };
        if let Err(err) = &outcome {
            if err.is_recoverable() {
                let snapshot = limiter.limiter().inspect();
                self.violations.record_denial(
                    resource,
                    snapshot.remaining,
                    err.retry_after().map(|d| d.as_millis() as u64).unwrap_or(0),
                );
            }
        }
        outcome
    }

    /// Current limiter state for one resource, without consuming anything.
    pub fn status(&self, resource: ResourceKind) -> Result<LimiterSnapshot, AdmissionError> {
        Ok(self.limiter(resource)?.limiter().inspect())
    }

    /// Queue an inference request and await its outcome.
    pub async fn submit_inference(
        &self,
        model: ModelTarget,
        work: InferenceWork,
        opts: InferenceOptions,
    ) -> Result<String, AdmissionError> {
        self.ensure_started()?;
        self.inference.submit(model, work, opts).await
    }

    /// Send, batch, or dedup-drop one notification.
    pub async fn send_notification(
        &self,
        config: NotificationConfig,
        send_fn: SendFn,
    ) -> Result<SendOutcome, AdmissionError> {
        self.ensure_started()?;
        self.notifications.send(config, send_fn).await
    }

    /// Admit one tunnel reconnect attempt through its self-limiting budget
    /// and mark the tunnel disconnected until [`set_tunnel_connected`]
    /// flips it back.
    ///
    /// [`set_tunnel_connected`]: Self::set_tunnel_connected
    pub async fn record_tunnel_reconnect(&self) -> Result<AdmissionPermit, AdmissionError> {
        self.ensure_started()?;
        self.tunnel_connected.store(false, Ordering::SeqCst);
        self.consume(ResourceKind::TunnelReconnect, 1, true).await
    }

    pub fn set_tunnel_connected(&self, connected: bool) {
        self.tunnel_connected.store(connected, Ordering::SeqCst);
    }

    pub fn tunnel_connected(&self) -> bool {
        self.tunnel_connected.load(Ordering::SeqCst)
    }

    /// Switch the adaptation strategy by operator-facing name.
    pub fn set_adaptation_profile(&self, name: &str) -> Result<(), ConfigError> {
        self.controller.set_profile(ProfileKind::parse(name)?);
        Ok(())
    }

    /// Most recent adaptation records, newest last.
    pub fn adaptation_history(&self, limit: Option<usize>) -> Vec<AdaptationRecord> {
        self.controller.history(limit)
    }

    /// Restore every baseline budget and forget adaptation and window
    /// state. Queued requests are unaffected.
    pub fn reset_all(&self) {
        self.controller.reset();
        for limiter in self.limiters.values() {
            limiter.limiter().reset();
        }
        tracing::info!("all limiters and adaptation state reset");
    }

    pub fn statistics(&self) -> Statistics {
        let resources = self
            .limiters
            .iter()
            .map(|(kind, limiter)| (*kind, limiter.limiter().inspect()))
            .collect();
        Statistics {
            resources,
            inference_queue_depth: self.inference.queue_depth(),
            inference_targets: self.inference.reports(),
            notifications: self.notifications.stats(),
            notification_targets: self.notifications.reports(),
            violations: self.violations.stats(),
            controller: self.controller.status(),
            tunnel_connected: self.tunnel_connected(),
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let inference_queue_depth = self.inference.queue_depth();
        let notification_queue_depth = self.notifications.queue_depth();
        let inference_queue_ok = inference_queue_depth < HEALTHY_QUEUE_DEPTH;
        let notification_queue_ok = notification_queue_depth < HEALTHY_QUEUE_DEPTH;
        let tunnel_connected = self.tunnel_connected();
        let blocked_resources: Vec<ResourceKind> = self
            .limiters
            .iter()
            .filter(|(_, limiter)| limiter.limiter().inspect().is_blocked)
            .map(|(kind, _)| *kind)
            .collect();
        HealthReport {
            healthy: !self.limiters.is_empty()
                && inference_queue_ok
                && notification_queue_ok
                && tunnel_connected,
            resources_configured: self.limiters.len(),
            inference_queue_depth,
            inference_queue_ok,
            notification_queue_depth,
            notification_queue_ok,
            sampler_health: self.controller.status().sampler_health,
            tunnel_connected,
            blocked_resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct IdleSampler;

    #[async_trait::async_trait]
    impl MetricsSampler for IdleSampler {
        async fn sample(
            &self,
        ) -> Result<StressSample, Box<dyn std::error::Error + Send + Sync>> {
            Ok(StressSample::idle(0))
        }
    }

    fn coordinator() -> (Coordinator, ManualClock) {
        let clock = ManualClock::new();
        let c = Coordinator::with_parts(
            Arc::new(IdleSampler),
            baselines(),
            Arc::new(clock.clone()),
        );
        (c, clock)
    }

    #[tokio::test]
    async fn operations_require_start() {
        let (c, _clock) = coordinator();
        let err = c.consume(ResourceKind::ExchangePublic, 1, false).await.unwrap_err();
        assert_eq!(err, AdmissionError::NotInitialized);

        c.start();
        assert!(c.consume(ResourceKind::ExchangePublic, 1, false).await.is_ok());
        c.shutdown().await;

        let err = c.consume(ResourceKind::ExchangePublic, 1, false).await.unwrap_err();
        assert_eq!(err, AdmissionError::NotInitialized);
    }

    #[tokio::test]
    async fn start_and_shutdown_are_idempotent() {
        let (c, _clock) = coordinator();
        c.start();
        c.start();
        c.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test]
    async fn denial_lands_in_violation_log() {
        let (c, _clock) = coordinator();
        c.start();

        // Tunnel budget is 5 per 5 minutes with a single slot.
        for _ in 0..5 {
            let permit = c.consume(ResourceKind::TunnelReconnect, 1, false).await.unwrap();
            drop(permit);
        }
        let err = c.consume(ResourceKind::TunnelReconnect, 1, false).await.unwrap_err();
        assert!(err.is_recoverable());

        let stats = c.statistics();
        assert_eq!(stats.violations.lifetime[&ResourceKind::TunnelReconnect], 1);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn statistics_serialize_to_json() {
        let (c, _clock) = coordinator();
        c.start();
        let _ = c.consume(ResourceKind::DbQueries, 1, false).await.unwrap();

        let value = serde_json::to_value(c.statistics()).unwrap();
        assert!(value["resources"]["db-queries"]["total_hits"].as_u64().unwrap() >= 1);
        assert_eq!(value["controller"]["active_profile"], "balanced");
        c.shutdown().await;
    }

    #[tokio::test]
    async fn profile_switch_validates_name() {
        let (c, _clock) = coordinator();
        assert!(c.set_adaptation_profile("conservative").is_ok());
        assert_eq!(
            c.set_adaptation_profile("reckless"),
            Err(ConfigError::UnknownProfile("reckless".to_string()))
        );
    }

    #[tokio::test]
    async fn tunnel_reconnect_flips_connectivity() {
        let (c, _clock) = coordinator();
        c.start();
        assert!(c.tunnel_connected());

        let permit = c.record_tunnel_reconnect().await.unwrap();
        assert!(!c.tunnel_connected());
        assert!(!c.health_check().healthy);
        drop(permit);

        c.set_tunnel_connected(true);
        assert!(c.health_check().healthy);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn reset_restores_budgets() {
        let (c, clock) = coordinator();
        c.start();

        for _ in 0..5 {
            let permit = c.consume(ResourceKind::TunnelReconnect, 1, false).await.unwrap();
            drop(permit);
        }
        assert!(c.consume(ResourceKind::TunnelReconnect, 1, false).await.is_err());

        c.reset_all();
        clock.advance(1);
        assert!(c.consume(ResourceKind::TunnelReconnect, 1, false).await.is_ok());
        c.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_resource_without_baseline() {
        let clock = ManualClock::new();
        let mut table = baselines();
        table.remove(&ResourceKind::NewsApi);
        let c = Coordinator::with_parts(Arc::new(IdleSampler), table, Arc::new(clock));
        c.start();

        let err = c.consume(ResourceKind::NewsApi, 1, false).await.unwrap_err();
        assert_eq!(err, AdmissionError::UnknownResource(ResourceKind::NewsApi));
        c.shutdown().await;
    }
}
