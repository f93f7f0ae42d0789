//! Inference request scheduling.
//!
//! Thin instantiation of the generic [`Scheduler`] for the model family:
//! local models A/B/C plus the remote fallback API. Polls fast (100ms),
//! retries limiter denials after ~5s, and tolerates the long tail of
//! inference latency before declaring a model unhealthy.

use crate::error::AdmissionError;
use crate::limiter::QueuedLimiter;
use crate::resource::ResourceKind;
use crate::scheduler::{
    Priority, RequestOptions, Scheduler, SchedulerSettings, Target, TargetReport, Work,
};
use crate::violations::ViolationTracker;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A model the scheduler can route inference to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTarget {
    ModelA,
    ModelB,
    ModelC,
    FallbackApi,
}

impl ModelTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelA => "model-a",
            Self::ModelB => "model-b",
            Self::ModelC => "model-c",
            Self::FallbackApi => "fallback-api",
        }
    }
}

impl std::fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Target for ModelTarget {
    fn resource(&self) -> ResourceKind {
        match self {
            Self::ModelA => ResourceKind::ModelA,
            Self::ModelB => ResourceKind::ModelB,
            Self::ModelC => ResourceKind::ModelC,
            Self::FallbackApi => ResourceKind::FallbackModelApi,
        }
    }
}

/// Unit of inference work: given the routed model, produce the response
/// text or an opaque failure message.
pub type InferenceWork = Work<String, ModelTarget>;

/// Per-request inference knobs with family defaults.
#[derive(Debug, Clone)]
pub struct InferenceOptions {
    pub priority: Priority,
    pub timeout: Duration,
    pub retry_on_limit: bool,
    pub max_retries: u32,
    pub fallback: Option<ModelTarget>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: Duration::from_secs(60),
            retry_on_limit: true,
            max_retries: 2,
            fallback: Some(ModelTarget::FallbackApi),
        }
    }
}

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        name: "inference",
        poll_interval: Duration::from_millis(100),
        retry_delay: Duration::from_secs(5),
        latency_ceiling_ms: 30_000.0,
        min_health_samples: 5,
    }
}

/// Priority scheduler for model-inference requests.
pub struct InferenceScheduler {
    inner: Arc<Scheduler<String, ModelTarget>>,
}

impl InferenceScheduler {
    pub fn new(
        limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
        violations: Arc<ViolationTracker>,
    ) -> Self {
        Self { inner: Arc::new(Scheduler::new(settings(), limiters, violations)) }
    }

    /// Queue an inference request and await its outcome.
    pub async fn submit(
        &self,
        model: ModelTarget,
        work: InferenceWork,
        opts: InferenceOptions,
    ) -> Result<String, AdmissionError> {
        let mut request = RequestOptions::new(opts.priority, opts.timeout);
        if opts.retry_on_limit {
            request = request.with_retry(opts.max_retries);
        }
        if let Some(fallback) = opts.fallback {
            request = request.with_fallback(fallback);
        }
        let rx = self.inner.submit(model, work, request);
        rx.await.unwrap_or(Err(AdmissionError::Cancelled))
    }

    /// Reject all queued requests for one model.
    pub fn clear_model(&self, model: ModelTarget) -> usize {
        self.inner.clear_target(model)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth()
    }

    pub fn model_healthy(&self, model: ModelTarget) -> bool {
        self.inner.target_healthy(model)
    }

    pub fn reports(&self) -> Vec<TargetReport> {
        self.inner.target_reports()
    }

    pub fn spawn_worker(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.inner.spawn_worker(shutdown)
    }
}
