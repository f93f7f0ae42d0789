#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Adaptive admission control for Rust services: per-resource rate limiting,
//! bounded queues, stress-driven budget adaptation, and priority scheduling
//! for expensive request families.
//!
//! ## Features
//!
//! - **Point limiters** with fixed windows, even-spread smoothing, and
//!   penalty lockouts
//! - **Bounded queues** with concurrency caps and per-resource wait deadlines
//! - **Adaptive budgets** scaled by a composite CPU/memory/network/disk
//!   stress score, with hysteresis and linear recovery
//! - **Priority schedulers** for inference and notifications: retry with
//!   jitter, one-shot fallback substitution, health-gated routing
//! - **Dedup and batching** for the notification family
//! - **Violation log** attaching system load to every denial
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use floodgate::{Coordinator, MetricsSampler, ResourceKind, StressSample};
//! use std::sync::Arc;
//!
//! struct HostSampler;
//!
//! #[async_trait::async_trait]
//! impl MetricsSampler for HostSampler {
//!     async fn sample(
//!         &self,
//!     ) -> Result<StressSample, Box<dyn std::error::Error + Send + Sync>> {
//!         // Read real host metrics here.
//!         Ok(StressSample::idle(0))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Coordinator::new(Arc::new(HostSampler));
//!     coordinator.start();
//!
//!     match coordinator.consume(ResourceKind::ExchangeOrders, 1, true).await {
//!         Ok(permit) => {
//!             // Place the order while holding the permit.
//!             drop(permit);
//!         }
//!         Err(err) => eprintln!("order not admitted: {err}"),
//!     }
//!
//!     coordinator.shutdown().await;
//! }
//! ```

pub mod adaptive;
pub mod ai;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dedupe;
pub mod error;
pub mod limiter;
pub mod notify;
pub mod resource;
pub mod scheduler;
pub mod stress;
pub mod violations;

// Re-exports
pub use adaptive::{AdaptationRecord, AdaptiveController, ControllerStatus, ProfileKind};
pub use ai::{InferenceOptions, InferenceScheduler, InferenceWork, ModelTarget};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use coordinator::{Coordinator, HealthReport, Statistics};
pub use error::{AdmissionError, ConfigError};
pub use limiter::{
    Admission, AdmissionPermit, LimiterConfig, LimiterSnapshot, PointLimiter, QueuePolicy,
    QueuedLimiter,
};
pub use notify::{Channel, NotificationConfig, NotificationScheduler, SendFn, SendOutcome};
pub use resource::{baselines, ResourceBaseline, ResourceKind};
pub use scheduler::{Priority, RequestOptions, Scheduler, Target, TargetReport, Work};
pub use stress::{stress_level, CriticalLevels, MetricsSampler, SamplerHealth, StressSample};
pub use violations::{ViolationRecord, ViolationStats, ViolationTracker};
