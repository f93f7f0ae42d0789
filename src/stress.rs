//! System stress sampling and scoring.
//!
//! The concrete sampler lives in the embedding application; this module
//! defines the port ([`MetricsSampler`]), the sample shape, and the
//! composite stress score the adaptive controller runs on.
//!
//! A sampler failure is surfaced as [`SamplerHealth::Degraded`]: the
//! controller pins network latency at its critical threshold ("assume high
//! latency") and keeps the other dimensions at their last known values. It
//! never substitutes a fabricated full sample, so a sampler outage stays
//! visible in health reports.

use serde::Serialize;

/// One reading of host load, produced per sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StressSample {
    /// Milliseconds since controller start (monotonic clock).
    pub taken_at_ms: u64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_latency_ms: f64,
    pub disk_percent: f64,
}

/// Port to the host metrics source.
///
/// Implementations must return within the sampling tick interval; a slow or
/// failing sampler is treated as high latency by the controller.
#[async_trait::async_trait]
pub trait MetricsSampler: Send + Sync {
    async fn sample(&self) -> Result<StressSample, Box<dyn std::error::Error + Send + Sync>>;
}

/// Whether the controller is running on fresh or degraded samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerHealth {
    /// The last sampling tick produced a real sample.
    Fresh,
    /// The sampler failed or has not produced a sample yet.
    Degraded,
}

/// Critical levels each stress dimension is normalized against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CriticalLevels {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_latency_ms: f64,
    pub disk_percent: f64,
}

impl Default for CriticalLevels {
    fn default() -> Self {
        Self {
            cpu_percent: 95.0,
            memory_percent: 95.0,
            network_latency_ms: 2_000.0,
            disk_percent: 90.0,
        }
    }
}

/// Fixed weights of the composite stress score.
const CPU_WEIGHT: f64 = 0.35;
const MEMORY_WEIGHT: f64 = 0.35;
const NETWORK_WEIGHT: f64 = 0.20;
const DISK_WEIGHT: f64 = 0.10;

/// Composite stress score in `[0, 1]`.
///
/// Each dimension is normalized against its critical level and capped at
/// 1.0, then weighted: cpu 0.35, memory 0.35, network 0.20, disk 0.10.
pub fn stress_level(sample: &StressSample, critical: &CriticalLevels) -> f64 {
    let norm = |value: f64, limit: f64| {
        if limit <= 0.0 {
            1.0
        } else {
            (value / limit).clamp(0.0, 1.0)
        }
    };
    CPU_WEIGHT * norm(sample.cpu_percent, critical.cpu_percent)
        + MEMORY_WEIGHT * norm(sample.memory_percent, critical.memory_percent)
        + NETWORK_WEIGHT * norm(sample.network_latency_ms, critical.network_latency_ms)
        + DISK_WEIGHT * norm(sample.disk_percent, critical.disk_percent)
}

/// Whether any single dimension has reached its critical level.
///
/// Used as an emergency override: one saturated dimension is an emergency
/// even when the weighted composite is still mid-band.
pub fn exceeds_critical(sample: &StressSample, critical: &CriticalLevels) -> bool {
    sample.cpu_percent >= critical.cpu_percent
        || sample.memory_percent >= critical.memory_percent
        || sample.network_latency_ms >= critical.network_latency_ms
        || sample.disk_percent >= critical.disk_percent
}

impl StressSample {
    /// Degraded copy: latency pinned at the critical level, everything else
    /// kept from this (last known) sample.
    #[must_use]
    pub fn degraded(&self, critical: &CriticalLevels) -> Self {
        Self { network_latency_ms: critical.network_latency_ms, ..*self }
    }

    /// Starting point before the first successful sample: idle host.
    pub fn idle(taken_at_ms: u64) -> Self {
        Self {
            taken_at_ms,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            network_latency_ms: 0.0,
            disk_percent: 0.0,
        }
    }
}
