//! Error types for admission control.
//!
//! Semantics:
//! - `RateLimited`, `QueueTimeout`, and `QueueFull` are recoverable: the
//!   schedulers may retry or fall back when configured, otherwise they
//!   propagate to the caller as a typed failure.
//! - `UnknownResource` and `NotInitialized` are configuration errors and
//!   propagate immediately without retry.
//! - `WorkTimeout`/`WorkFailed` classify the caller-supplied unit of work;
//!   they may trigger a one-shot fallback substitution but never a crash.

use crate::resource::ResourceKind;
use std::time::Duration;

/// Unified error type for all admission decisions and scheduled work.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AdmissionError {
    /// The resource's point budget is exhausted for the current window.
    #[error("{resource} rate limited, retry after {retry_after:?}")]
    RateLimited {
        resource: ResourceKind,
        /// Time until the window resets or the block lockout ends.
        retry_after: Duration,
    },

    /// The caller waited on the queued limiter past its timeout.
    #[error("{0} queue wait timed out")]
    QueueTimeout(ResourceKind),

    /// The queued limiter's waiting room is full.
    #[error("{0} queue is full")]
    QueueFull(ResourceKind),

    /// The resource has no configured limiter. Configuration error.
    #[error("{0} has no configured limiter")]
    UnknownResource(ResourceKind),

    /// The submitted unit of work exceeded its execution timeout.
    #[error("work timed out after {elapsed:?} (limit: {limit:?})")]
    WorkTimeout { elapsed: Duration, limit: Duration },

    /// The submitted unit of work failed.
    #[error("work failed: {0}")]
    WorkFailed(String),

    /// The request was cancelled before it started (queue clear or shutdown).
    #[error("request cancelled before execution")]
    Cancelled,

    /// The coordinator has not been started yet.
    #[error("admission controller not initialized")]
    NotInitialized,
}

impl AdmissionError {
    /// Whether scheduler retry/fallback logic may act on this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::QueueTimeout(_) | Self::QueueFull(_)
        )
    }

    /// Check if this error is a rate-limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Time to wait before retrying, if this is a rate-limit denial.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// The resource this error concerns, when one is attached.
    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            Self::RateLimited { resource, .. } => Some(*resource),
            Self::QueueTimeout(r) | Self::QueueFull(r) | Self::UnknownResource(r) => Some(*r),
            _ => None,
        }
    }
}

/// Errors produced while validating configuration input.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("points must be at least 1")]
    ZeroPoints,
    #[error("window duration must be at least 1 second")]
    ZeroDuration,
    #[error("max_concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("reduction factors must satisfy 0 < min <= max <= 1, got {min}..{max}")]
    InvalidReductionRange { min: f64, max: f64 },
    #[error("recovery rate must be in (0, 1], got {0}")]
    InvalidRecoveryRate(f64),
    #[error("unknown adaptation profile: {0}")]
    UnknownProfile(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        let limited = AdmissionError::RateLimited {
            resource: ResourceKind::ExchangeOrders,
            retry_after: Duration::from_secs(3),
        };
        assert!(limited.is_recoverable());
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(limited.resource(), Some(ResourceKind::ExchangeOrders));

        assert!(AdmissionError::QueueTimeout(ResourceKind::ModelA).is_recoverable());
        assert!(AdmissionError::QueueFull(ResourceKind::ModelA).is_recoverable());
        assert!(!AdmissionError::UnknownResource(ResourceKind::ModelA).is_recoverable());
        assert!(!AdmissionError::NotInitialized.is_recoverable());
        assert!(!AdmissionError::WorkFailed("boom".into()).is_recoverable());
    }

    #[test]
    fn config_errors_compare_by_value() {
        let a = ConfigError::InvalidReductionRange { min: 0.2, max: 1.5 };
        let b = ConfigError::InvalidReductionRange { min: 0.2, max: 1.5 };
        assert_eq!(a, b);
        assert_ne!(a, ConfigError::InvalidRecoveryRate(1.5));
        assert!(format!("{a}").contains("0.2..1.5"));
    }

    #[test]
    fn display_includes_resource_label() {
        let err = AdmissionError::QueueFull(ResourceKind::ChannelBot);
        assert!(format!("{err}").contains("channel-bot"));
    }
}
