//! Point/window rate limiting primitives.
//!
//! This module provides the admission-control building blocks:
//! - [`LimiterConfig`]: the per-resource point budget and window shape.
//! - [`core::PointLimiter`]: the deterministic window state machine.
//! - [`queued::QueuedLimiter`]: bounded, timeout-aware waiting on top of it.
//! - [`Admission`]: the result of a consume (granted/denied).
//!
//! # Architecture
//!
//! The core limiter only does the math: open a window, decrement points,
//! deny with a wait hint when the budget is gone. The queued wrapper turns
//! "denied, wait 800ms" into an actual bounded wait, with a concurrency cap
//! so in-flight work stays within the resource's tolerance. The adaptive
//! controller swaps reduced configs in via [`crate::config::LiveConfig`];
//! an open window keeps the budget it was opened with.

use crate::error::ConfigError;
use serde::Serialize;
use std::time::Duration;

pub mod core;
pub mod queued;

pub use self::core::{LimiterSnapshot, PointLimiter};
pub use self::queued::{AdmissionPermit, QueuePolicy, QueuedLimiter};

/// Point budget and window shape for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterConfig {
    /// Budget per window.
    points: u64,
    /// Window length.
    duration: Duration,
    /// Extra penalty lockout armed when the budget is exhausted.
    block_duration: Option<Duration>,
    /// Smooth consumption across the window instead of allowing a full
    /// burst at window start. Enforced as a minimum inter-grant spacing of
    /// `duration / points`.
    even_spread: bool,
}

impl LimiterConfig {
    /// Create a config. `points` and `duration` must both be nonzero.
    pub fn new(points: u64, duration: Duration) -> Result<Self, ConfigError> {
        if points == 0 {
            return Err(ConfigError::ZeroPoints);
        }
        if duration < Duration::from_secs(1) {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(Self { points, duration, block_duration: None, even_spread: false })
    }

    /// Arm a penalty lockout that starts when the budget is exhausted.
    #[must_use]
    pub fn with_block_duration(mut self, block: Duration) -> Self {
        self.block_duration = Some(block);
        self
    }

    /// Enable even-spread smoothing.
    #[must_use]
    pub fn with_even_spread(mut self) -> Self {
        self.even_spread = true;
        self
    }

    pub fn points(&self) -> u64 {
        self.points
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn block_duration(&self) -> Option<Duration> {
        self.block_duration
    }

    pub fn even_spread(&self) -> bool {
        self.even_spread
    }

    /// Copy of this config with a different point budget. Used by the
    /// adaptive controller; the window shape is preserved.
    #[must_use]
    pub fn with_points(&self, points: u64) -> Self {
        Self { points: points.max(1), ..self.clone() }
    }
}

/// The decision returned by a consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The points were consumed; the caller may proceed.
    Granted {
        /// Points remaining in the current window after this grant.
        remaining: u64,
    },
    /// The consume was denied.
    Denied {
        /// Points remaining (0 when the budget is exhausted).
        remaining: u64,
        /// How long the caller should wait before trying again.
        retry_after: Duration,
    },
}

impl Admission {
    /// Helper to check if granted.
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }

    /// The wait hint, if denied.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Denied { retry_after, .. } => Some(*retry_after),
            Admission::Granted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_zero_points() {
        assert_eq!(
            LimiterConfig::new(0, Duration::from_secs(60)).unwrap_err(),
            ConfigError::ZeroPoints
        );
    }

    #[test]
    fn config_rejects_subsecond_duration() {
        assert_eq!(
            LimiterConfig::new(10, Duration::from_millis(500)).unwrap_err(),
            ConfigError::ZeroDuration
        );
    }

    #[test]
    fn with_points_floors_at_one() {
        let cfg = LimiterConfig::new(10, Duration::from_secs(60)).unwrap();
        assert_eq!(cfg.with_points(0).points(), 1);
        assert_eq!(cfg.with_points(7).points(), 7);
    }
}
