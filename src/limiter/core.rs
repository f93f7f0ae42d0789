//! The window state machine behind every resource.
//!
//! Semantics:
//! - A window opens on the first consume (or the first after expiry) and
//!   captures the budget, length, and spacing from the config at that
//!   moment. `replace_config` therefore applies from the next window; the
//!   open window is never retroactively altered.
//! - With `even_spread`, grants are additionally spaced at least
//!   `duration / points` apart, so throughput stays near `points/duration`
//!   instead of bursting at window start.
//! - Exhausting the budget with `block_duration` set arms a lockout that
//!   outlives the window.
//!
//! `consume` never fails for a configured resource; denial is a value, not
//! an error, so callers can decide whether to wait, retry, or surface it.

use crate::clock::Clock;
use crate::config::LiveConfig;
use crate::limiter::{Admission, LimiterConfig};
use crate::resource::ResourceKind;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct WindowState {
    /// Points left in the open window. Meaningless when `ends_at` is None.
    remaining: u64,
    /// When the open window expires, if one is open.
    ends_at: Option<u64>,
    /// Minimum inter-grant spacing captured at window open (0 = burst ok).
    spacing_ms: u64,
    /// Earliest time the next grant may happen under even spread.
    next_grant_at: u64,
    /// Lifetime granted consumes.
    total_hits: u64,
    /// Penalty lockout end, if armed.
    blocked_until: Option<u64>,
}

/// Read-only view of one resource's limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterSnapshot {
    pub resource: ResourceKind,
    pub remaining: u64,
    /// Milliseconds until the window resets (or the lockout ends).
    pub ms_before_next: u64,
    pub total_hits: u64,
    pub is_blocked: bool,
}

/// Per-resource point limiter.
pub struct PointLimiter {
    resource: ResourceKind,
    config: LiveConfig<LimiterConfig>,
    state: Mutex<WindowState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PointLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointLimiter")
            .field("resource", &self.resource)
            .field("config", &self.config.get())
            .finish()
    }
}

impl PointLimiter {
    pub fn new(resource: ResourceKind, config: LimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            resource,
            config: LiveConfig::new(config),
            state: Mutex::new(WindowState::default()),
            clock,
        }
    }

    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    /// Snapshot the active config.
    pub fn config(&self) -> Arc<LimiterConfig> {
        self.config.get()
    }

    /// Try to consume `points` from the current window.
    pub fn consume(&self, points: u64) -> Admission {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(until) = state.blocked_until {
            if now < until {
                return Admission::Denied {
                    remaining: state.remaining,
                    retry_after: Duration::from_millis(until - now),
                };
            }
            state.blocked_until = None;
        }

        let cfg = self.config.get();
        let window_expired = match state.ends_at {
            Some(ends_at) => now >= ends_at,
            None => true,
        };
        if window_expired {
            let duration_ms = cfg.duration().as_millis() as u64;
            state.remaining = cfg.points();
            state.ends_at = Some(now + duration_ms);
            state.spacing_ms =
                if cfg.even_spread() { (duration_ms / cfg.points()).max(1) } else { 0 };
            state.next_grant_at = now;
        }

        if state.spacing_ms > 0 && now < state.next_grant_at {
            return Admission::Denied {
                remaining: state.remaining,
                retry_after: Duration::from_millis(state.next_grant_at - now),
            };
        }

        if state.remaining >= points {
            state.remaining -= points;
            state.total_hits += 1;
            if state.spacing_ms > 0 {
                state.next_grant_at = now + state.spacing_ms * points;
            }
            return Admission::Granted { remaining: state.remaining };
        }

        // Budget exhausted. Arm the lockout if the config carries one.
        let window_end = state.ends_at.unwrap_or(now);
        let retry_at = match cfg.block_duration() {
            Some(block) => {
                let until = now + block.as_millis() as u64;
                state.blocked_until = Some(until);
                tracing::warn!(
                    resource = %self.resource,
                    block_ms = block.as_millis() as u64,
                    "budget exhausted, lockout armed"
                );
                until
            }
            None => window_end,
        };
        Admission::Denied {
            remaining: state.remaining,
            retry_after: Duration::from_millis(retry_at.saturating_sub(now)),
        }
    }

    /// Read-only inspection; never denies, never opens a window.
    pub fn inspect(&self) -> LimiterSnapshot {
        let now = self.clock.now_millis();
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let cfg = self.config.get();

        let is_blocked = state.blocked_until.is_some_and(|until| now < until);
        let window_open = state.ends_at.is_some_and(|ends_at| now < ends_at);
        let remaining = if window_open { state.remaining } else { cfg.points() };
        let ms_before_next = if is_blocked {
            state.blocked_until.map(|until| until - now).unwrap_or(0)
        } else if window_open {
            state.ends_at.map(|ends_at| ends_at - now).unwrap_or(0)
        } else {
            0
        };
        LimiterSnapshot {
            resource: self.resource,
            remaining,
            ms_before_next,
            total_hits: state.total_hits,
            is_blocked,
        }
    }

    /// Clear window and lockout state immediately. Lifetime hits survive.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let hits = state.total_hits;
        *state = WindowState { total_hits: hits, ..WindowState::default() };
    }

    /// Atomically swap the active config. Applies from the next window.
    pub fn replace_config(&self, config: LimiterConfig) {
        self.config.set(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(cfg: LimiterConfig) -> (PointLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter =
            PointLimiter::new(ResourceKind::ExchangeOrders, cfg, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn grants_until_budget_exhausted_then_denies() {
        let cfg = LimiterConfig::new(80, Duration::from_secs(60)).unwrap();
        let (limiter, clock) = limiter(cfg);

        for _ in 0..80 {
            assert!(limiter.consume(1).is_granted());
        }
        let denied = limiter.consume(1);
        assert!(!denied.is_granted());
        let wait = denied.retry_after().unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(60));

        // Past the window the budget is fresh again.
        clock.advance(60_001);
        assert!(limiter.consume(1).is_granted());
    }

    #[test]
    fn window_reset_restores_full_budget() {
        let cfg = LimiterConfig::new(3, Duration::from_secs(10)).unwrap();
        let (limiter, clock) = limiter(cfg);

        assert!(limiter.consume(3).is_granted());
        assert!(!limiter.consume(1).is_granted());
        clock.advance(10_000);
        assert_eq!(limiter.consume(1), Admission::Granted { remaining: 2 });
    }

    #[test]
    fn block_duration_outlives_window() {
        let cfg = LimiterConfig::new(2, Duration::from_secs(10))
            .unwrap()
            .with_block_duration(Duration::from_secs(30));
        let (limiter, clock) = limiter(cfg);

        assert!(limiter.consume(2).is_granted());
        let denied = limiter.consume(1);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(30)));

        // Window expiry alone is not enough while the lockout holds.
        clock.advance(15_000);
        assert!(!limiter.consume(1).is_granted());
        assert!(limiter.inspect().is_blocked);

        clock.advance(15_000);
        assert!(limiter.consume(1).is_granted());
    }

    #[test]
    fn even_spread_spaces_grants() {
        // 10 points over 10s: one grant per second.
        let cfg = LimiterConfig::new(10, Duration::from_secs(10)).unwrap().with_even_spread();
        let (limiter, clock) = limiter(cfg);

        assert!(limiter.consume(1).is_granted());
        let denied = limiter.consume(1);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(1)));

        clock.advance(1_000);
        assert!(limiter.consume(1).is_granted());
    }

    #[test]
    fn config_swap_applies_from_next_window() {
        let cfg = LimiterConfig::new(5, Duration::from_secs(10)).unwrap();
        let (limiter, clock) = limiter(cfg);

        assert!(limiter.consume(1).is_granted()); // opens window with 5
        limiter.replace_config(LimiterConfig::new(1, Duration::from_secs(10)).unwrap());

        // Open window keeps the budget it started with.
        assert!(limiter.consume(4).is_granted());
        assert!(!limiter.consume(1).is_granted());

        clock.advance(10_000);
        assert!(limiter.consume(1).is_granted());
        assert!(!limiter.consume(1).is_granted()); // new budget of 1 applies
    }

    #[test]
    fn inspect_does_not_open_a_window() {
        let cfg = LimiterConfig::new(5, Duration::from_secs(10)).unwrap();
        let (limiter, _clock) = limiter(cfg);

        let snap = limiter.inspect();
        assert_eq!(snap.remaining, 5);
        assert_eq!(snap.ms_before_next, 0);
        assert_eq!(snap.total_hits, 0);
        assert!(!snap.is_blocked);
    }

    #[test]
    fn reset_clears_state_but_keeps_hits() {
        let cfg = LimiterConfig::new(2, Duration::from_secs(10)).unwrap();
        let (limiter, _clock) = limiter(cfg);

        assert!(limiter.consume(2).is_granted());
        assert!(!limiter.consume(1).is_granted());
        limiter.reset();
        let snap = limiter.inspect();
        assert_eq!(snap.total_hits, 1);
        assert!(limiter.consume(1).is_granted());
    }

    #[test]
    fn multi_point_consume_counts_against_budget() {
        let cfg = LimiterConfig::new(10, Duration::from_secs(10)).unwrap();
        let (limiter, _clock) = limiter(cfg);

        assert_eq!(limiter.consume(7), Admission::Granted { remaining: 3 });
        assert!(!limiter.consume(4).is_granted());
        assert!(limiter.consume(3).is_granted());
    }
}
