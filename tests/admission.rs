//! End-to-end admission flows through the public API.

use floodgate::{
    AdmissionError, LimiterConfig, ManualClock, PointLimiter, QueuePolicy, QueuedLimiter,
    ResourceKind,
};
use std::sync::Arc;
use std::time::Duration;

fn queued(cfg: LimiterConfig, policy: QueuePolicy, clock: &ManualClock) -> Arc<QueuedLimiter> {
    let limiter = PointLimiter::new(ResourceKind::ExchangeOrders, cfg, Arc::new(clock.clone()));
    Arc::new(QueuedLimiter::new(limiter, policy))
}

#[tokio::test]
async fn multi_point_consumes_share_one_budget() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(10, Duration::from_secs(60)).unwrap();
    let policy = QueuePolicy::new(4, 10, Duration::from_secs(1)).unwrap();
    let q = queued(cfg, policy, &clock);

    let a = q.try_consume(6).unwrap();
    assert_eq!(a.remaining(), 4);
    let b = q.try_consume(4).unwrap();
    assert_eq!(b.remaining(), 0);

    let err = q.try_consume(1).unwrap_err();
    assert!(err.is_rate_limited());
    drop((a, b));

    clock.advance(60_000);
    assert!(q.try_consume(10).is_ok());
}

#[tokio::test]
async fn concurrency_cap_holds_until_permits_drop() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(100, Duration::from_secs(60)).unwrap();
    let policy = QueuePolicy::new(2, 5, Duration::from_secs(1)).unwrap();
    let q = queued(cfg, policy, &clock);

    let first = q.try_consume(1).unwrap();
    let second = q.try_consume(1).unwrap();
    // Both slots held: fail-fast callers bounce even with budget left.
    assert_eq!(
        q.try_consume(1).unwrap_err(),
        AdmissionError::QueueFull(ResourceKind::ExchangeOrders)
    );

    drop(first);
    let third = q.try_consume(1).unwrap();
    drop((second, third));
}

#[tokio::test(start_paused = true)]
async fn queue_wait_is_bounded_by_policy_timeout() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(1, Duration::from_secs(60)).unwrap();
    let policy = QueuePolicy::new(4, 5, Duration::from_millis(500)).unwrap();
    let q = queued(cfg, policy, &clock);

    let held = q.consume(1).await.unwrap();
    // Budget gone for the rest of the window; the wait hits the deadline.
    let err = q.consume(1).await.unwrap_err();
    assert_eq!(err, AdmissionError::QueueTimeout(ResourceKind::ExchangeOrders));
    drop(held);
}

#[tokio::test]
async fn replaced_config_applies_from_next_window() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(5, Duration::from_secs(60)).unwrap();
    let policy = QueuePolicy::new(4, 10, Duration::from_secs(1)).unwrap();
    let q = queued(cfg.clone(), policy, &clock);

    // Open the window at 5 points, then shrink the config to 2.
    let permit = q.try_consume(1).unwrap();
    q.limiter().replace_config(cfg.with_points(2));
    drop(permit);

    // The open window still honors its captured budget.
    for _ in 0..4 {
        drop(q.try_consume(1).unwrap());
    }
    assert!(q.try_consume(1).is_err());

    // The next window opens at the reduced budget.
    clock.advance(60_000);
    drop(q.try_consume(1).unwrap());
    drop(q.try_consume(1).unwrap());
    assert!(q.try_consume(1).is_err());
}

#[tokio::test]
async fn even_spread_smooths_a_burst() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(10, Duration::from_secs(10)).unwrap().with_even_spread();
    let policy = QueuePolicy::new(4, 10, Duration::from_secs(1)).unwrap();
    let q = queued(cfg, policy, &clock);

    drop(q.try_consume(1).unwrap());
    // A second grant inside the 1s spacing is denied with the residual wait.
    let err = q.try_consume(1).unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

    clock.advance(1_000);
    drop(q.try_consume(1).unwrap());
}

#[tokio::test]
async fn inspect_reports_lockout_without_consuming() {
    let clock = ManualClock::new();
    let cfg = LimiterConfig::new(2, Duration::from_secs(10))
        .unwrap()
        .with_block_duration(Duration::from_secs(30));
    let policy = QueuePolicy::new(4, 10, Duration::from_secs(1)).unwrap();
    let q = queued(cfg, policy, &clock);

    drop(q.try_consume(2).unwrap());
    assert!(q.try_consume(1).is_err());

    let snapshot = q.limiter().inspect();
    assert!(snapshot.is_blocked);
    assert_eq!(snapshot.ms_before_next, 30_000);
    assert_eq!(snapshot.total_hits, 1);

    // Window expiry does not clear the lockout.
    clock.advance(10_001);
    assert!(q.try_consume(1).is_err());
    clock.advance(20_000);
    assert!(q.try_consume(1).is_ok());
}
