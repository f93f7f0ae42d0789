//! Rolling log of limiter denials and the statistics derived from it.
//!
//! Every denial surfaced to a caller lands here with a snapshot of the
//! system load the controller saw most recently. The buffer is bounded;
//! lifetime counters survive eviction.

use crate::clock::Clock;
use crate::resource::ResourceKind;
use crate::stress::StressSample;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

const HOUR_MS: u64 = 60 * 60 * 1_000;

/// One denied request, read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationRecord {
    pub at_ms: u64,
    pub resource: ResourceKind,
    /// Points left in the window when the denial happened.
    pub remaining: u64,
    /// The wait the limiter advertised.
    pub ms_before_next: u64,
    /// System load at denial time, when the controller had a sample.
    pub load: Option<StressSample>,
}

/// Counts by resource, derived on demand.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationStats {
    pub total: u64,
    pub lifetime: HashMap<ResourceKind, u64>,
    /// Denials within the trailing hour, bounded by buffer capacity.
    pub last_hour: HashMap<ResourceKind, u64>,
}

struct TrackerState {
    records: VecDeque<ViolationRecord>,
    lifetime: HashMap<ResourceKind, u64>,
    total: u64,
    last_load: Option<StressSample>,
}

/// Bounded denial log (default cap 1000).
pub struct ViolationTracker {
    clock: Arc<dyn Clock>,
    cap: usize,
    state: Mutex<TrackerState>,
}

impl ViolationTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, 1_000)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, cap: usize) -> Self {
        let state = TrackerState {
            records: VecDeque::new(),
            lifetime: HashMap::new(),
            total: 0,
            last_load: None,
        };
        Self { clock, cap, state: Mutex::new(state) }
    }

    /// Refresh the load snapshot attached to subsequent records.
    pub fn note_load(&self, sample: StressSample) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.last_load = Some(sample);
    }

    /// Append one denial.
    pub fn record_denial(&self, resource: ResourceKind, remaining: u64, ms_before_next: u64) {
        let at_ms = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let load = state.last_load;
        if state.records.len() == self.cap {
            state.records.pop_front();
        }
        state.records.push_back(ViolationRecord {
            at_ms,
            resource,
            remaining,
            ms_before_next,
            load,
        });
        *state.lifetime.entry(resource).or_insert(0) += 1;
        state.total += 1;
    }

    /// Most recent records, newest last.
    pub fn recent(&self, limit: usize) -> Vec<ViolationRecord> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let take = limit.min(state.records.len());
        state.records.iter().skip(state.records.len() - take).cloned().collect()
    }

    pub fn stats(&self) -> ViolationStats {
        let now = self.clock.now_millis();
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut last_hour: HashMap<ResourceKind, u64> = HashMap::new();
        for record in state.records.iter().rev() {
            if now.saturating_sub(record.at_ms) > HOUR_MS {
                break;
            }
            *last_hour.entry(record.resource).or_insert(0) += 1;
        }
        ViolationStats { total: state.total, lifetime: state.lifetime.clone(), last_hour }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn records_and_counts() {
        let clock = ManualClock::new();
        let tracker = ViolationTracker::new(Arc::new(clock.clone()));

        tracker.record_denial(ResourceKind::ExchangeOrders, 0, 1_200);
        clock.advance(500);
        tracker.record_denial(ResourceKind::ModelA, 0, 5_000);

        let stats = tracker.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.lifetime[&ResourceKind::ExchangeOrders], 1);
        assert_eq!(stats.last_hour.len(), 2);

        let recent = tracker.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].resource, ResourceKind::ModelA);
    }

    #[test]
    fn old_records_leave_the_hour_window() {
        let clock = ManualClock::new();
        let tracker = ViolationTracker::new(Arc::new(clock.clone()));

        tracker.record_denial(ResourceKind::NewsApi, 0, 100);
        clock.advance(HOUR_MS + 1);
        tracker.record_denial(ResourceKind::NewsApi, 0, 100);

        let stats = tracker.stats();
        assert_eq!(stats.lifetime[&ResourceKind::NewsApi], 2);
        assert_eq!(stats.last_hour[&ResourceKind::NewsApi], 1);
    }

    #[test]
    fn buffer_is_bounded_but_lifetime_survives() {
        let clock = ManualClock::new();
        let tracker = ViolationTracker::with_capacity(Arc::new(clock.clone()), 10);

        for _ in 0..25 {
            tracker.record_denial(ResourceKind::DbQueries, 0, 10);
        }
        let stats = tracker.stats();
        assert_eq!(stats.total, 25);
        assert_eq!(stats.lifetime[&ResourceKind::DbQueries], 25);
        assert_eq!(tracker.recent(100).len(), 10);
    }

    #[test]
    fn load_snapshot_attaches_to_records() {
        let clock = ManualClock::new();
        let tracker = ViolationTracker::new(Arc::new(clock.clone()));

        tracker.record_denial(ResourceKind::ModelB, 0, 100);
        tracker.note_load(StressSample::idle(0));
        tracker.record_denial(ResourceKind::ModelB, 0, 100);

        let recent = tracker.recent(2);
        assert!(recent[0].load.is_none());
        assert!(recent[1].load.is_some());
    }
}
