//! The adaptation and recovery ticks.
//!
//! State machine per resource is implicitly `{baseline, adapted}`:
//! - The sampling tick (default 30s) reads one stress sample, re-selects
//!   the active profile by stress band, and shrinks the budget of every
//!   resource whose per-resource thresholds are exceeded and whose own
//!   cooldown has passed. Adaptation only ever tightens; loosening is
//!   recovery's job, which keeps recovery monotonic.
//! - The recovery tick (default 60s) runs only while the composite stress
//!   level is at or below 0.5 and steps each adapted factor linearly toward
//!   1.0 by the active profile's recovery rate; at >= 0.99 the resource is
//!   restored to baseline and leaves the adapted set.
//!
//! Both ticks lock the same controller state, so no two ticks race to swap
//! the same config. An in-flight consume that already snapshotted the old
//! config completes against it; the swap affects subsequent consumes.
//!
//! Adapted budgets never drop below 1 point.

use crate::adaptive::profile::{select_profile, ProfileKind};
use crate::clock::Clock;
use crate::limiter::QueuedLimiter;
use crate::resource::{ResourceBaseline, ResourceKind};
use crate::stress::{stress_level, CriticalLevels, MetricsSampler, SamplerHealth, StressSample};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Tick intervals and bounds for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub sample_interval: Duration,
    pub recovery_interval: Duration,
    /// Minimum spacing between applied adaptations, per resource.
    pub adaptation_cooldown: Duration,
    pub critical: CriticalLevels,
    /// Ring-buffer capacity of the adaptation history.
    pub history_cap: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(60),
            adaptation_cooldown: Duration::from_secs(30),
            critical: CriticalLevels::default(),
            history_cap: 1_000,
        }
    }
}

/// One applied adaptation, read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptationRecord {
    pub at_ms: u64,
    pub resource: ResourceKind,
    pub original_points: u64,
    pub adapted_points: u64,
    pub factor: f64,
    pub reason: String,
    pub strategy: ProfileKind,
}

/// Reportable controller state.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub active_profile: ProfileKind,
    pub stress_level: f64,
    pub sampler_health: SamplerHealth,
    /// Resources currently running below baseline, with their factor.
    pub adapted: HashMap<ResourceKind, f64>,
}

struct ControllerState {
    active_profile: ProfileKind,
    last_sample: StressSample,
    sampler_health: SamplerHealth,
    /// Last applied adaptation per resource; gates the cooldown.
    last_adaptation_at: HashMap<ResourceKind, u64>,
    /// Current budget multiplier per adapted resource (< 1.0).
    factors: HashMap<ResourceKind, f64>,
    history: VecDeque<AdaptationRecord>,
}

/// Periodically recomputes and swaps each resource's effective budget.
pub struct AdaptiveController {
    settings: ControllerSettings,
    sampler: Arc<dyn MetricsSampler>,
    limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
    baselines: HashMap<ResourceKind, ResourceBaseline>,
    clock: Arc<dyn Clock>,
    state: Mutex<ControllerState>,
}

impl AdaptiveController {
    pub fn new(
        settings: ControllerSettings,
        sampler: Arc<dyn MetricsSampler>,
        limiters: HashMap<ResourceKind, Arc<QueuedLimiter>>,
        baselines: HashMap<ResourceKind, ResourceBaseline>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = ControllerState {
            active_profile: ProfileKind::Balanced,
            last_sample: StressSample::idle(clock.now_millis()),
            sampler_health: SamplerHealth::Degraded,
            last_adaptation_at: HashMap::new(),
            factors: HashMap::new(),
            history: VecDeque::new(),
        };
        Self { settings, sampler, limiters, baselines, clock, state: Mutex::new(state) }
    }

    /// Manually pin the active profile. Honored on the next tick; the next
    /// stress-band selection may change it again.
    pub fn set_profile(&self, kind: ProfileKind) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.active_profile != kind {
            tracing::info!(from = %state.active_profile, to = %kind, "profile set manually");
            state.active_profile = kind;
        }
    }

    /// Most recent adaptation records, newest last.
    pub fn history(&self, limit: Option<usize>) -> Vec<AdaptationRecord> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let take = limit.unwrap_or(state.history.len()).min(state.history.len());
        state.history.iter().skip(state.history.len() - take).cloned().collect()
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        ControllerStatus {
            active_profile: state.active_profile,
            stress_level: stress_level(&state.last_sample, &self.settings.critical),
            sampler_health: state.sampler_health,
            adapted: state.factors.clone(),
        }
    }

    /// Forget all adaptation state and restore every baseline budget.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for (kind, baseline) in &self.baselines {
            if let Some(limiter) = self.limiters.get(kind) {
                limiter.limiter().replace_config(baseline.limiter.clone());
            }
        }
        state.factors.clear();
        state.last_adaptation_at.clear();
    }

    /// One sampling tick: read metrics, re-select the profile, adapt.
    ///
    /// A sampler failure degrades to "assume high latency" on the last
    /// known sample instead of stopping the tick loop.
    pub async fn run_sample_tick(&self) {
        let sampled = self.sampler.sample().await;
        let now = self.clock.now_millis();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        match sampled {
            Ok(mut sample) => {
                sample.taken_at_ms = now;
                state.last_sample = sample;
                state.sampler_health = SamplerHealth::Fresh;
            }
            Err(err) => {
                tracing::warn!(error = %err, "metrics sampler failed, assuming high latency");
                state.last_sample = state.last_sample.degraded(&self.settings.critical);
                state.last_sample.taken_at_ms = now;
                state.sampler_health = SamplerHealth::Degraded;
            }
        }

        let selected = select_profile(&state.last_sample, &self.settings.critical);
        if selected != state.active_profile {
            tracing::info!(
                from = %state.active_profile,
                to = %selected,
                stress = stress_level(&state.last_sample, &self.settings.critical),
                "adaptation profile switched"
            );
            state.active_profile = selected;
        }

        self.adapt_resources(&mut state, now);
    }

    fn adapt_resources(&self, state: &mut ControllerState, now: u64) {
        let profile = state.active_profile.profile();
        let sample = state.last_sample;
        let cooldown_ms = self.settings.adaptation_cooldown.as_millis() as u64;

        for (kind, baseline) in &self.baselines {
            let th = &baseline.thresholds;
            let should_adapt = sample.cpu_percent > th.cpu_percent
                || sample.memory_percent > th.memory_percent
                || sample.network_latency_ms > th.network_latency_ms;
            if !should_adapt {
                continue;
            }
            // Each resource cools down on its own; an adaptation applied to
            // one never delays another crossing its thresholds later.
            if state
                .last_adaptation_at
                .get(kind)
                .is_some_and(|at| now.saturating_sub(*at) < cooldown_ms)
            {
                continue;
            }
            let Some(limiter) = self.limiters.get(kind) else { continue };

            let computed = profile.multiplier(&sample, &baseline.weights, &self.settings.critical);
            let current = state.factors.get(kind).copied().unwrap_or(1.0);
            // Tighten only; recovery loosens.
            let factor = computed.min(current);
            if factor >= current {
                continue;
            }

            let original = baseline.limiter.points();
            let adapted = ((original as f64 * factor).floor() as u64).max(1);
            limiter.limiter().replace_config(baseline.limiter.with_points(adapted));
            state.factors.insert(*kind, factor);
            state.last_adaptation_at.insert(*kind, now);

            let reason = format!(
                "cpu {:.1}% mem {:.1}% net {:.0}ms over thresholds",
                sample.cpu_percent, sample.memory_percent, sample.network_latency_ms
            );
            tracing::info!(
                resource = %kind,
                original,
                adapted,
                factor,
                strategy = %state.active_profile,
                "budget adapted"
            );
            push_record(
                &mut state.history,
                self.settings.history_cap,
                AdaptationRecord {
                    at_ms: now,
                    resource: *kind,
                    original_points: original,
                    adapted_points: adapted,
                    factor,
                    reason,
                    strategy: state.active_profile,
                },
            );
        }
    }

    /// One recovery tick: only acts while stress is at or below 0.5.
    pub fn run_recovery_tick(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let level = stress_level(&state.last_sample, &self.settings.critical);
        if level > 0.5 {
            return;
        }
        let rate = state.active_profile.profile().recovery_rate_per_tick;
        let mut restored = Vec::new();

        for (kind, factor) in state.factors.iter_mut() {
            let Some(baseline) = self.baselines.get(kind) else { continue };
            let Some(limiter) = self.limiters.get(kind) else { continue };

            *factor = (*factor + rate).min(1.0);
            if *factor >= 0.99 {
                limiter.limiter().replace_config(baseline.limiter.clone());
                restored.push(*kind);
                tracing::info!(resource = %kind, "budget restored to baseline");
            } else {
                let adapted =
                    ((baseline.limiter.points() as f64 * *factor).floor() as u64).max(1);
                limiter.limiter().replace_config(baseline.limiter.with_points(adapted));
                tracing::debug!(resource = %kind, factor = *factor, adapted, "budget recovering");
            }
        }
        for kind in restored {
            state.factors.remove(&kind);
        }
    }

    /// Spawn the sampling and recovery loops. Both stop when `shutdown`
    /// flips to true.
    pub fn spawn(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let controller = Arc::clone(self);
        let mut sample_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(controller.settings.sample_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => controller.run_sample_tick().await,
                    changed = sample_shutdown.changed() => {
                        if changed.is_err() || *sample_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let controller = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(controller.settings.recovery_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => controller.run_recovery_tick(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        handles
    }
}

fn push_record(
    history: &mut VecDeque<AdaptationRecord>,
    cap: usize,
    record: AdaptationRecord,
) {
    if history.len() == cap {
        history.pop_front();
    }
    history.push_back(record);
}
