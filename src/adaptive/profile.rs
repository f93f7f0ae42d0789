//! Adaptation profiles: how aggressively budgets react to stress.
//!
//! Four built-ins ship with the crate. "Aggressive" here means aggressive
//! about keeping throughput (light reductions); "conservative" protects the
//! host (heavy reductions); "emergency" is the clamp-down used when any
//! dimension saturates.

use crate::error::ConfigError;
use crate::resource::StressWeights;
use crate::stress::{exceeds_critical, stress_level, CriticalLevels, StressSample};
use serde::Serialize;

/// The built-in profile set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Conservative,
    Balanced,
    Aggressive,
    Emergency,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
            Self::Emergency => "emergency",
        }
    }

    /// Parse an operator-supplied profile name.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            "emergency" => Ok(Self::Emergency),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }

    pub fn profile(&self) -> &'static AdaptiveProfile {
        match self {
            Self::Conservative => &CONSERVATIVE,
            Self::Balanced => &BALANCED,
            Self::Aggressive => &AGGRESSIVE,
            Self::Emergency => &EMERGENCY,
        }
    }
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitivity factors and recovery pacing for one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptiveProfile {
    pub name: &'static str,
    /// Per-dimension impact: how much of each (normalized, weighted) stress
    /// dimension is subtracted from the budget multiplier.
    pub cpu_factor: f64,
    pub memory_factor: f64,
    pub network_factor: f64,
    pub disk_factor: f64,
    /// Hard floor of the budget multiplier.
    pub min_reduction_factor: f64,
    /// Ceiling of the multiplier while adaptation is in force.
    pub max_reduction_factor: f64,
    /// Linear step the recovery tick adds back toward 1.0.
    pub recovery_rate_per_tick: f64,
}

impl AdaptiveProfile {
    /// Validate the `0 < min <= max <= 1` invariant and the recovery rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = (self.min_reduction_factor, self.max_reduction_factor);
        if !(min > 0.0 && min <= max && max <= 1.0) {
            return Err(ConfigError::InvalidReductionRange { min, max });
        }
        let rate = self.recovery_rate_per_tick;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigError::InvalidRecoveryRate(rate));
        }
        Ok(())
    }

    /// Budget multiplier for one resource under one sample, clamped to
    /// `[min_reduction_factor, max_reduction_factor]`.
    pub fn multiplier(
        &self,
        sample: &StressSample,
        weights: &StressWeights,
        critical: &CriticalLevels,
    ) -> f64 {
        let norm = |value: f64, limit: f64| {
            if limit <= 0.0 {
                1.0
            } else {
                (value / limit).clamp(0.0, 1.0)
            }
        };
        let pressure = self.cpu_factor * weights.cpu * norm(sample.cpu_percent, critical.cpu_percent)
            + self.memory_factor
                * weights.memory
                * norm(sample.memory_percent, critical.memory_percent)
            + self.network_factor
                * weights.network
                * norm(sample.network_latency_ms, critical.network_latency_ms)
            + self.disk_factor * weights.disk * norm(sample.disk_percent, critical.disk_percent);
        (1.0 - pressure).clamp(self.min_reduction_factor, self.max_reduction_factor)
    }
}

pub const CONSERVATIVE: AdaptiveProfile = AdaptiveProfile {
    name: "conservative",
    cpu_factor: 0.5,
    memory_factor: 0.5,
    network_factor: 0.4,
    disk_factor: 0.3,
    min_reduction_factor: 0.3,
    max_reduction_factor: 0.9,
    recovery_rate_per_tick: 0.05,
};

pub const BALANCED: AdaptiveProfile = AdaptiveProfile {
    name: "balanced",
    cpu_factor: 0.35,
    memory_factor: 0.35,
    network_factor: 0.25,
    disk_factor: 0.2,
    min_reduction_factor: 0.4,
    max_reduction_factor: 0.95,
    recovery_rate_per_tick: 0.1,
};

pub const AGGRESSIVE: AdaptiveProfile = AdaptiveProfile {
    name: "aggressive",
    cpu_factor: 0.2,
    memory_factor: 0.2,
    network_factor: 0.15,
    disk_factor: 0.1,
    min_reduction_factor: 0.5,
    max_reduction_factor: 1.0,
    recovery_rate_per_tick: 0.2,
};

pub const EMERGENCY: AdaptiveProfile = AdaptiveProfile {
    name: "emergency",
    cpu_factor: 0.8,
    memory_factor: 0.8,
    network_factor: 0.6,
    disk_factor: 0.5,
    min_reduction_factor: 0.1,
    max_reduction_factor: 0.5,
    recovery_rate_per_tick: 0.02,
};

/// Select the active profile for a sample.
///
/// Bands on the composite score: >= 0.9 emergency, >= 0.7 conservative,
/// >= 0.4 balanced, else aggressive. Any single dimension at its critical
/// level forces emergency regardless of the composite.
pub fn select_profile(sample: &StressSample, critical: &CriticalLevels) -> ProfileKind {
    if exceeds_critical(sample, critical) {
        return ProfileKind::Emergency;
    }
    let level = stress_level(sample, critical);
    if level >= 0.9 {
        ProfileKind::Emergency
    } else if level >= 0.7 {
        ProfileKind::Conservative
    } else if level >= 0.4 {
        ProfileKind::Balanced
    } else {
        ProfileKind::Aggressive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, mem: f64, net: f64, disk: f64) -> StressSample {
        StressSample {
            taken_at_ms: 0,
            cpu_percent: cpu,
            memory_percent: mem,
            network_latency_ms: net,
            disk_percent: disk,
        }
    }

    #[test]
    fn builtins_are_valid() {
        for kind in
            [ProfileKind::Conservative, ProfileKind::Balanced, ProfileKind::Aggressive, ProfileKind::Emergency]
        {
            kind.profile().validate().unwrap();
            assert_eq!(kind.profile().name, kind.as_str());
        }
    }

    #[test]
    fn parse_rejects_unknown_names() {
        assert_eq!(ProfileKind::parse("balanced"), Ok(ProfileKind::Balanced));
        assert!(matches!(
            ProfileKind::parse("turbo"),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn multiplier_stays_within_profile_bounds() {
        let weights = StressWeights { cpu: 1.4, memory: 1.4, network: 0.5, disk: 0.8 };
        let critical = CriticalLevels::default();
        for s in [
            sample(0.0, 0.0, 0.0, 0.0),
            sample(50.0, 50.0, 500.0, 40.0),
            sample(100.0, 100.0, 5_000.0, 100.0),
        ] {
            for kind in [
                ProfileKind::Conservative,
                ProfileKind::Balanced,
                ProfileKind::Aggressive,
                ProfileKind::Emergency,
            ] {
                let p = kind.profile();
                let m = p.multiplier(&s, &weights, &critical);
                assert!(m >= p.min_reduction_factor && m <= p.max_reduction_factor);
            }
        }
    }

    #[test]
    fn saturated_cpu_selects_emergency() {
        let critical = CriticalLevels::default();
        assert_eq!(
            select_profile(&sample(96.0, 50.0, 100.0, 20.0), &critical),
            ProfileKind::Emergency
        );
    }

    #[test]
    fn bands_select_expected_profiles() {
        let critical = CriticalLevels::default();
        assert_eq!(select_profile(&sample(10.0, 10.0, 50.0, 5.0), &critical), ProfileKind::Aggressive);
        assert_eq!(select_profile(&sample(60.0, 60.0, 500.0, 40.0), &critical), ProfileKind::Balanced);
        assert_eq!(
            select_profile(&sample(80.0, 80.0, 1_500.0, 70.0), &critical),
            ProfileKind::Conservative
        );
    }
}
