//! The fixed set of rate-limited resources and their production baselines.
//!
//! Every resource maps to exactly one limiter state and one adaptive
//! baseline. The set is closed at compile time; what varies per deployment
//! is the baseline table handed to the coordinator.

use crate::limiter::{LimiterConfig, QueuePolicy};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// A named, independently rate-limited target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ExchangePublic,
    ExchangePrivate,
    ExchangeOrders,
    NewsApi,
    SentimentApi,
    DbQueries,
    ModelA,
    ModelB,
    ModelC,
    FallbackModelApi,
    ChannelBot,
    ChannelMail,
    TunnelReconnect,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        Self::ExchangePublic,
        Self::ExchangePrivate,
        Self::ExchangeOrders,
        Self::NewsApi,
        Self::SentimentApi,
        Self::DbQueries,
        Self::ModelA,
        Self::ModelB,
        Self::ModelC,
        Self::FallbackModelApi,
        Self::ChannelBot,
        Self::ChannelMail,
        Self::TunnelReconnect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExchangePublic => "exchange-public",
            Self::ExchangePrivate => "exchange-private",
            Self::ExchangeOrders => "exchange-orders",
            Self::NewsApi => "news-api",
            Self::SentimentApi => "sentiment-api",
            Self::DbQueries => "db-queries",
            Self::ModelA => "model-a",
            Self::ModelB => "model-b",
            Self::ModelC => "model-c",
            Self::FallbackModelApi => "fallback-model-api",
            Self::ChannelBot => "channel-bot",
            Self::ChannelMail => "channel-mail",
            Self::TunnelReconnect => "tunnel-reconnect",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-resource load levels that gate whether adaptation applies at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdaptThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_latency_ms: f64,
}

/// How strongly each stress dimension bears on this resource.
///
/// Inference resources weigh cpu/memory high; order placement weighs them
/// low so trading keeps its budget until the host is genuinely saturated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StressWeights {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub disk: f64,
}

/// Everything the coordinator needs to stand up one resource.
#[derive(Debug, Clone)]
pub struct ResourceBaseline {
    pub limiter: LimiterConfig,
    pub queue: QueuePolicy,
    pub thresholds: AdaptThresholds,
    pub weights: StressWeights,
}

const SECS: fn(u64) -> Duration = Duration::from_secs;

fn baseline(
    points: u64,
    window: Duration,
    queue: QueuePolicy,
    thresholds: AdaptThresholds,
    weights: StressWeights,
) -> ResourceBaseline {
    let limiter = LimiterConfig::new(points, window).expect("static baseline is valid");
    ResourceBaseline { limiter, queue, thresholds, weights }
}

fn queue(conc: usize, size: usize, timeout: Duration) -> QueuePolicy {
    QueuePolicy::new(conc, size, timeout).expect("static queue policy is valid")
}

const EXCHANGE_THRESHOLDS: AdaptThresholds =
    AdaptThresholds { cpu_percent: 85.0, memory_percent: 85.0, network_latency_ms: 1_500.0 };
const MODEL_THRESHOLDS: AdaptThresholds =
    AdaptThresholds { cpu_percent: 75.0, memory_percent: 75.0, network_latency_ms: 1_000.0 };
const CHANNEL_THRESHOLDS: AdaptThresholds =
    AdaptThresholds { cpu_percent: 85.0, memory_percent: 85.0, network_latency_ms: 1_500.0 };

const EXCHANGE_WEIGHTS: StressWeights =
    StressWeights { cpu: 0.8, memory: 0.8, network: 1.0, disk: 0.5 };
const ORDER_WEIGHTS: StressWeights =
    StressWeights { cpu: 0.4, memory: 0.4, network: 0.8, disk: 0.2 };
const MODEL_WEIGHTS: StressWeights =
    StressWeights { cpu: 1.4, memory: 1.4, network: 0.5, disk: 0.8 };
const REMOTE_API_WEIGHTS: StressWeights =
    StressWeights { cpu: 0.6, memory: 0.6, network: 1.2, disk: 0.3 };

/// Production baseline table. Orders get small queues and short timeouts;
/// inference gets single-slot concurrency and timeouts sized to inference
/// latency; tunnel reconnects self-limit to a trickle.
pub fn baselines() -> HashMap<ResourceKind, ResourceBaseline> {
    use ResourceKind::*;
    let mut map = HashMap::new();

    map.insert(
        ExchangePublic,
        baseline(
            1_200,
            SECS(60),
            queue(8, 100, SECS(10)),
            EXCHANGE_THRESHOLDS,
            EXCHANGE_WEIGHTS,
        ),
    );
    map.insert(
        ExchangePrivate,
        baseline(600, SECS(60), queue(4, 50, SECS(10)), EXCHANGE_THRESHOLDS, EXCHANGE_WEIGHTS),
    );
    let mut orders = baseline(
        80,
        SECS(60),
        queue(2, 10, SECS(3)),
        AdaptThresholds { cpu_percent: 92.0, memory_percent: 92.0, network_latency_ms: 1_800.0 },
        ORDER_WEIGHTS,
    );
    orders.limiter = orders.limiter.with_block_duration(SECS(30)).with_even_spread();
    map.insert(ExchangeOrders, orders);

    map.insert(
        NewsApi,
        baseline(
            60,
            SECS(60),
            queue(2, 20, SECS(15)),
            AdaptThresholds {
                cpu_percent: 80.0,
                memory_percent: 80.0,
                network_latency_ms: 1_200.0,
            },
            REMOTE_API_WEIGHTS,
        ),
    );
    map.insert(
        SentimentApi,
        baseline(
            30,
            SECS(60),
            queue(2, 20, SECS(15)),
            AdaptThresholds {
                cpu_percent: 80.0,
                memory_percent: 80.0,
                network_latency_ms: 1_200.0,
            },
            REMOTE_API_WEIGHTS,
        ),
    );
    map.insert(
        DbQueries,
        baseline(
            500,
            SECS(10),
            queue(16, 200, SECS(5)),
            AdaptThresholds {
                cpu_percent: 80.0,
                memory_percent: 85.0,
                network_latency_ms: 1_000.0,
            },
            StressWeights { cpu: 0.9, memory: 1.1, network: 0.3, disk: 1.2 },
        ),
    );

    for model in [ModelA, ModelB, ModelC] {
        map.insert(
            model,
            baseline(12, SECS(60), queue(1, 20, SECS(180)), MODEL_THRESHOLDS, MODEL_WEIGHTS),
        );
    }
    map.insert(
        FallbackModelApi,
        baseline(60, SECS(60), queue(2, 30, SECS(60)), EXCHANGE_THRESHOLDS, REMOTE_API_WEIGHTS),
    );

    let mut bot = baseline(
        20,
        SECS(60),
        queue(1, 50, SECS(30)),
        CHANNEL_THRESHOLDS,
        REMOTE_API_WEIGHTS,
    );
    bot.limiter = bot.limiter.with_block_duration(SECS(60));
    map.insert(ChannelBot, bot);
    map.insert(
        ChannelMail,
        baseline(10, SECS(60), queue(1, 30, SECS(60)), CHANNEL_THRESHOLDS, REMOTE_API_WEIGHTS),
    );

    let mut tunnel = baseline(
        5,
        SECS(300),
        queue(1, 3, SECS(5)),
        AdaptThresholds {
            cpu_percent: 90.0,
            memory_percent: 90.0,
            network_latency_ms: 2_000.0,
        },
        StressWeights { cpu: 0.3, memory: 0.3, network: 1.2, disk: 0.2 },
    );
    tunnel.limiter = tunnel.limiter.with_block_duration(SECS(120));
    map.insert(TunnelReconnect, tunnel);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_baseline() {
        let table = baselines();
        for kind in ResourceKind::ALL {
            assert!(table.contains_key(&kind), "missing baseline for {kind}");
        }
        assert_eq!(table.len(), ResourceKind::ALL.len());
    }

    #[test]
    fn orders_are_smoothed_and_locked_out() {
        let table = baselines();
        let orders = &table[&ResourceKind::ExchangeOrders];
        assert!(orders.limiter.even_spread());
        assert!(orders.limiter.block_duration().is_some());
        assert_eq!(orders.limiter.points(), 80);
    }

    #[test]
    fn inference_queues_are_narrow_and_patient() {
        let table = baselines();
        let model = &table[&ResourceKind::ModelA];
        assert_eq!(model.queue.max_concurrency(), 1);
        assert!(model.queue.timeout() >= Duration::from_secs(60));
    }

    #[test]
    fn labels_round_trip_through_serde() {
        let json = serde_json::to_string(&ResourceKind::ExchangeOrders).unwrap();
        assert_eq!(json, "\"exchange-orders\"");
        assert_eq!(ResourceKind::ExchangeOrders.to_string(), "exchange-orders");
    }
}
