//! Orchestrator configuration.
//!
//! Every queue and agent pool is keyed by [`AgentType`]. The three presets
//! ([`OrchestratorConfig::production`], [`OrchestratorConfig::development`],
//! [`OrchestratorConfig::testing`]) cover the deployment environments; any of
//! them can be serialized to TOML, edited and loaded back.

use crate::retry::RetryPolicy;
use crate::types::{AgentConfig, AgentType, TaskPriority};
use coindaily_core::{CoinDailyError, CoinDailyResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bounds for the agents serving one type. Scaling itself happens outside
/// the orchestrator; only the bounds and the flag are modeled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPoolConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    #[serde(default)]
    pub auto_scaling: bool,
    /// Default config for agents of this type.
    pub config: AgentConfig,
}

/// One queue per task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Hard cap on queued (not processing) tasks.
    pub max_size: usize,
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    /// Priorities this queue accepts.
    pub priority_levels: Vec<TaskPriority>,
    /// Retain tasks that exhausted their retries.
    #[serde(default = "default_true")]
    pub dead_letter_queue: bool,
}

impl QueueConfig {
    /// Whether submissions at `priority` are allowed.
    pub fn accepts(&self, priority: TaskPriority) -> bool {
        self.priority_levels.contains(&priority)
    }
}

/// Levels above which the metrics loop raises alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Alert when a queue holds more than this many tasks.
    pub queue_size: usize,
    /// Alert when the error rate (0.0–1.0) exceeds this value.
    pub error_rate: f64,
    /// Alert when the average response time (ms) exceeds this value.
    pub response_time_ms: f64,
}

/// Timer intervals, liveness threshold and history sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub metrics_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Heartbeat staleness after which an agent counts as offline.
    #[serde(default = "default_offline_threshold_ms")]
    pub offline_threshold_ms: u64,
    pub alert_thresholds: AlertThresholds,
    #[serde(default = "default_alert_history")]
    pub alert_history: usize,
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

/// Global limits applied to assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_response_time_ms: u64,
    /// Cap on tasks processing at once across all types.
    pub max_concurrent_tasks: usize,
    #[serde(default)]
    pub enable_circuit_breaker: bool,
}

/// Static configuration supplied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub agents: HashMap<AgentType, AgentPoolConfig>,
    pub queues: HashMap<AgentType, QueueConfig>,
    pub monitoring: MonitoringConfig,
    pub performance: PerformanceConfig,
}

fn default_true() -> bool {
    true
}
fn default_process_timeout_ms() -> u64 {
    300_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_offline_threshold_ms() -> u64 {
    5 * 60 * 1000
}
/// Alerts kept in memory and in the state store.
pub const DEFAULT_ALERT_HISTORY: usize = 100;

fn default_alert_history() -> usize {
    DEFAULT_ALERT_HISTORY
}
fn default_event_history() -> usize {
    1_000
}

fn pool(min: u32, max: u32, auto_scaling: bool, config: AgentConfig) -> AgentPoolConfig {
    AgentPoolConfig {
        min_instances: min,
        max_instances: max,
        auto_scaling,
        config,
    }
}

fn agent(
    max_concurrent_tasks: u32,
    timeout_ms: u64,
    retry_policy: RetryPolicy,
    health_check_interval_ms: u64,
) -> AgentConfig {
    AgentConfig {
        max_concurrent_tasks,
        timeout_ms,
        retry_policy,
        health_check_interval_ms,
    }
}

fn queue(
    name: &str,
    max_size: usize,
    process_timeout_ms: u64,
    retry_policy: RetryPolicy,
    priority_levels: &[TaskPriority],
) -> QueueConfig {
    QueueConfig {
        name: name.to_string(),
        max_size,
        process_timeout_ms,
        retry_policy,
        priority_levels: priority_levels.to_vec(),
        dead_letter_queue: true,
    }
}

fn monitoring(metrics_interval_ms: u64, thresholds: AlertThresholds) -> MonitoringConfig {
    MonitoringConfig {
        metrics_interval_ms,
        health_check_interval_ms: default_health_check_interval_ms(),
        offline_threshold_ms: default_offline_threshold_ms(),
        alert_thresholds: thresholds,
        alert_history: default_alert_history(),
        event_history: default_event_history(),
    }
}

use TaskPriority::{High, Low, Normal, Urgent};

impl OrchestratorConfig {
    /// Production sizing.
    pub fn production() -> Self {
        use AgentType::*;
        let agents = HashMap::from([
            (
                ContentGeneration,
                pool(2, 8, true, agent(5, 45_000, RetryPolicy::exponential(3, 2_000, 30_000), 30_000)),
            ),
            (
                MarketAnalysis,
                pool(2, 6, true, agent(8, 30_000, RetryPolicy::linear(2, 3_000, 15_000), 20_000)),
            ),
            (
                QualityReview,
                pool(1, 4, true, agent(6, 25_000, RetryPolicy::fixed(2, 2_500), 25_000)),
            ),
            (
                Translation,
                pool(3, 12, true, agent(15, 20_000, RetryPolicy::exponential(3, 1_000, 10_000), 15_000)),
            ),
            (
                SentimentAnalysis,
                pool(2, 6, true, agent(10, 15_000, RetryPolicy::linear(2, 1_500, 8_000), 20_000)),
            ),
            (
                Moderation,
                pool(1, 4, true, agent(12, 18_000, RetryPolicy::fixed(1, 3_000), 30_000)),
            ),
        ]);
        let queues = HashMap::from([
            (
                ContentGeneration,
                queue("content_generation_queue", 2_000, 600_000, RetryPolicy::exponential(3, 2_000, 30_000), &[Low, Normal, High, Urgent]),
            ),
            (
                MarketAnalysis,
                queue("market_analysis_queue", 1_500, 300_000, RetryPolicy::linear(2, 3_000, 15_000), &[Normal, High, Urgent]),
            ),
            (
                QualityReview,
                queue("quality_review_queue", 1_200, 240_000, RetryPolicy::fixed(2, 2_500), &[Normal, High, Urgent]),
            ),
            (
                Translation,
                queue("translation_queue", 5_000, 180_000, RetryPolicy::exponential(3, 1_000, 10_000), &[Low, Normal, High, Urgent]),
            ),
            (
                SentimentAnalysis,
                queue("sentiment_analysis_queue", 1_000, 120_000, RetryPolicy::linear(2, 1_500, 8_000), &[Normal, High, Urgent]),
            ),
            (
                Moderation,
                queue("moderation_queue", 2_500, 150_000, RetryPolicy::fixed(1, 3_000), &[High, Urgent]),
            ),
        ]);
        Self {
            agents,
            queues,
            monitoring: monitoring(
                30_000,
                AlertThresholds {
                    queue_size: 200,
                    error_rate: 0.15,
                    response_time_ms: 500.0,
                },
            ),
            performance: PerformanceConfig {
                max_response_time_ms: 500,
                max_concurrent_tasks: 100,
                enable_circuit_breaker: true,
            },
        }
    }

    /// Small pools and queues, lenient thresholds, no circuit breaker.
    pub fn development() -> Self {
        use AgentType::*;
        let agents = HashMap::from([
            (
                ContentGeneration,
                pool(1, 2, false, agent(2, 30_000, RetryPolicy::exponential(2, 1_000, 10_000), 15_000)),
            ),
            (
                MarketAnalysis,
                pool(1, 2, false, agent(2, 20_000, RetryPolicy::linear(1, 2_000, 5_000), 15_000)),
            ),
            (
                QualityReview,
                pool(1, 1, false, agent(1, 15_000, RetryPolicy::fixed(1, 1_000), 20_000)),
            ),
            (
                Translation,
                pool(1, 3, false, agent(3, 10_000, RetryPolicy::exponential(2, 500, 3_000), 10_000)),
            ),
            (
                SentimentAnalysis,
                pool(1, 2, false, agent(2, 8_000, RetryPolicy::linear(1, 1_000, 3_000), 15_000)),
            ),
            (
                Moderation,
                pool(1, 1, false, agent(2, 10_000, RetryPolicy::fixed(1, 1_500), 20_000)),
            ),
        ]);
        let queues = HashMap::from([
            (
                ContentGeneration,
                queue("dev_content_generation_queue", 100, 120_000, RetryPolicy::exponential(2, 1_000, 10_000), &[Low, Normal, High, Urgent]),
            ),
            (
                MarketAnalysis,
                queue("dev_market_analysis_queue", 50, 90_000, RetryPolicy::linear(1, 2_000, 5_000), &[Normal, High, Urgent]),
            ),
            (
                QualityReview,
                queue("dev_quality_review_queue", 30, 60_000, RetryPolicy::fixed(1, 1_000), &[Normal, High]),
            ),
            (
                Translation,
                queue("dev_translation_queue", 200, 45_000, RetryPolicy::exponential(2, 500, 3_000), &[Low, Normal, High]),
            ),
            (
                SentimentAnalysis,
                queue("dev_sentiment_analysis_queue", 40, 30_000, RetryPolicy::linear(1, 1_000, 3_000), &[Normal, High]),
            ),
            (
                Moderation,
                queue("dev_moderation_queue", 60, 40_000, RetryPolicy::fixed(1, 1_500), &[High, Urgent]),
            ),
        ]);
        Self {
            agents,
            queues,
            monitoring: monitoring(
                15_000,
                AlertThresholds {
                    queue_size: 50,
                    error_rate: 0.25,
                    response_time_ms: 1_000.0,
                },
            ),
            performance: PerformanceConfig {
                max_response_time_ms: 1_000,
                max_concurrent_tasks: 20,
                enable_circuit_breaker: false,
            },
        }
    }

    /// Single-instance pools with tiny queues and short delays.
    pub fn testing() -> Self {
        use AgentType::*;
        let agents = HashMap::from([
            (ContentGeneration, pool(1, 1, false, agent(1, 5_000, RetryPolicy::fixed(1, 100), 5_000))),
            (MarketAnalysis, pool(1, 1, false, agent(1, 5_000, RetryPolicy::fixed(1, 100), 5_000))),
            (QualityReview, pool(1, 1, false, agent(1, 3_000, RetryPolicy::fixed(1, 50), 10_000))),
            (Translation, pool(1, 1, false, agent(1, 3_000, RetryPolicy::fixed(1, 50), 10_000))),
            (SentimentAnalysis, pool(1, 1, false, agent(1, 2_000, RetryPolicy::fixed(1, 50), 10_000))),
            (Moderation, pool(1, 1, false, agent(1, 2_000, RetryPolicy::fixed(1, 50), 10_000))),
        ]);
        let queues = HashMap::from([
            (
                ContentGeneration,
                queue("test_content_generation_queue", 10, 10_000, RetryPolicy::fixed(1, 100), &[Normal, High, Urgent]),
            ),
            (
                MarketAnalysis,
                queue("test_market_analysis_queue", 10, 10_000, RetryPolicy::fixed(1, 100), &[Normal, High]),
            ),
            (
                QualityReview,
                queue("test_quality_review_queue", 5, 8_000, RetryPolicy::fixed(1, 50), &[Normal, High]),
            ),
            (
                Translation,
                queue("test_translation_queue", 20, 8_000, RetryPolicy::fixed(1, 50), &[Normal, High]),
            ),
            (
                SentimentAnalysis,
                queue("test_sentiment_analysis_queue", 5, 5_000, RetryPolicy::fixed(1, 50), &[Normal, High]),
            ),
            (
                Moderation,
                queue("test_moderation_queue", 8, 6_000, RetryPolicy::fixed(1, 50), &[High, Urgent]),
            ),
        ]);
        let mut monitoring = monitoring(
            5_000,
            AlertThresholds {
                queue_size: 5,
                error_rate: 0.5,
                response_time_ms: 2_000.0,
            },
        );
        monitoring.health_check_interval_ms = 5_000;
        Self {
            agents,
            queues,
            monitoring,
            performance: PerformanceConfig {
                max_response_time_ms: 2_000,
                max_concurrent_tasks: 5,
                enable_circuit_breaker: false,
            },
        }
    }

    /// Pick a preset by environment name (`production`, `test`, anything
    /// else falls back to development).
    pub fn for_environment(env: &str) -> Self {
        match env {
            "production" => Self::production(),
            "test" | "testing" => Self::testing(),
            _ => Self::development(),
        }
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> CoinDailyResult<()> {
        for agent_type in AgentType::ALL {
            let queue = self.queues.get(&agent_type).ok_or_else(|| {
                CoinDailyError::Config(format!("missing queue config for {agent_type}"))
            })?;
            if queue.max_size == 0 {
                return Err(CoinDailyError::Config(format!(
                    "queue {} must have max_size > 0",
                    queue.name
                )));
            }
            if queue.priority_levels.is_empty() {
                return Err(CoinDailyError::Config(format!(
                    "queue {} accepts no priority levels",
                    queue.name
                )));
            }
            if queue.retry_policy.max_delay_ms < queue.retry_policy.base_delay_ms {
                return Err(CoinDailyError::Config(format!(
                    "queue {} has max_delay_ms below base_delay_ms",
                    queue.name
                )));
            }
        }
        for (agent_type, pool) in &self.agents {
            if pool.min_instances > pool.max_instances {
                return Err(CoinDailyError::Config(format!(
                    "agent pool {agent_type} has min_instances above max_instances"
                )));
            }
            if pool.config.max_concurrent_tasks == 0 {
                return Err(CoinDailyError::Config(format!(
                    "agent pool {agent_type} must allow at least one concurrent task"
                )));
            }
        }
        if self.monitoring.metrics_interval_ms == 0 || self.monitoring.health_check_interval_ms == 0
        {
            return Err(CoinDailyError::Config(
                "monitoring intervals must be greater than zero".to_string(),
            ));
        }
        if self.performance.max_concurrent_tasks == 0 {
            return Err(CoinDailyError::Config(
                "performance.max_concurrent_tasks must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Queue config for a type. Presence is guaranteed after [`validate`](Self::validate).
    pub fn queue(&self, agent_type: AgentType) -> Option<&QueueConfig> {
        self.queues.get(&agent_type)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::development()
    }
}
