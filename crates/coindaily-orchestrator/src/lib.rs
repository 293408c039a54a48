//! Task queueing and agent lifecycle coordination for CoinDaily's AI workers.
//!
//! Callers submit typed tasks into one priority queue per [`AgentType`];
//! registered agents receive them through [`Orchestrator::assign_task`] and
//! report back through [`Orchestrator::update_task_status`]. Failed attempts
//! are retried with backoff and end up in a dead-letter store once their
//! retries are spent. Heartbeats drive liveness; metrics and alerts are
//! computed from live state.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Facade owning queues, registry, timers and the state store.
//! - [`TaskQueue`]: Per-type priority queue with retry gates and dead-letter store.
//! - [`AgentRegistry`]: Registered agents and their in-flight tasks.
//! - [`OrchestratorConfig`]: Queue, agent pool, monitoring and performance settings.
//! - [`StateStore`]: Write-through persistence seam.

/// Per-type circuit breaker gating assignment.
pub mod circuit_breaker;
/// Injectable wall clock.
pub mod clock;
/// Configuration types and environment presets.
pub mod config;
/// The orchestrator facade.
pub mod engine;
/// Event broadcast and history.
pub mod events;
/// Heartbeat-derived agent liveness.
pub mod liveness;
/// Queue and system metrics, alerts and thresholds.
pub mod monitor;
/// Agent registry.
pub mod registry;
/// Retry policies and backoff.
pub mod retry;
/// State persistence.
pub mod store;
/// Priority task queue and dead-letter store.
pub mod task_queue;
/// Tasks, agents and their payloads.
pub mod types;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AgentPoolConfig, AlertThresholds, MonitoringConfig, OrchestratorConfig, PerformanceConfig,
    QueueConfig, DEFAULT_ALERT_HISTORY,
};
pub use engine::{HealthReport, Orchestrator, TaskAssignment, TaskOutcome};
pub use events::{EventBus, EventSeverity, OrchestratorEvent, OrchestratorEventKind};
pub use liveness::{AgentLiveness, LivenessTransition};
pub use monitor::{evaluate_thresholds, Alert, AlertLevel, QueueMetrics, SystemMetrics};
pub use registry::AgentRegistry;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{FileStateStore, InMemoryStore, StateStore};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentConfig, AgentError, AgentMetrics, AgentStatus, AgentType, ContentGenerationPayload,
    MarketAnalysisPayload, MarketContext, ModerationPayload, QualityReviewPayload,
    SentimentAnalysisPayload, Task, TaskMetadata, TaskPayload, TaskPriority, TaskResult,
    TaskRunMetrics, TaskStatus, TimeRange, TranslationPayload,
};
