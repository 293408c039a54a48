use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Category of background work. Selects the queue a task enters and the
/// agents allowed to process it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Articles, summaries and social posts.
    ContentGeneration,
    /// Price, volume and correlation analysis over exchanges.
    MarketAnalysis,
    /// Accuracy, bias and sensitivity review of generated content.
    QualityReview,
    /// Translation into the platform's target languages.
    Translation,
    /// Sentiment scoring of news and social content.
    SentimentAnalysis,
    /// Rule-based content moderation.
    Moderation,
}

impl AgentType {
    /// Every agent type, in declaration order.
    pub const ALL: [AgentType; 6] = [
        AgentType::ContentGeneration,
        AgentType::MarketAnalysis,
        AgentType::QualityReview,
        AgentType::Translation,
        AgentType::SentimentAnalysis,
        AgentType::Moderation,
    ];

    /// Stable snake_case name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ContentGeneration => "content_generation",
            AgentType::MarketAnalysis => "market_analysis",
            AgentType::QualityReview => "quality_review",
            AgentType::Translation => "translation",
            AgentType::SentimentAnalysis => "sentiment_analysis",
            AgentType::Moderation => "moderation",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Variants are declared lowest first so the derived
/// `Ord` gives `Low < Normal < High < Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Externally visible status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Regional market context forwarded to agents untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub region: String,
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default)]
    pub mobile_money_providers: Vec<String>,
    pub timezone: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cultural_context: HashMap<String, serde_json::Value>,
}

/// Inclusive time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Article or summary generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentGenerationPayload {
    pub topic: String,
    #[serde(default)]
    pub target_languages: Vec<String>,
    /// e.g. `article`, `summary`, `social_post`.
    pub content_type: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Market data analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAnalysisPayload {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub exchanges: Vec<String>,
    pub analysis_type: String,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Editorial review of produced content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReviewPayload {
    pub content_id: String,
    pub content: String,
    pub content_type: String,
    #[serde(default)]
    pub review_criteria: Vec<String>,
    #[serde(default)]
    pub requires_fact_check: bool,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Translation into one or more languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationPayload {
    #[serde(default)]
    pub content_id: Option<String>,
    pub text: String,
    pub source_language: String,
    pub target_languages: Vec<String>,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Sentiment scoring of a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentAnalysisPayload {
    pub content: String,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Content moderation against a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationPayload {
    pub content: String,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default, alias = "african_context")]
    pub market_context: Option<MarketContext>,
}

/// Type-specific task data. The variant decides the task's [`AgentType`];
/// the orchestrator stores and forwards the content without interpreting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    ContentGeneration(ContentGenerationPayload),
    MarketAnalysis(MarketAnalysisPayload),
    QualityReview(QualityReviewPayload),
    Translation(TranslationPayload),
    SentimentAnalysis(SentimentAnalysisPayload),
    Moderation(ModerationPayload),
}

impl TaskPayload {
    /// Task type implied by the payload variant.
    pub fn agent_type(&self) -> AgentType {
        match self {
            TaskPayload::ContentGeneration(_) => AgentType::ContentGeneration,
            TaskPayload::MarketAnalysis(_) => AgentType::MarketAnalysis,
            TaskPayload::QualityReview(_) => AgentType::QualityReview,
            TaskPayload::Translation(_) => AgentType::Translation,
            TaskPayload::SentimentAnalysis(_) => AgentType::SentimentAnalysis,
            TaskPayload::Moderation(_) => AgentType::Moderation,
        }
    }

    /// Regional market context, whatever the variant.
    pub fn market_context(&self) -> Option<&MarketContext> {
        match self {
            TaskPayload::ContentGeneration(p) => p.market_context.as_ref(),
            TaskPayload::MarketAnalysis(p) => p.market_context.as_ref(),
            TaskPayload::QualityReview(p) => p.market_context.as_ref(),
            TaskPayload::Translation(p) => p.market_context.as_ref(),
            TaskPayload::SentimentAnalysis(p) => p.market_context.as_ref(),
            TaskPayload::Moderation(p) => p.market_context.as_ref(),
        }
    }
}

/// Bookkeeping attached to every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    /// Per-task override. Resolved from the queue's retry policy on submission.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Retry backoff gate: the task is not dequeued before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskMetadata {
    /// Fresh metadata stamped at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            retry_count: 0,
            max_retries: None,
            timeout_ms: None,
            assigned_agent: None,
            started_at: None,
            not_before: None,
        }
    }
}

/// Measurements reported with a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunMetrics {
    pub processing_time_ms: u64,
}

/// Outcome reported by the agent that processed a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: Option<TaskRunMetrics>,
}

impl TaskResult {
    /// Successful result carrying `data`.
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Failed result carrying `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach the processing time in milliseconds.
    pub fn with_processing_time(mut self, ms: u64) -> Self {
        self.metrics = Some(TaskRunMetrics {
            processing_time_ms: ms,
        });
        self
    }
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub result: Option<TaskResult>,
}

impl Task {
    /// Create a queued task with a generated id.
    pub fn new(priority: TaskPriority, payload: TaskPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            priority,
            status: TaskStatus::Queued,
            payload,
            metadata: TaskMetadata::new(Utc::now()),
            result: None,
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the queue retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.metadata.max_retries = Some(max_retries);
        self
    }

    /// Start from an existing retry count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.metadata.retry_count = retry_count;
        self
    }

    /// Processing timeout for this task.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.metadata.timeout_ms = Some(timeout_ms);
        self
    }

    /// Backdate or postdate creation; affects FIFO order.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.metadata.created_at = created_at;
        self.metadata.updated_at = created_at;
        self
    }

    /// Queue this task belongs to.
    pub fn task_type(&self) -> AgentType {
        self.payload.agent_type()
    }

    /// Resolved retry limit; 0 before submission resolves it.
    pub fn max_retries(&self) -> u32 {
        self.metadata.max_retries.unwrap_or(0)
    }

    /// Whether a failure would requeue the task.
    pub fn has_retries_left(&self) -> bool {
        self.metadata.retry_count < self.max_retries()
    }

    /// Whether the retry backoff gate has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.metadata.not_before.map_or(true, |t| t <= now)
    }
}

/// Status of a registered agent. `Offline` is never stored by the
/// orchestrator; liveness is derived from heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

/// Per-agent operational limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_concurrent_tasks: u32,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub health_check_interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
            timeout_ms: 30_000,
            retry_policy: RetryPolicy::default(),
            health_check_interval_ms: 30_000,
        }
    }
}

/// Last failure seen by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
}

/// Performance counters tracked per agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    /// Running mean in milliseconds.
    pub average_processing_time: f64,
    /// Seconds, reported by the agent.
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<AgentError>,
}

/// A worker registered with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    /// Informational tags; matching uses `agent_type` only.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub config: AgentConfig,
    #[serde(default)]
    pub metrics: AgentMetrics,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Idle agent with zeroed metrics and a heartbeat of now.
    pub fn new(id: impl Into<String>, agent_type: AgentType, config: AgentConfig) -> Self {
        Self {
            id: id.into(),
            agent_type,
            status: AgentStatus::Idle,
            capabilities: Vec::new(),
            config,
            metrics: AgentMetrics::default(),
            last_heartbeat: Utc::now(),
        }
    }

    /// Replace the capability tags.
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Start from existing metrics.
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the heartbeat timestamp.
    pub fn with_last_heartbeat(mut self, last_heartbeat: DateTime<Utc>) -> Self {
        self.last_heartbeat = last_heartbeat;
        self
    }
}

/// Ids become map keys and file names in the state store.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        && id != "."
        && id != ".."
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sentiment(content: &str) -> TaskPayload {
        TaskPayload::SentimentAnalysis(SentimentAnalysisPayload {
            content: content.to_string(),
            market_context: None,
        })
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new(TaskPriority::Normal, sentiment("BTC breaks out"));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.task_type(), AgentType::SentimentAnalysis);
        assert_eq!(task.metadata.retry_count, 0);
        assert!(task.metadata.max_retries.is_none());
        assert!(task.result.is_none());
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_retries_left() {
        let task = Task::new(TaskPriority::High, sentiment("x")).with_max_retries(1);
        assert!(task.has_retries_left());
        let task = task.with_retry_count(1);
        assert!(!task.has_retries_left());
    }

    #[test]
    fn test_eligibility_gate() {
        let now = Utc::now();
        let mut task = Task::new(TaskPriority::Normal, sentiment("x"));
        assert!(task.is_eligible(now));
        task.metadata.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!task.is_eligible(now));
        assert!(task.is_eligible(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_agent_type_display_matches_serde() {
        for agent_type in AgentType::ALL {
            let json = serde_json::to_string(&agent_type).unwrap();
            assert_eq!(json, format!("\"{agent_type}\""));
        }
    }

    #[test]
    fn test_payload_accepts_african_context_alias() {
        let json = serde_json::json!({
            "kind": "moderation",
            "content": "Buy this unlisted token now",
            "rules": ["unlisted_tokens", "spam_detection"],
            "african_context": {
                "region": "central",
                "countries": ["Cameroon"],
                "mobile_money_providers": ["Orange Money", "MTN Money"],
                "timezone": "Africa/Douala"
            }
        });
        let payload: TaskPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.agent_type(), AgentType::Moderation);
        let ctx = payload.market_context().unwrap();
        assert_eq!(ctx.region, "central");
        assert!(ctx.mobile_money_providers.contains(&"MTN Money".to_string()));
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("content-agent-1"));
        assert!(is_valid_id("task_1.retry:2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("../etc/passwd"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id(&"a".repeat(129)));
    }

    #[test]
    fn test_task_result_constructors() {
        let ok = TaskResult::success(serde_json::json!({"word_count": 500}))
            .with_processing_time(1200);
        assert!(ok.error.is_none());
        assert_eq!(ok.metrics.unwrap().processing_time_ms, 1200);

        let err = TaskResult::failure("Agent processing error");
        assert_eq!(err.error.as_deref(), Some("Agent processing error"));
        assert!(err.data.is_none());
    }
}
