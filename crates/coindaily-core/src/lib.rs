//! Core error definitions shared by the CoinDaily orchestration crates.
//!
//! # Main types
//!
//! - [`CoinDailyError`]: Unified error enum for the orchestrator and its tooling.
//! - [`CoinDailyResult`]: Convenience alias for `Result<T, CoinDailyError>`.

/// Top-level error type for the CoinDaily orchestrator.
///
/// Lookups of unknown agents or tasks are not errors: those operations return
/// `Option`/`bool`. Variants here describe caller mistakes and hard failures.
#[derive(Debug, thiserror::Error)]
pub enum CoinDailyError {
    /// A submission was rejected because the target queue is full.
    #[error("Queue size limit exceeded for {task_type} ({size}/{limit})")]
    QueueSizeExceeded {
        /// Queue (task type) that rejected the task.
        task_type: String,
        /// Number of queued tasks at the time of the rejection.
        size: usize,
        /// Configured `max_size` of the queue.
        limit: usize,
    },

    /// The task priority is not one of the queue's accepted levels.
    #[error("Priority {priority} is not accepted by the {task_type} queue")]
    PriorityNotAccepted {
        /// Queue (task type) that rejected the task.
        task_type: String,
        /// Priority carried by the rejected task.
        priority: String,
    },

    /// The submitted task is malformed.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// The registered agent is malformed.
    #[error("Invalid agent: {0}")]
    InvalidAgent(String),

    /// Callers may only set an agent to a status they own.
    #[error("Agent status {0} cannot be set directly")]
    InvalidAgentStatus(String),

    /// A status update that the task state machine does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task the update was addressed to.
        task_id: String,
        /// Current status of the task.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The orchestrator must be started before this operation.
    #[error("Orchestrator is not running")]
    NotRunning,

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the backing state store.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CoinDailyError`].
pub type CoinDailyResult<T> = Result<T, CoinDailyError>;
