use crate::config::AlertThresholds;
use crate::types::AgentType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// Live counters for one task type's queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Queued tasks, including those waiting out a retry delay.
    pub queue_size: usize,
    /// Queued tasks eligible for assignment now.
    pub pending_tasks: usize,
    /// Queued tasks still inside their retry backoff.
    pub delayed_tasks: usize,
    pub processing_tasks: usize,
    pub completed_tasks: usize,
    /// Terminally failed tasks.
    pub failed_tasks: usize,
    pub dead_letter_tasks: usize,
    /// Mean time from creation to assignment across assigned tasks.
    pub average_wait_time_ms: f64,
}

/// System-wide snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub total_agents: usize,
    pub active_agents: usize,
    /// Mean processing time (ms) over completed tasks.
    pub average_response_time: f64,
    /// Terminal failures over finished tasks, 0.0–1.0.
    pub error_rate: f64,
    pub queue_metrics: BTreeMap<AgentType, QueueMetrics>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// An operational alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub message: String,
    pub level: AlertLevel,
    pub context: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Alert stamped at `timestamp` with a fresh id.
    pub fn new(
        message: impl Into<String>,
        level: AlertLevel,
        context: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            level,
            context,
            timestamp,
        }
    }
}

/// Threshold breach found in a metrics snapshot, not yet raised.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub message: String,
    pub level: AlertLevel,
    pub context: serde_json::Value,
}

/// The most recent alerts, oldest first.
#[derive(Debug)]
pub struct AlertLog {
    alerts: VecDeque<Alert>,
    capacity: usize,
}

impl AlertLog {
    /// Log keeping the last `capacity` alerts.
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: VecDeque::new(),
            capacity,
        }
    }

    /// Append an alert, dropping the oldest when full.
    pub fn push(&mut self, alert: Alert) {
        if self.capacity == 0 {
            return;
        }
        while self.alerts.len() >= self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    /// Alerts held, oldest first.
    pub fn all(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    /// Alerts held.
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// Whether no alert is held.
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

/// Compare a snapshot with the configured thresholds.
pub fn evaluate_thresholds(metrics: &SystemMetrics, thresholds: &AlertThresholds) -> Vec<AlertCandidate> {
    let mut candidates = Vec::new();
    for (agent_type, queue) in &metrics.queue_metrics {
        if queue.queue_size > thresholds.queue_size {
            candidates.push(AlertCandidate {
                message: format!("Queue size threshold exceeded for {agent_type}"),
                level: AlertLevel::Warning,
                context: serde_json::json!({
                    "task_type": agent_type,
                    "queue_size": queue.queue_size,
                    "threshold": thresholds.queue_size,
                }),
            });
        }
    }
    if metrics.error_rate > thresholds.error_rate {
        candidates.push(AlertCandidate {
            message: "Error rate threshold exceeded".to_string(),
            level: AlertLevel::Error,
            context: serde_json::json!({
                "error_rate": metrics.error_rate,
                "threshold": thresholds.error_rate,
            }),
        });
    }
    if metrics.average_response_time > thresholds.response_time_ms {
        candidates.push(AlertCandidate {
            message: "Response time threshold exceeded".to_string(),
            level: AlertLevel::Warning,
            context: serde_json::json!({
                "average_response_time": metrics.average_response_time,
                "threshold": thresholds.response_time_ms,
            }),
        });
    }
    candidates
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            queue_size: 10,
            error_rate: 0.1,
            response_time_ms: 500.0,
        }
    }

    #[test]
    fn test_quiet_system_raises_nothing() {
        let metrics = SystemMetrics::default();
        assert!(evaluate_thresholds(&metrics, &thresholds()).is_empty());
    }

    #[test]
    fn test_each_threshold() {
        let mut metrics = SystemMetrics {
            error_rate: 0.2,
            average_response_time: 750.0,
            ..SystemMetrics::default()
        };
        metrics.queue_metrics.insert(
            AgentType::Translation,
            QueueMetrics {
                queue_size: 11,
                ..QueueMetrics::default()
            },
        );
        metrics.queue_metrics.insert(
            AgentType::Moderation,
            QueueMetrics {
                queue_size: 10,
                ..QueueMetrics::default()
            },
        );

        let alerts = evaluate_thresholds(&metrics, &thresholds());
        assert_eq!(alerts.len(), 3);
        assert!(alerts[0].message.contains("translation"));
        assert_eq!(alerts[0].context["queue_size"], 11);
        assert_eq!(alerts[1].level, AlertLevel::Error);
        assert!(alerts[2].message.contains("Response time"));
    }

    #[test]
    fn test_alert_log_keeps_most_recent() {
        let mut log = AlertLog::new(2);
        for i in 0..3 {
            log.push(Alert::new(format!("alert {i}"), AlertLevel::Warning, json!({}), Utc::now()));
        }
        let alerts = log.all();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].message, "alert 1");
        assert_eq!(alerts[1].message, "alert 2");
    }

    #[test]
    fn test_zero_state_metrics_serialize() {
        let json = serde_json::to_value(SystemMetrics::default()).unwrap();
        assert_eq!(json["total_tasks"], 0);
        assert_eq!(json["error_rate"], 0.0);
    }
}
