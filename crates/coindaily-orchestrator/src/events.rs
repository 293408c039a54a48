use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Buffer of the broadcast channel; slow subscribers lag past this.
const CHANNEL_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorEventKind {
    OrchestratorStarted,
    OrchestratorShutdown,
    AgentRegistered,
    AgentUnregistered,
    AgentOffline,
    AgentOnline,
    TaskQueued,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskRequeued,
    TaskDeadLettered,
    TaskReassigned,
    QueueOverflow,
    AlertRaised,
    CircuitOpened,
}

/// How much attention an event deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Something that happened inside the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub id: Uuid,
    pub kind: OrchestratorEventKind,
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
}

impl OrchestratorEvent {
    /// Info-level event stamped at `timestamp`.
    pub fn new(kind: OrchestratorEventKind, timestamp: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp,
            severity: EventSeverity::Info,
            data,
        }
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Fan-out of orchestrator events to live subscribers plus a bounded
/// history for late readers.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
    history: Mutex<VecDeque<OrchestratorEvent>>,
    capacity: usize,
}

impl EventBus {
    /// Bus keeping the last `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity,
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Record an event and broadcast it to subscribers.
    pub fn emit(&self, event: OrchestratorEvent) {
        {
            let mut history = self.history.lock();
            if self.capacity > 0 {
                while history.len() >= self.capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<OrchestratorEvent> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Events currently held in history.
    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: OrchestratorEventKind, n: u64) -> OrchestratorEvent {
        OrchestratorEvent::new(kind, Utc::now(), json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        bus.emit(event(OrchestratorEventKind::TaskQueued, 1));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, OrchestratorEventKind::TaskQueued);
        assert_eq!(received.severity, EventSeverity::Info);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        bus.emit(event(OrchestratorEventKind::OrchestratorStarted, 1));
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new(3);
        for n in 0..5 {
            bus.emit(event(OrchestratorEventKind::TaskCompleted, n));
        }
        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].data["n"], 2);
        assert_eq!(recent[2].data["n"], 4);

        let last = bus.recent(1);
        assert_eq!(last[0].data["n"], 4);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let e = event(OrchestratorEventKind::TaskDeadLettered, 0).with_severity(EventSeverity::Error);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "task_dead_lettered");
        assert_eq!(json["severity"], "error");
    }
}
