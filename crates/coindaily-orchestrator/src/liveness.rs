use crate::clock::elapsed_ms;
use crate::types::{Agent, AgentType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Liveness derived from the heartbeat age. Never stored on the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLiveness {
    Online,
    Offline,
}

impl AgentLiveness {
    /// An agent is offline once its heartbeat is strictly older than
    /// `threshold_ms`.
    pub fn of(agent: &Agent, now: DateTime<Utc>, threshold_ms: u64) -> Self {
        if elapsed_ms(agent.last_heartbeat, now) > threshold_ms {
            AgentLiveness::Offline
        } else {
            AgentLiveness::Online
        }
    }
}

/// An agent whose liveness changed since the previous check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessTransition {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub liveness: AgentLiveness,
    pub last_heartbeat: DateTime<Utc>,
}

/// Remembers which agents were last seen offline so each health check only
/// reports changes.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    offline: HashSet<String>,
}

impl LivenessTracker {
    /// Tracker that has seen no agents yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the current liveness of `agents` with the previous check.
    pub fn observe<'a>(
        &mut self,
        agents: impl IntoIterator<Item = &'a Agent>,
        now: DateTime<Utc>,
        threshold_ms: u64,
    ) -> Vec<LivenessTransition> {
        let mut transitions = Vec::new();
        let mut seen = HashSet::new();
        for agent in agents {
            seen.insert(agent.id.clone());
            let liveness = AgentLiveness::of(agent, now, threshold_ms);
            let changed = match liveness {
                AgentLiveness::Offline => self.offline.insert(agent.id.clone()),
                AgentLiveness::Online => self.offline.remove(&agent.id),
            };
            if changed {
                transitions.push(LivenessTransition {
                    agent_id: agent.id.clone(),
                    agent_type: agent.agent_type,
                    liveness,
                    last_heartbeat: agent.last_heartbeat,
                });
            }
        }
        // Forget unregistered agents.
        self.offline.retain(|id| seen.contains(id));
        transitions
    }

    /// Drop state for an unregistered agent.
    pub fn forget(&mut self, agent_id: &str) {
        self.offline.remove(agent_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::AgentConfig;
    use chrono::Duration;

    fn agent(id: &str, heartbeat: DateTime<Utc>) -> Agent {
        Agent::new(id, AgentType::Translation, AgentConfig::default()).with_last_heartbeat(heartbeat)
    }

    #[test]
    fn test_threshold_is_strict() {
        let now = Utc::now();
        let a = agent("a", now - Duration::milliseconds(1_000));
        assert_eq!(AgentLiveness::of(&a, now, 1_000), AgentLiveness::Online);
        assert_eq!(AgentLiveness::of(&a, now, 999), AgentLiveness::Offline);
    }

    #[test]
    fn test_reports_transitions_once() {
        let now = Utc::now();
        let stale = agent("stale", now - Duration::minutes(10));
        let fresh = agent("fresh", now);
        let mut tracker = LivenessTracker::new();

        let first = tracker.observe([&stale, &fresh], now, 300_000);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].agent_id, "stale");
        assert_eq!(first[0].liveness, AgentLiveness::Offline);

        assert!(tracker.observe([&stale, &fresh], now, 300_000).is_empty());

        let revived = agent("stale", now);
        let back = tracker.observe([&revived, &fresh], now, 300_000);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].liveness, AgentLiveness::Online);
    }

    #[test]
    fn test_forgets_removed_agents() {
        let now = Utc::now();
        let stale = agent("stale", now - Duration::minutes(10));
        let mut tracker = LivenessTracker::new();
        tracker.observe([&stale], now, 300_000);
        tracker.observe(std::iter::empty::<&Agent>(), now, 300_000);
        // Re-registering the same id reports the transition again.
        assert_eq!(tracker.observe([&stale], now, 300_000).len(), 1);
    }
}
