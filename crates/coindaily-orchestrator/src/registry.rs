use crate::liveness::AgentLiveness;
use crate::types::{is_valid_id, Agent, AgentError, AgentMetrics, AgentStatus, AgentType};
use chrono::{DateTime, Utc};
use coindaily_core::{CoinDailyError, CoinDailyResult};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct AgentEntry {
    agent: Agent,
    in_flight: BTreeSet<String>,
}

impl AgentEntry {
    fn capacity(&self) -> usize {
        self.agent.config.max_concurrent_tasks as usize
    }

    /// Busy/Idle follow the in-flight count; Error is sticky until cleared.
    fn refresh_status(&mut self) {
        match self.agent.status {
            AgentStatus::Idle if self.in_flight.len() >= self.capacity() => {
                self.agent.status = AgentStatus::Busy;
            }
            AgentStatus::Busy if self.in_flight.len() < self.capacity() => {
                self.agent.status = AgentStatus::Idle;
            }
            _ => {}
        }
    }
}

/// Registered agents and the tasks each one is currently processing.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentEntry>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent. Returns `Ok(false)` when the id is already registered,
    /// leaving the existing entry untouched.
    pub fn register(&mut self, agent: Agent) -> CoinDailyResult<bool> {
        if !is_valid_id(&agent.id) {
            return Err(CoinDailyError::InvalidAgent(format!(
                "malformed agent id {:?}",
                agent.id
            )));
        }
        if agent.status == AgentStatus::Offline {
            return Err(CoinDailyError::InvalidAgent(format!(
                "agent {} cannot be registered offline",
                agent.id
            )));
        }
        if agent.config.max_concurrent_tasks == 0 {
            return Err(CoinDailyError::InvalidAgent(format!(
                "agent {} must accept at least one concurrent task",
                agent.id
            )));
        }
        if self.agents.contains_key(&agent.id) {
            warn!(agent_id = %agent.id, "Agent already registered");
            return Ok(false);
        }
        self.agents.insert(
            agent.id.clone(),
            AgentEntry {
                agent,
                in_flight: BTreeSet::new(),
            },
        );
        Ok(true)
    }

    /// Restore an agent loaded from the store without validation.
    pub fn restore(&mut self, mut agent: Agent) {
        if agent.status == AgentStatus::Busy || agent.status == AgentStatus::Offline {
            agent.status = AgentStatus::Idle;
        }
        self.agents.insert(
            agent.id.clone(),
            AgentEntry {
                agent,
                in_flight: BTreeSet::new(),
            },
        );
    }

    /// Remove an agent, returning it together with the ids it was processing.
    pub fn unregister(&mut self, id: &str) -> Option<(Agent, Vec<String>)> {
        self.agents
            .remove(id)
            .map(|entry| (entry.agent, entry.in_flight.into_iter().collect()))
    }

    /// Agent by id.
    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id).map(|e| &e.agent)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered agent count.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Every registered agent, in no particular order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values().map(|e| &e.agent)
    }

    /// Set the last heartbeat. Returns `false` for unknown agents.
    pub fn heartbeat(&mut self, id: &str, timestamp: DateTime<Utc>) -> bool {
        match self.agents.get_mut(id) {
            Some(entry) => {
                entry.agent.last_heartbeat = timestamp;
                debug!(agent_id = %id, "Heartbeat");
                true
            }
            None => false,
        }
    }

    /// Only `Idle` and `Error` may be set by callers; `Busy` and `Offline`
    /// are derived.
    pub fn set_status(&mut self, id: &str, status: AgentStatus) -> CoinDailyResult<bool> {
        if !matches!(status, AgentStatus::Idle | AgentStatus::Error) {
            return Err(CoinDailyError::InvalidAgentStatus(status.to_string()));
        }
        let Some(entry) = self.agents.get_mut(id) else {
            return Ok(false);
        };
        entry.agent.status = status;
        entry.refresh_status();
        Ok(true)
    }

    /// Ids of the tasks an agent is processing.
    pub fn in_flight(&self, id: &str) -> Vec<String> {
        self.agents
            .get(id)
            .map(|e| e.in_flight.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Derived liveness of one agent.
    pub fn liveness(&self, id: &str, now: DateTime<Utc>, threshold_ms: u64) -> Option<AgentLiveness> {
        self.get(id)
            .map(|agent| AgentLiveness::of(agent, now, threshold_ms))
    }

    /// Agents past the staleness threshold, sorted by id.
    pub fn offline_agents(&self, now: DateTime<Utc>, threshold_ms: u64) -> Vec<Agent> {
        let mut offline: Vec<Agent> = self
            .agents()
            .filter(|a| AgentLiveness::of(a, now, threshold_ms) == AgentLiveness::Offline)
            .cloned()
            .collect();
        offline.sort_by(|a, b| a.id.cmp(&b.id));
        offline
    }

    /// Agents within the staleness threshold.
    pub fn online_count(&self, now: DateTime<Utc>, threshold_ms: u64) -> usize {
        self.agents()
            .filter(|a| AgentLiveness::of(a, now, threshold_ms) == AgentLiveness::Online)
            .count()
    }

    /// Best agent able to take one more task of `agent_type`: idle, online
    /// and below capacity; lowest average processing time, then fewest
    /// in-flight tasks, then id.
    pub fn select(&self, agent_type: AgentType, now: DateTime<Utc>, threshold_ms: u64) -> Option<&str> {
        self.agents
            .values()
            .filter(|e| e.agent.agent_type == agent_type)
            .filter(|e| e.agent.status == AgentStatus::Idle)
            .filter(|e| e.in_flight.len() < e.capacity())
            .filter(|e| AgentLiveness::of(&e.agent, now, threshold_ms) == AgentLiveness::Online)
            .min_by(|a, b| {
                a.agent
                    .metrics
                    .average_processing_time
                    .total_cmp(&b.agent.metrics.average_processing_time)
                    .then(a.in_flight.len().cmp(&b.in_flight.len()))
                    .then(a.agent.id.cmp(&b.agent.id))
            })
            .map(|e| e.agent.id.as_str())
    }

    /// Track `task_id` as in flight on `agent_id`.
    pub fn claim(&mut self, agent_id: &str, task_id: &str) -> bool {
        let Some(entry) = self.agents.get_mut(agent_id) else {
            return false;
        };
        entry.in_flight.insert(task_id.to_string());
        entry.refresh_status();
        true
    }

    /// Stop tracking `task_id` on `agent_id`.
    pub fn release(&mut self, agent_id: &str, task_id: &str) -> bool {
        let Some(entry) = self.agents.get_mut(agent_id) else {
            return false;
        };
        let removed = entry.in_flight.remove(task_id);
        entry.refresh_status();
        removed
    }

    /// Count a successful task and fold its duration into the running mean.
    pub fn record_success(&mut self, agent_id: &str, processing_time_ms: u64) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            let m = &mut entry.agent.metrics;
            m.tasks_processed += 1;
            m.tasks_successful += 1;
            let n = m.tasks_successful as f64;
            m.average_processing_time += (processing_time_ms as f64 - m.average_processing_time) / n;
        }
    }

    /// Count a failed attempt and remember its error.
    pub fn record_failure(&mut self, agent_id: &str, error: AgentError) {
        if let Some(entry) = self.agents.get_mut(agent_id) {
            let m = &mut entry.agent.metrics;
            m.tasks_processed += 1;
            m.tasks_failed += 1;
            m.last_error = Some(error);
        }
    }

    /// Metrics snapshot of an agent.
    pub fn metrics(&self, id: &str) -> Option<AgentMetrics> {
        self.get(id).map(|a| a.metrics.clone())
    }
}
