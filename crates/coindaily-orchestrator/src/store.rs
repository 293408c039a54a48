use crate::config::DEFAULT_ALERT_HISTORY;
use crate::monitor::{Alert, SystemMetrics};
use crate::types::{is_valid_id, Agent, Task};
use async_trait::async_trait;
use coindaily_core::{CoinDailyError, CoinDailyResult};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Write-through persistence for orchestrator state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a task.
    async fn save_task(&self, task: &Task) -> CoinDailyResult<()>;
    /// Insert or replace an agent.
    async fn save_agent(&self, agent: &Agent) -> CoinDailyResult<()>;
    /// Remove an agent; unknown ids are not an error.
    async fn delete_agent(&self, id: &str) -> CoinDailyResult<()>;
    /// Record an alert, dropping the oldest beyond the store's capacity.
    async fn save_alert(&self, alert: &Alert) -> CoinDailyResult<()>;
    /// Replace the latest metrics snapshot.
    async fn save_metrics(&self, metrics: &SystemMetrics) -> CoinDailyResult<()>;
    /// Every stored task, in no particular order.
    async fn load_tasks(&self) -> CoinDailyResult<Vec<Task>>;
    /// Every stored agent, in no particular order.
    async fn load_agents(&self) -> CoinDailyResult<Vec<Agent>>;
}

/// Process-local store. The default when no store is supplied.
#[derive(Debug)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    agents: RwLock<HashMap<String, Agent>>,
    alerts: RwLock<VecDeque<Alert>>,
    alert_capacity: usize,
    metrics: RwLock<Option<SystemMetrics>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Empty store keeping the default number of alerts.
    pub fn new() -> Self {
        Self::with_alert_capacity(DEFAULT_ALERT_HISTORY)
    }

    /// Empty store keeping at most `capacity` alerts.
    pub fn with_alert_capacity(capacity: usize) -> Self {
        Self {
            tasks: RwLock::default(),
            agents: RwLock::default(),
            alerts: RwLock::default(),
            alert_capacity: capacity,
            metrics: RwLock::default(),
        }
    }

    /// Stored alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.iter().cloned().collect()
    }

    /// The last snapshot passed to `save_metrics`.
    pub async fn latest_metrics(&self) -> Option<SystemMetrics> {
        self.metrics.read().await.clone()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn save_task(&self, task: &Task) -> CoinDailyResult<()> {
        self.tasks.write().await.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn save_agent(&self, agent: &Agent) -> CoinDailyResult<()> {
        self.agents
            .write()
            .await
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, id: &str) -> CoinDailyResult<()> {
        self.agents.write().await.remove(id);
        Ok(())
    }

    async fn save_alert(&self, alert: &Alert) -> CoinDailyResult<()> {
        let mut alerts = self.alerts.write().await;
        alerts.push_back(alert.clone());
        while alerts.len() > self.alert_capacity {
            alerts.pop_front();
        }
        Ok(())
    }

    async fn save_metrics(&self, metrics: &SystemMetrics) -> CoinDailyResult<()> {
        *self.metrics.write().await = Some(metrics.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> CoinDailyResult<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn load_agents(&self) -> CoinDailyResult<Vec<Agent>> {
        Ok(self.agents.read().await.values().cloned().collect())
    }
}

/// JSON files on disk, one per task and agent:
///
/// ```text
/// <dir>/tasks/<task id>.json
/// <dir>/agents/<agent id>.json
/// <dir>/alerts/<timestamp ms>-<alert id>.json
/// <dir>/metrics.json
/// ```
///
/// Only the newest alerts are kept; older alert files are deleted.
pub struct FileStateStore {
    dir: PathBuf,
    alert_capacity: usize,
}

impl FileStateStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn new(dir: impl Into<PathBuf>) -> CoinDailyResult<Self> {
        let dir = dir.into();
        for sub in ["tasks", "agents", "alerts"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        Ok(Self {
            dir,
            alert_capacity: DEFAULT_ALERT_HISTORY,
        })
    }

    /// Keep at most `capacity` alert files.
    pub fn with_alert_capacity(mut self, capacity: usize) -> Self {
        self.alert_capacity = capacity;
        self
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Delete the oldest alert files beyond the capacity. File names start
    /// with a zero-padded timestamp, so name order is age order.
    async fn prune_alerts(&self) -> CoinDailyResult<()> {
        let mut entries = tokio::fs::read_dir(self.dir.join("alerts")).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        if files.len() <= self.alert_capacity {
            return Ok(());
        }
        files.sort();
        let excess = files.len() - self.alert_capacity;
        for path in files.into_iter().take(excess) {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    fn entity_path(&self, kind: &str, id: &str) -> CoinDailyResult<PathBuf> {
        if !is_valid_id(id) {
            return Err(CoinDailyError::Store(format!("refusing to persist id {id:?}")));
        }
        Ok(self.dir.join(kind).join(format!("{id}.json")))
    }

    async fn write_json<T: serde::Serialize + Sync>(path: PathBuf, value: &T) -> CoinDailyResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, kind: &str) -> CoinDailyResult<Vec<T>> {
        let mut entries = tokio::fs::read_dir(self.dir.join(kind)).await?;
        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            let item = serde_json::from_str(&data).map_err(|e| {
                CoinDailyError::Store(format!("Failed to parse {}: {e}", path.display()))
            })?;
            items.push(item);
        }
        Ok(items)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_task(&self, task: &Task) -> CoinDailyResult<()> {
        Self::write_json(self.entity_path("tasks", &task.id)?, task).await
    }

    async fn save_agent(&self, agent: &Agent) -> CoinDailyResult<()> {
        Self::write_json(self.entity_path("agents", &agent.id)?, agent).await
    }

    async fn delete_agent(&self, id: &str) -> CoinDailyResult<()> {
        let path = self.entity_path("agents", id)?;
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn save_alert(&self, alert: &Alert) -> CoinDailyResult<()> {
        let millis = alert.timestamp.timestamp_millis().max(0);
        let path = self
            .dir
            .join("alerts")
            .join(format!("{millis:020}-{}.json", alert.id));
        Self::write_json(path, alert).await?;
        self.prune_alerts().await
    }

    async fn save_metrics(&self, metrics: &SystemMetrics) -> CoinDailyResult<()> {
        Self::write_json(self.dir.join("metrics.json"), metrics).await
    }

    async fn load_tasks(&self) -> CoinDailyResult<Vec<Task>> {
        self.read_all("tasks").await
    }

    async fn load_agents(&self) -> CoinDailyResult<Vec<Agent>> {
        self.read_all("agents").await
    }
}
