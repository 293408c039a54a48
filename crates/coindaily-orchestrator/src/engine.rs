use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{add_ms, elapsed_ms, Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::events::{EventBus, EventSeverity, OrchestratorEvent, OrchestratorEventKind};
use crate::liveness::{AgentLiveness, LivenessTracker};
use crate::monitor::{evaluate_thresholds, Alert, AlertLevel, AlertLog, QueueMetrics, SystemMetrics};
use crate::registry::AgentRegistry;
use crate::store::{InMemoryStore, StateStore};
use crate::task_queue::TaskQueue;
use crate::types::{
    is_valid_id, Agent, AgentError, AgentMetrics, AgentStatus, AgentType, Task, TaskResult,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use coindaily_core::{CoinDailyError, CoinDailyResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A task handed to an agent by [`Orchestrator::assign_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub agent_id: String,
    pub task: Task,
}

/// What [`Orchestrator::update_task_status`] did with the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    /// Failed with retries left; back in the queue after the backoff.
    Requeued {
        retry_count: u32,
        not_before: DateTime<Utc>,
    },
    /// Failed for good and kept in the dead-letter store.
    DeadLettered,
    /// Failed for good; the queue keeps no dead-letter store.
    Discarded,
}

/// Result of one liveness pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub timed_out: Vec<String>,
    pub went_offline: Vec<String>,
    pub came_online: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    count: u64,
    total: f64,
}

impl RunningMean {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }
}

/// Everything mutated by orchestrator operations. Guarded by one lock so an
/// assignment or a status change is a single atomic step.
struct State {
    tasks: HashMap<String, Task>,
    queues: HashMap<AgentType, TaskQueue>,
    registry: AgentRegistry,
    breakers: HashMap<AgentType, CircuitBreaker>,
    liveness: LivenessTracker,
    alerts: AlertLog,
    response_times: RunningMean,
    wait_times: HashMap<AgentType, RunningMean>,
}

impl State {
    fn queue_mut(&mut self, agent_type: AgentType) -> CoinDailyResult<&mut TaskQueue> {
        self.queues.get_mut(&agent_type).ok_or_else(|| missing_queue(agent_type))
    }

    fn processing_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .count()
    }
}

fn missing_queue(agent_type: AgentType) -> CoinDailyError {
    CoinDailyError::Config(format!("no queue configured for {agent_type}"))
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    state: Mutex<State>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

/// Coordinates task queues and agents.
///
/// Cloning is cheap and every clone drives the same orchestrator. Mutating
/// operations require [`start`](Self::start) to have been called; reads work
/// at any time.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Orchestrator with an in-memory store and the system clock.
    pub fn new(config: OrchestratorConfig) -> CoinDailyResult<Self> {
        let store = Arc::new(InMemoryStore::with_alert_capacity(config.monitoring.alert_history));
        Self::with_parts(config, store, Arc::new(SystemClock))
    }

    /// Orchestrator over a caller-supplied store and clock.
    pub fn with_parts(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> CoinDailyResult<Self> {
        config.validate()?;
        let queues = config
            .queues
            .iter()
            .map(|(agent_type, qc)| (*agent_type, TaskQueue::new(*agent_type, qc.clone())))
            .collect();
        let state = State {
            tasks: HashMap::new(),
            queues,
            registry: AgentRegistry::new(),
            breakers: HashMap::new(),
            liveness: LivenessTracker::new(),
            alerts: AlertLog::new(config.monitoring.alert_history),
            response_times: RunningMean::default(),
            wait_times: HashMap::new(),
        };
        let events = EventBus::new(config.monitoring.event_history);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                events,
                state: Mutex::new(state),
                running: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    /// Configuration the orchestrator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Whether `start` has run and `shutdown` has not.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn offline_threshold_ms(&self) -> u64 {
        self.inner.config.monitoring.offline_threshold_ms
    }

    fn ensure_running(&self) -> CoinDailyResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CoinDailyError::NotRunning)
        }
    }

    fn emit(&self, kind: OrchestratorEventKind, severity: EventSeverity, data: serde_json::Value) {
        self.inner
            .events
            .emit(OrchestratorEvent::new(kind, self.now(), data).with_severity(severity));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Recover persisted state and start the liveness and metrics timers.
    /// Calling it on a running orchestrator does nothing.
    pub async fn start(&self) -> CoinDailyResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let (agents, tasks) = self.recover().await?;

        let cancel = CancellationToken::new();
        let monitoring = &self.inner.config.monitoring;
        lifecycle.handles = vec![
            self.spawn_timer(cancel.clone(), monitoring.health_check_interval_ms, TimerKind::Health),
            self.spawn_timer(cancel.clone(), monitoring.metrics_interval_ms, TimerKind::Metrics),
        ];
        lifecycle.cancel = Some(cancel);
        self.inner.running.store(true, Ordering::SeqCst);

        info!(
            recovered_agents = agents,
            recovered_tasks = tasks,
            "Orchestrator started"
        );
        self.emit(
            OrchestratorEventKind::OrchestratorStarted,
            EventSeverity::Info,
            json!({ "recovered_agents": agents, "recovered_tasks": tasks }),
        );
        Ok(())
    }

    /// Stop the timers and wait for them to finish. Idempotent.
    pub async fn shutdown(&self) -> CoinDailyResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        for handle in lifecycle.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Timer task ended abnormally");
            }
        }
        info!("Orchestrator shut down");
        self.emit(
            OrchestratorEventKind::OrchestratorShutdown,
            EventSeverity::Info,
            json!({}),
        );
        Ok(())
    }

    /// Load agents and tasks from the store. Tasks that were processing go
    /// back to their queue; failed tasks refill the dead-letter store.
    async fn recover(&self) -> CoinDailyResult<(usize, usize)> {
        let agents = self.inner.store.load_agents().await?;
        let mut tasks = self.inner.store.load_tasks().await?;
        let now = self.now();
        let mut state = self.inner.state.lock().await;

        let mut agent_count = 0;
        for agent in agents {
            if !state.registry.contains(&agent.id) {
                state.registry.restore(agent);
                agent_count += 1;
            }
        }

        // Live tasks keep submission order; settled ones keep the order they
        // reached the dead-letter store in.
        tasks.sort_by_key(|t| {
            if t.status.is_terminal() {
                (true, t.metadata.updated_at)
            } else {
                (false, t.metadata.created_at)
            }
        });

        let mut task_count = 0;
        for mut task in tasks {
            if state.tasks.contains_key(&task.id) {
                continue;
            }
            let task_type = task.task_type();
            match task.status {
                TaskStatus::Completed => {}
                TaskStatus::Failed => {
                    state.queue_mut(task_type)?.dead_letter(task.clone());
                }
                TaskStatus::Queued | TaskStatus::Processing => {
                    if task.status == TaskStatus::Processing {
                        task.status = TaskStatus::Queued;
                        task.metadata.assigned_agent = None;
                        task.metadata.started_at = None;
                        task.metadata.updated_at = now;
                        self.inner.store.save_task(&task).await?;
                    }
                    state.queue_mut(task_type)?.requeue(&task);
                }
            }
            state.tasks.insert(task.id.clone(), task);
            task_count += 1;
        }
        Ok((agent_count, task_count))
    }

    fn spawn_timer(&self, cancel: CancellationToken, interval_ms: u64, kind: TimerKind) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let orchestrator = Orchestrator { inner };
                        let outcome = match kind {
                            TimerKind::Health => orchestrator.run_health_check().await.map(|_| ()),
                            TimerKind::Metrics => orchestrator.collect_metrics().await.map(|_| ()),
                        };
                        if let Err(e) = outcome {
                            warn!(timer = ?kind, error = %e, "Periodic check failed");
                        }
                    }
                }
            }
            debug!(timer = ?kind, "Timer stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Register an agent. Returns `Ok(false)` when the id is taken.
    pub async fn register_agent(&self, agent: Agent) -> CoinDailyResult<bool> {
        self.ensure_running()?;
        let mut state = self.inner.state.lock().await;
        if !state.registry.register(agent.clone())? {
            return Ok(false);
        }
        if let Err(e) = self.inner.store.save_agent(&agent).await {
            state.registry.unregister(&agent.id);
            return Err(e);
        }
        info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Agent registered");
        self.emit(
            OrchestratorEventKind::AgentRegistered,
            EventSeverity::Info,
            json!({ "agent_id": agent.id, "agent_type": agent.agent_type }),
        );
        Ok(true)
    }

    /// Remove an agent. Tasks it was processing return to their queue.
    pub async fn unregister_agent(&self, id: &str) -> CoinDailyResult<bool> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        if !state.registry.contains(id) {
            return Ok(false);
        }
        self.inner.store.delete_agent(id).await?;
        let Some((agent, in_flight)) = state.registry.unregister(id) else {
            return Ok(false);
        };
        state.liveness.forget(id);

        for task_id in in_flight {
            let Some(mut task) = state.tasks.get(&task_id).cloned() else {
                continue;
            };
            task.status = TaskStatus::Queued;
            task.metadata.assigned_agent = None;
            task.metadata.started_at = None;
            task.metadata.updated_at = now;
            let task_type = task.task_type();
            if let Some(breaker) = state.breakers.get_mut(&task_type) {
                if breaker.abandon_trial(&task.id) {
                    debug!(task_id = %task.id, task_type = %task_type, "Circuit trial abandoned");
                }
            }
            state.queue_mut(task_type)?.requeue(&task);
            state.tasks.insert(task.id.clone(), task.clone());
            self.inner.store.save_task(&task).await?;
            info!(task_id = %task.id, agent_id = %id, "Task reassigned to queue");
            self.emit(
                OrchestratorEventKind::TaskReassigned,
                EventSeverity::Warning,
                json!({ "task_id": task.id, "agent_id": id, "task_type": task_type }),
            );
        }

        info!(agent_id = %id, "Agent unregistered");
        self.emit(
            OrchestratorEventKind::AgentUnregistered,
            EventSeverity::Info,
            json!({ "agent_id": id, "agent_type": agent.agent_type }),
        );
        Ok(true)
    }

    /// Agent by id.
    pub async fn get_agent(&self, id: &str) -> Option<Agent> {
        self.inner.state.lock().await.registry.get(id).cloned()
    }

    /// All registered agents, sorted by id.
    pub async fn get_agents(&self) -> Vec<Agent> {
        let state = self.inner.state.lock().await;
        let mut agents: Vec<Agent> = state.registry.agents().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Record a heartbeat. Returns `Ok(false)` for unknown agents.
    pub async fn update_agent_heartbeat(&self, id: &str, timestamp: DateTime<Utc>) -> CoinDailyResult<bool> {
        let mut state = self.inner.state.lock().await;
        if !state.registry.heartbeat(id, timestamp) {
            return Ok(false);
        }
        if let Some(agent) = state.registry.get(id) {
            self.inner.store.save_agent(agent).await?;
        }
        Ok(true)
    }

    /// Set an agent to `Idle` or `Error`. Other statuses are derived.
    pub async fn update_agent_status(&self, id: &str, status: AgentStatus) -> CoinDailyResult<bool> {
        let mut state = self.inner.state.lock().await;
        if !state.registry.set_status(id, status)? {
            return Ok(false);
        }
        if let Some(agent) = state.registry.get(id) {
            self.inner.store.save_agent(agent).await?;
        }
        info!(agent_id = %id, status = %status, "Agent status updated");
        Ok(true)
    }

    /// Agents whose last heartbeat is older than the offline threshold.
    pub async fn get_offline_agents(&self) -> Vec<Agent> {
        let now = self.now();
        let state = self.inner.state.lock().await;
        state.registry.offline_agents(now, self.offline_threshold_ms())
    }

    /// Derived online/offline state of an agent.
    pub async fn agent_liveness(&self, id: &str) -> Option<AgentLiveness> {
        let now = self.now();
        let state = self.inner.state.lock().await;
        state.registry.liveness(id, now, self.offline_threshold_ms())
    }

    /// Metrics snapshot of an agent.
    pub async fn get_agent_metrics(&self, id: &str) -> Option<AgentMetrics> {
        self.inner.state.lock().await.registry.metrics(id)
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Validate and enqueue a task. Returns its id.
    pub async fn queue_task(&self, mut task: Task) -> CoinDailyResult<String> {
        self.ensure_running()?;
        if !is_valid_id(&task.id) {
            return Err(CoinDailyError::InvalidTask(format!("malformed task id {:?}", task.id)));
        }
        let now = self.now();
        let task_type = task.task_type();
        let mut state = self.inner.state.lock().await;

        if state.tasks.get(&task.id).is_some_and(|t| !t.status.is_terminal()) {
            return Err(CoinDailyError::InvalidTask(format!(
                "task {} is already queued or processing",
                task.id
            )));
        }

        let queue = state.queue_mut(task_type)?;
        let max_retries = *task
            .metadata
            .max_retries
            .get_or_insert(queue.config().retry_policy.max_retries);
        if task.metadata.retry_count > max_retries {
            return Err(CoinDailyError::InvalidTask(format!(
                "task {} has retry_count {} above max_retries {max_retries}",
                task.id, task.metadata.retry_count
            )));
        }
        task.status = TaskStatus::Queued;
        task.result = None;
        task.metadata.updated_at = now;
        task.metadata.assigned_agent = None;
        task.metadata.started_at = None;
        task.metadata.not_before = None;

        if let Err(e) = queue.enqueue(&task) {
            if let CoinDailyError::QueueSizeExceeded { size, limit, .. } = &e {
                let context = json!({ "task_type": task_type, "size": size, "limit": limit });
                self.emit(OrchestratorEventKind::QueueOverflow, EventSeverity::Error, context.clone());
                if let Err(store_err) = self
                    .raise_alert(&mut state, format!("Queue overflow for {task_type}"), AlertLevel::Error, context)
                    .await
                {
                    warn!(error = %store_err, "Failed to persist overflow alert");
                }
            }
            warn!(task_id = %task.id, task_type = %task_type, error = %e, "Task rejected");
            return Err(e);
        }

        if let Err(e) = self.inner.store.save_task(&task).await {
            state.queue_mut(task_type)?.remove(&task.id);
            return Err(e);
        }
        info!(task_id = %task.id, task_type = %task_type, priority = %task.priority, "Task queued");
        self.emit(
            OrchestratorEventKind::TaskQueued,
            EventSeverity::Info,
            json!({ "task_id": task.id, "task_type": task_type, "priority": task.priority }),
        );
        let id = task.id.clone();
        state.tasks.insert(id.clone(), task);
        Ok(id)
    }

    /// Task by id, in whatever state it is in.
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(id).cloned()
    }

    /// The task [`assign_task`](Self::assign_task) would hand out next for
    /// `task_type`, without assigning it.
    pub async fn get_next_task(&self, task_type: AgentType) -> Option<Task> {
        let now = self.now();
        let state = self.inner.state.lock().await;
        let id = state.queues.get(&task_type)?.peek_next(now)?;
        state.tasks.get(id).cloned()
    }

    /// Hand the next eligible task of `task_type` to the best available agent.
    pub async fn assign_task(&self, task_type: AgentType) -> CoinDailyResult<Option<TaskAssignment>> {
        self.ensure_running()?;
        let now = self.now();
        let mut state = self.inner.state.lock().await;

        if state.processing_count() >= self.inner.config.performance.max_concurrent_tasks {
            debug!(task_type = %task_type, "Global concurrency limit reached");
            return Ok(None);
        }
        let Some(agent_id) = state
            .registry
            .select(task_type, now, self.offline_threshold_ms())
            .map(str::to_string)
        else {
            return Ok(None);
        };
        let Some(next_id) = state.queue_mut(task_type)?.peek_next(now).map(str::to_string) else {
            return Ok(None);
        };
        if self.inner.config.performance.enable_circuit_breaker
            && !state.breakers.entry(task_type).or_default().allow(now, &next_id)
        {
            debug!(task_type = %task_type, "Circuit open, assignment skipped");
            return Ok(None);
        }
        let Some(task_id) = state.queue_mut(task_type)?.dequeue_next(now) else {
            return Ok(None);
        };
        let Some(mut task) = state.tasks.get(&task_id).cloned() else {
            return Ok(None);
        };

        task.status = TaskStatus::Processing;
        task.metadata.assigned_agent = Some(agent_id.clone());
        task.metadata.started_at = Some(now);
        task.metadata.not_before = None;
        task.metadata.updated_at = now;
        state.registry.claim(&agent_id, &task_id);
        state
            .wait_times
            .entry(task_type)
            .or_default()
            .record(elapsed_ms(task.metadata.created_at, now) as f64);
        state.tasks.insert(task_id.clone(), task.clone());

        self.inner.store.save_task(&task).await?;
        if let Some(agent) = state.registry.get(&agent_id) {
            self.inner.store.save_agent(agent).await?;
        }
        info!(task_id = %task_id, agent_id = %agent_id, task_type = %task_type, "Task assigned");
        self.emit(
            OrchestratorEventKind::TaskAssigned,
            EventSeverity::Info,
            json!({ "task_id": task_id, "agent_id": agent_id, "task_type": task_type }),
        );
        Ok(Some(TaskAssignment { agent_id, task }))
    }

    /// Report the outcome of a task. Only `Completed` and `Failed` may be
    /// requested. A failure with retries left re-enqueues the task in the
    /// same step, so it is never observed as failed.
    pub async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<TaskResult>,
    ) -> CoinDailyResult<Option<TaskOutcome>> {
        self.ensure_running()?;
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let Some(task) = state.tasks.get(id).cloned() else {
            return Ok(None);
        };
        if task.status.is_terminal() || !status.is_terminal() {
            return Err(CoinDailyError::InvalidTransition {
                task_id: id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }
        self.settle(&mut state, task, status, result, now).await.map(Some)
    }

    async fn settle(
        &self,
        state: &mut State,
        mut task: Task,
        status: TaskStatus,
        result: Option<TaskResult>,
        now: DateTime<Utc>,
    ) -> CoinDailyResult<TaskOutcome> {
        let task_type = task.task_type();
        let was_processing = task.status == TaskStatus::Processing;
        if task.status == TaskStatus::Queued {
            state.queue_mut(task_type)?.remove(&task.id);
        }
        let agent_id = if was_processing {
            task.metadata.assigned_agent.clone()
        } else {
            None
        };
        if let Some(agent_id) = &agent_id {
            state.registry.release(agent_id, &task.id);
        }
        let breaker_enabled = was_processing && self.inner.config.performance.enable_circuit_breaker;
        task.metadata.updated_at = now;

        let outcome = if status == TaskStatus::Completed {
            let result = result.unwrap_or_default();
            let processing_time_ms = result
                .metrics
                .as_ref()
                .map(|m| m.processing_time_ms)
                .or_else(|| task.metadata.started_at.map(|s| elapsed_ms(s, now)))
                .unwrap_or(0);
            if let Some(agent_id) = &agent_id {
                state.registry.record_success(agent_id, processing_time_ms);
            }
            state.response_times.record(processing_time_ms as f64);
            if breaker_enabled {
                state.breakers.entry(task_type).or_default().record_success();
            }
            task.status = TaskStatus::Completed;
            task.result = Some(result);
            info!(task_id = %task.id, task_type = %task_type, processing_time_ms, "Task completed");
            self.emit(
                OrchestratorEventKind::TaskCompleted,
                EventSeverity::Info,
                json!({ "task_id": task.id, "task_type": task_type, "agent_id": agent_id, "processing_time_ms": processing_time_ms }),
            );
            TaskOutcome::Completed
        } else {
            let result = result.unwrap_or_else(|| TaskResult::failure("Task failed"));
            let message = result.error.clone().unwrap_or_else(|| "Task failed".to_string());
            if let Some(agent_id) = &agent_id {
                state.registry.record_failure(
                    agent_id,
                    AgentError {
                        message: message.clone(),
                        timestamp: now,
                        task_id: task.id.clone(),
                    },
                );
            }
            if breaker_enabled && state.breakers.entry(task_type).or_default().record_failure(now) {
                warn!(task_type = %task_type, "Circuit opened");
                self.emit(
                    OrchestratorEventKind::CircuitOpened,
                    EventSeverity::Warning,
                    json!({ "task_type": task_type }),
                );
            }
            task.result = Some(result);
            warn!(task_id = %task.id, task_type = %task_type, retry_count = task.metadata.retry_count, error = %message, "Task attempt failed");
            self.emit(
                OrchestratorEventKind::TaskFailed,
                EventSeverity::Warning,
                json!({ "task_id": task.id, "task_type": task_type, "agent_id": agent_id, "error": message, "retry_count": task.metadata.retry_count }),
            );

            let queue = state.queue_mut(task_type)?;
            if task.has_retries_left() {
                let delay_ms = queue.config().retry_policy.delay_ms(task.metadata.retry_count);
                let not_before = add_ms(now, delay_ms);
                task.metadata.retry_count += 1;
                task.metadata.not_before = Some(not_before);
                task.metadata.assigned_agent = None;
                task.metadata.started_at = None;
                task.status = TaskStatus::Queued;
                queue.requeue(&task);
                info!(task_id = %task.id, retry_count = task.metadata.retry_count, delay_ms, "Task requeued");
                self.emit(
                    OrchestratorEventKind::TaskRequeued,
                    EventSeverity::Info,
                    json!({ "task_id": task.id, "task_type": task_type, "retry_count": task.metadata.retry_count, "delay_ms": delay_ms }),
                );
                TaskOutcome::Requeued {
                    retry_count: task.metadata.retry_count,
                    not_before,
                }
            } else {
                task.status = TaskStatus::Failed;
                task.metadata.not_before = None;
                if queue.dead_letter(task.clone()) {
                    error!(task_id = %task.id, task_type = %task_type, "Task moved to dead-letter queue");
                    self.emit(
                        OrchestratorEventKind::TaskDeadLettered,
                        EventSeverity::Error,
                        json!({ "task_id": task.id, "task_type": task_type, "retry_count": task.metadata.retry_count }),
                    );
                    TaskOutcome::DeadLettered
                } else {
                    error!(task_id = %task.id, task_type = %task_type, "Task failed permanently");
                    TaskOutcome::Discarded
                }
            }
        };

        state.tasks.insert(task.id.clone(), task.clone());
        self.inner.store.save_task(&task).await?;
        if let Some(agent) = agent_id.as_deref().and_then(|id| state.registry.get(id)) {
            self.inner.store.save_agent(agent).await?;
        }
        Ok(outcome)
    }

    /// Fail every processing task that ran past its timeout. Returns the
    /// ids of the tasks that timed out.
    pub async fn enforce_timeouts(&self) -> CoinDailyResult<Vec<String>> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let mut expired: Vec<(Task, u64)> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Processing)
            .filter_map(|t| {
                let started_at = t.metadata.started_at?;
                let limit_ms = t
                    .metadata
                    .timeout_ms
                    .or_else(|| {
                        t.metadata
                            .assigned_agent
                            .as_deref()
                            .and_then(|a| state.registry.get(a))
                            .map(|a| a.config.timeout_ms)
                    })
                    .or_else(|| state.queues.get(&t.task_type()).map(|q| q.config().process_timeout_ms))?;
                (elapsed_ms(started_at, now) > limit_ms).then(|| (t.clone(), limit_ms))
            })
            .collect();
        expired.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut timed_out = Vec::with_capacity(expired.len());
        for (task, limit_ms) in expired {
            warn!(task_id = %task.id, timeout_ms = limit_ms, "Task timed out");
            let id = task.id.clone();
            let result = TaskResult::failure(format!("Task exceeded timeout of {limit_ms}ms"));
            self.settle(&mut state, task, TaskStatus::Failed, Some(result), now).await?;
            timed_out.push(id);
        }
        Ok(timed_out)
    }

    /// Tasks of `task_type` that exhausted their retries, oldest first.
    pub async fn get_dead_letter_tasks(&self, task_type: AgentType) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(&task_type)
            .map(|q| q.dead_letter_tasks().to_vec())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    /// Enforce timeouts and report agents whose liveness changed since the
    /// previous check.
    pub async fn run_health_check(&self) -> CoinDailyResult<HealthReport> {
        let timed_out = self.enforce_timeouts().await?;
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let State {
            registry, liveness, ..
        } = &mut *state;
        let transitions = liveness.observe(registry.agents(), now, self.offline_threshold_ms());

        let mut report = HealthReport {
            timed_out,
            ..HealthReport::default()
        };
        for t in transitions {
            let data = json!({
                "agent_id": t.agent_id,
                "agent_type": t.agent_type,
                "last_heartbeat": t.last_heartbeat,
            });
            match t.liveness {
                AgentLiveness::Offline => {
                    self.emit(OrchestratorEventKind::AgentOffline, EventSeverity::Warning, data.clone());
                    self.raise_alert(
                        &mut state,
                        format!("Agent {} is offline", t.agent_id),
                        AlertLevel::Warning,
                        data,
                    )
                    .await?;
                    report.went_offline.push(t.agent_id);
                }
                AgentLiveness::Online => {
                    info!(agent_id = %t.agent_id, "Agent back online");
                    self.emit(OrchestratorEventKind::AgentOnline, EventSeverity::Info, data);
                    report.came_online.push(t.agent_id);
                }
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Metrics & alerts
    // -----------------------------------------------------------------------

    /// Live counters for one queue.
    pub async fn get_queue_metrics(&self, task_type: AgentType) -> QueueMetrics {
        let now = self.now();
        let state = self.inner.state.lock().await;
        queue_metrics(&state, task_type, now)
    }

    /// Aggregate counters across every queue and agent.
    pub async fn get_system_metrics(&self) -> SystemMetrics {
        let now = self.now();
        let state = self.inner.state.lock().await;
        self.system_metrics(&state, now)
    }

    fn system_metrics(&self, state: &State, now: DateTime<Utc>) -> SystemMetrics {
        let mut completed = 0usize;
        let mut failed = 0usize;
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                _ => {}
            }
        }
        let finished = completed + failed;
        let error_rate = if finished == 0 {
            0.0
        } else {
            failed as f64 / finished as f64
        };
        let queue_metrics: BTreeMap<AgentType, QueueMetrics> = state
            .queues
            .keys()
            .map(|t| (*t, queue_metrics(state, *t, now)))
            .collect();
        SystemMetrics {
            total_tasks: state.tasks.len(),
            active_tasks: state.processing_count(),
            total_agents: state.registry.len(),
            active_agents: state.registry.online_count(now, self.offline_threshold_ms()),
            average_response_time: state.response_times.mean(),
            error_rate,
            queue_metrics,
            timestamp: Some(now),
        }
    }

    /// Snapshot metrics, raise alerts for breached thresholds and persist
    /// the snapshot. Run by the metrics timer.
    pub async fn collect_metrics(&self) -> CoinDailyResult<SystemMetrics> {
        let now = self.now();
        let mut state = self.inner.state.lock().await;
        let metrics = self.system_metrics(&state, now);
        for candidate in evaluate_thresholds(&metrics, &self.inner.config.monitoring.alert_thresholds) {
            self.raise_alert(&mut state, candidate.message, candidate.level, candidate.context)
                .await?;
        }
        self.inner.store.save_metrics(&metrics).await?;
        debug!(
            total_tasks = metrics.total_tasks,
            active_tasks = metrics.active_tasks,
            error_rate = metrics.error_rate,
            "Metrics collected"
        );
        Ok(metrics)
    }

    /// Record and log an operational alert.
    pub async fn trigger_alert(
        &self,
        message: impl Into<String>,
        level: AlertLevel,
        context: serde_json::Value,
    ) -> CoinDailyResult<Alert> {
        let mut state = self.inner.state.lock().await;
        self.raise_alert(&mut state, message.into(), level, context).await
    }

    async fn raise_alert(
        &self,
        state: &mut State,
        message: String,
        level: AlertLevel,
        context: serde_json::Value,
    ) -> CoinDailyResult<Alert> {
        let alert = Alert::new(message, level, context, self.now());
        match level {
            AlertLevel::Warning => warn!(alert_id = %alert.id, context = %alert.context, "{}", alert.message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(alert_id = %alert.id, level = %level, context = %alert.context, "{}", alert.message);
            }
        }
        state.alerts.push(alert.clone());
        let severity = match level {
            AlertLevel::Warning => EventSeverity::Warning,
            AlertLevel::Error => EventSeverity::Error,
            AlertLevel::Critical => EventSeverity::Critical,
        };
        self.emit(
            OrchestratorEventKind::AlertRaised,
            severity,
            json!({ "alert_id": alert.id, "message": alert.message, "level": level, "context": alert.context }),
        );
        self.inner.store.save_alert(&alert).await?;
        Ok(alert)
    }

    /// Most recent alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.state.lock().await.alerts.all()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<OrchestratorEvent> {
        self.inner.events.recent(limit)
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Health,
    Metrics,
}

fn queue_metrics(state: &State, task_type: AgentType, now: DateTime<Utc>) -> QueueMetrics {
    let Some(queue) = state.queues.get(&task_type) else {
        return QueueMetrics::default();
    };
    let mut metrics = QueueMetrics {
        queue_size: queue.len(),
        pending_tasks: queue.eligible_count(now),
        dead_letter_tasks: queue.dead_letter_len(),
        average_wait_time_ms: state
            .wait_times
            .get(&task_type)
            .map(RunningMean::mean)
            .unwrap_or(0.0),
        ..QueueMetrics::default()
    };
    metrics.delayed_tasks = metrics.queue_size - metrics.pending_tasks;
    for task in state.tasks.values().filter(|t| t.task_type() == task_type) {
        match task.status {
            TaskStatus::Processing => metrics.processing_tasks += 1,
            TaskStatus::Completed => metrics.completed_tasks += 1,
            TaskStatus::Failed => metrics.failed_tasks += 1,
            TaskStatus::Queued => {}
        }
    }
    metrics
}
