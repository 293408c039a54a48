use crate::config::QueueConfig;
use crate::types::{AgentType, Task, TaskPriority};
use chrono::{DateTime, Utc};
use coindaily_core::{CoinDailyError, CoinDailyResult};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

/// Ordering key: highest priority first, then earliest creation, then
/// submission order.
type QueueKey = (Reverse<TaskPriority>, DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct QueueEntry {
    id: String,
    not_before: Option<DateTime<Utc>>,
}

impl QueueEntry {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Priority queue of task ids for one agent type, plus its dead-letter store.
///
/// Task bodies live in the orchestrator's task map; the queue only keeps the
/// ordering and the retry gate of each queued task.
#[derive(Debug)]
pub struct TaskQueue {
    agent_type: AgentType,
    config: QueueConfig,
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<String, QueueKey>,
    next_seq: u64,
    dead_letter: Vec<Task>,
}

impl TaskQueue {
    /// Empty queue for `agent_type`.
    pub fn new(agent_type: AgentType, config: QueueConfig) -> Self {
        Self {
            agent_type,
            config,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            dead_letter: Vec::new(),
        }
    }

    /// Task type this queue holds.
    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    /// Size limit, priorities and retry policy.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a newly submitted task, enforcing the priority filter and the
    /// size cap.
    pub fn enqueue(&mut self, task: &Task) -> CoinDailyResult<()> {
        if !self.config.accepts(task.priority) {
            return Err(CoinDailyError::PriorityNotAccepted {
                task_type: self.agent_type.to_string(),
                priority: task.priority.to_string(),
            });
        }
        if self.len() >= self.config.max_size {
            return Err(CoinDailyError::QueueSizeExceeded {
                task_type: self.agent_type.to_string(),
                size: self.len(),
                limit: self.config.max_size,
            });
        }
        self.insert(task);
        Ok(())
    }

    /// Put back a task that was already admitted once (retry, reassignment,
    /// recovery). Bypasses the priority filter and the size cap.
    pub fn requeue(&mut self, task: &Task) {
        self.insert(task);
    }

    fn insert(&mut self, task: &Task) {
        self.remove(&task.id);
        let key = (Reverse(task.priority), task.metadata.created_at, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(
            key,
            QueueEntry {
                id: task.id.clone(),
                not_before: task.metadata.not_before,
            },
        );
        self.index.insert(task.id.clone(), key);
    }

    /// Id of the first task in order whose retry gate has passed.
    pub fn peek_next(&self, now: DateTime<Utc>) -> Option<&str> {
        self.entries
            .values()
            .find(|e| e.is_eligible(now))
            .map(|e| e.id.as_str())
    }

    /// Remove and return the id [`peek_next`](Self::peek_next) would return.
    pub fn dequeue_next(&mut self, now: DateTime<Utc>) -> Option<String> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.is_eligible(now))
            .map(|(k, _)| *k)?;
        let entry = self.entries.remove(&key)?;
        self.index.remove(&entry.id);
        Some(entry.id)
    }

    /// Drop a queued task. Returns whether it was queued.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.index.remove(id) {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Queued tasks, including those still waiting out a retry delay.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued tasks that could be dequeued at `now`.
    pub fn eligible_count(&self, now: DateTime<Utc>) -> usize {
        self.entries.values().filter(|e| e.is_eligible(now)).count()
    }

    /// Queued ids in dequeue order, ignoring retry gates.
    pub fn ids(&self) -> Vec<String> {
        self.entries.values().map(|e| e.id.clone()).collect()
    }

    /// Record a task that exhausted its retries. Returns `false` when the
    /// queue does not keep a dead-letter store.
    pub fn dead_letter(&mut self, task: Task) -> bool {
        if !self.config.dead_letter_queue {
            return false;
        }
        self.dead_letter.retain(|t| t.id != task.id);
        self.dead_letter.push(task);
        true
    }

    /// Tasks that exhausted their retries, oldest first.
    pub fn dead_letter_tasks(&self) -> &[Task] {
        &self.dead_letter
    }

    /// Size of the dead-letter store.
    pub fn dead_letter_len(&self) -> usize {
        self.dead_letter.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::types::{TaskPayload, TranslationPayload};
    use chrono::Duration;

    fn queue(max_size: usize) -> TaskQueue {
        TaskQueue::new(
            AgentType::Translation,
            QueueConfig {
                name: "translation_queue".into(),
                max_size,
                process_timeout_ms: 10_000,
                retry_policy: RetryPolicy::fixed(1, 100),
                priority_levels: vec![
                    TaskPriority::Low,
                    TaskPriority::Normal,
                    TaskPriority::High,
                    TaskPriority::Urgent,
                ],
                dead_letter_queue: true,
            },
        )
    }

    fn task(id: &str, priority: TaskPriority, created_at: DateTime<Utc>) -> Task {
        Task::new(
            priority,
            TaskPayload::Translation(TranslationPayload {
                content_id: None,
                text: "Bitcoin rallies".into(),
                source_language: "en".into(),
                target_languages: vec!["sw".into()],
                market_context: None,
            }),
        )
        .with_id(id)
        .with_created_at(created_at)
    }

    #[test]
    fn test_empty_queue() {
        let q = queue(10);
        assert!(q.is_empty());
        assert!(q.peek_next(Utc::now()).is_none());
        assert_eq!(q.dead_letter_len(), 0);
    }

    #[test]
    fn test_priority_then_age_then_sequence() {
        let now = Utc::now();
        let mut q = queue(10);
        q.enqueue(&task("normal-old", TaskPriority::Normal, now - Duration::seconds(10)))
            .unwrap();
        q.enqueue(&task("normal-new", TaskPriority::Normal, now)).unwrap();
        q.enqueue(&task("urgent", TaskPriority::Urgent, now)).unwrap();
        q.enqueue(&task("normal-new-2", TaskPriority::Normal, now)).unwrap();
        q.enqueue(&task("low", TaskPriority::Low, now - Duration::hours(1)))
            .unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.dequeue_next(now)).collect();
        assert_eq!(
            order,
            vec!["urgent", "normal-old", "normal-new", "normal-new-2", "low"]
        );
    }

    #[test]
    fn test_size_limit() {
        let now = Utc::now();
        let mut q = queue(2);
        q.enqueue(&task("a", TaskPriority::Normal, now)).unwrap();
        q.enqueue(&task("b", TaskPriority::Normal, now)).unwrap();
        let err = q.enqueue(&task("c", TaskPriority::Normal, now)).unwrap_err();
        assert!(matches!(
            err,
            CoinDailyError::QueueSizeExceeded { size: 2, limit: 2, .. }
        ));
        assert_eq!(q.len(), 2);

        // re-entry bypasses the cap
        q.requeue(&task("c", TaskPriority::Normal, now));
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_priority_filter() {
        let mut q = queue(5);
        q.config.priority_levels = vec![TaskPriority::High, TaskPriority::Urgent];
        let err = q
            .enqueue(&task("low", TaskPriority::Low, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, CoinDailyError::PriorityNotAccepted { .. }));
        assert!(q.is_empty());
    }

    #[test]
    fn test_delayed_task_does_not_block() {
        let now = Utc::now();
        let mut q = queue(10);
        let mut delayed = task("delayed", TaskPriority::Urgent, now);
        delayed.metadata.not_before = Some(now + Duration::seconds(30));
        q.requeue(&delayed);
        q.enqueue(&task("ready", TaskPriority::Low, now)).unwrap();

        assert_eq!(q.len(), 2);
        assert_eq!(q.eligible_count(now), 1);
        assert_eq!(q.peek_next(now), Some("ready"));
        assert_eq!(q.dequeue_next(now).as_deref(), Some("ready"));
        assert!(q.dequeue_next(now).is_none());

        let later = now + Duration::seconds(30);
        assert_eq!(q.dequeue_next(later).as_deref(), Some("delayed"));
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let now = Utc::now();
        let mut q = queue(10);
        q.enqueue(&task("a", TaskPriority::High, now)).unwrap();
        assert_eq!(q.peek_next(now), Some("a"));
        assert_eq!(q.peek_next(now), Some("a"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_remove_and_reinsert_same_id() {
        let now = Utc::now();
        let mut q = queue(10);
        let t = task("a", TaskPriority::Normal, now);
        q.enqueue(&t).unwrap();
        q.requeue(&t);
        assert_eq!(q.len(), 1, "a task is queued at most once");
        assert!(q.remove("a"));
        assert!(!q.remove("a"));
        assert!(!q.contains("a"));
    }

    #[test]
    fn test_dead_letter_store() {
        let mut q = queue(10);
        let t = task("dead", TaskPriority::Normal, Utc::now());
        assert!(q.dead_letter(t.clone()));
        assert!(q.dead_letter(t));
        assert_eq!(q.dead_letter_len(), 1);

        q.config.dead_letter_queue = false;
        assert!(!q.dead_letter(task("other", TaskPriority::Normal, Utc::now())));
        assert_eq!(q.dead_letter_tasks()[0].id, "dead");
    }
}
