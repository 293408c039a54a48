use crate::clock::add_ms;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failed attempts that open the circuit.
pub const FAILURE_THRESHOLD: u32 = 5;
/// How long an open circuit rejects assignments.
pub const OPEN_DURATION_MS: u64 = 30_000;

/// Breaker position as seen at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-type circuit breaker gating task assignment.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
    /// Task admitted as the half-open trial.
    trial: Option<String>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    /// A closed breaker.
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            trial: None,
        }
    }

    /// Current position; an open circuit past its deadline reads as half-open.
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match (self.state, self.open_until) {
            (CircuitState::Open, Some(until)) if now >= until => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Whether `task_id` may be assigned. In the half-open state only one
    /// trial task is admitted until its outcome is recorded or it is
    /// abandoned.
    pub fn allow(&mut self, now: DateTime<Utc>, task_id: &str) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                self.state = CircuitState::HalfOpen;
                if self.trial.is_some() {
                    false
                } else {
                    self.trial = Some(task_id.to_string());
                    true
                }
            }
        }
    }

    /// Close the circuit.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.trial = None;
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let reopen = self.state(now) == CircuitState::HalfOpen;
        if reopen || (self.state == CircuitState::Closed && self.consecutive_failures >= FAILURE_THRESHOLD) {
            self.state = CircuitState::Open;
            self.open_until = Some(add_ms(now, OPEN_DURATION_MS));
            self.trial = None;
            return true;
        }
        false
    }

    /// Free the trial slot when `task_id` holds it and left processing
    /// without an outcome. Returns whether the slot was freed.
    pub fn abandon_trial(&mut self, task_id: &str) -> bool {
        if self.trial.as_deref() == Some(task_id) {
            self.trial = None;
            true
        } else {
            false
        }
    }

    /// Failed attempts since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_opens_after_threshold() {
        let now = Utc::now();
        let mut cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            assert!(!cb.record_failure(now));
        }
        assert!(cb.allow(now, "t"));
        assert!(cb.record_failure(now));
        assert_eq!(cb.state(now), CircuitState::Open);
        assert!(!cb.allow(now, "t"));
    }

    #[test]
    fn test_success_resets_count() {
        let now = Utc::now();
        let mut cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            cb.record_failure(now);
        }
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(!cb.record_failure(now));
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let now = Utc::now();
        let mut cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record_failure(now);
        }
        let later = now + Duration::milliseconds(OPEN_DURATION_MS as i64);
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert!(cb.allow(later, "trial-1"));
        assert!(!cb.allow(later, "trial-2"));

        cb.record_success();
        assert_eq!(cb.state(later), CircuitState::Closed);
        assert!(cb.allow(later, "trial-2"));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let now = Utc::now();
        let mut cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record_failure(now);
        }
        let later = now + Duration::seconds(31);
        assert!(cb.allow(later, "t"));
        assert!(cb.record_failure(later));
        assert_eq!(cb.state(later), CircuitState::Open);
        assert!(!cb.allow(later + Duration::seconds(29), "t"));
        assert!(cb.allow(later + Duration::seconds(30), "t"));
    }

    #[test]
    fn test_abandoned_trial_frees_slot() {
        let now = Utc::now();
        let mut cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record_failure(now);
        }
        let later = now + Duration::seconds(30);
        assert!(cb.allow(later, "trial-1"));
        assert!(!cb.allow(later, "trial-2"));

        assert!(!cb.abandon_trial("other"));
        assert!(!cb.allow(later, "trial-2"));
        assert!(cb.abandon_trial("trial-1"));
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert!(cb.allow(later, "trial-2"));
    }
}
