use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of wall-clock time for timestamps, backoff gates and liveness.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to drive backoff, timeouts
/// and heartbeat staleness deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Move the clock forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX)));
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Milliseconds elapsed from `earlier` to `later`, zero if `later` is before.
pub fn elapsed_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    u64::try_from((later - earlier).num_milliseconds()).unwrap_or(0)
}

/// `at + ms`, saturating at the maximum representable instant.
pub fn add_ms(at: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let delta = Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
    at.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance_ms(1_500);
        assert_eq!(elapsed_ms(start, clock.now()), 1_500);
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn elapsed_is_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed_ms(now, now - Duration::seconds(3)), 0);
    }

    #[test]
    fn add_ms_saturates() {
        let now = Utc::now();
        assert_eq!(add_ms(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(elapsed_ms(now, add_ms(now, 250)), 250);
    }
}
