//! Bounded randomized-backoff retry policy for Busy/Locked contention.
//!
//! The timeout is a per-command wall-clock budget measured against a start
//! instant, not a per-attempt limit. Time and sleeping go through the
//! [`Clock`] trait so the policy is testable without real delays.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source and suspension point used by retry loops.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Real wall-clock time and `thread::sleep`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Upper bound of the randomized backoff delay, matching the 1-150ms
/// range used for lock contention.
pub const MAX_BACKOFF: Duration = Duration::from_millis(150);

/// A bounded retry policy: total wall-clock budget plus backoff range.
#[derive(Clone)]
pub struct RetryPolicy {
    timeout: Duration,
    max_backoff: Duration,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        RetryPolicy {
            timeout,
            max_backoff: MAX_BACKOFF,
            clock,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts a new per-command budget.
    pub fn begin(&self) -> RetryBudget {
        RetryBudget {
            policy: self.clone(),
            started: self.clock.now(),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("timeout", &self.timeout)
            .field("max_backoff", &self.max_backoff)
            .finish()
    }
}

/// One command's running retry budget.
pub struct RetryBudget {
    policy: RetryPolicy,
    started: Instant,
}

impl RetryBudget {
    /// Sleeps a random 1ms..max backoff and reports whether the caller may
    /// retry. Returns `false` once the accumulated wall-clock time exceeds
    /// the budget; the caller must then surface the contention error.
    pub fn backoff(&self) -> bool {
        let clock = &self.policy.clock;
        if clock.now().duration_since(self.started) > self.policy.timeout {
            return false;
        }
        let millis = rand::thread_rng().gen_range(1..=self.policy.max_backoff.as_millis() as u64);
        clock.sleep(Duration::from_millis(millis));
        true
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use super::*;
    use parking_lot::Mutex;

    /// Deterministic clock: every sleep advances virtual time.
    pub struct FakeClock {
        now: Mutex<Instant>,
        pub slept: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        pub fn new() -> Self {
            FakeClock {
                now: Mutex::new(Instant::now()),
                slept: Mutex::new(Vec::new()),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }

        fn sleep(&self, duration: Duration) {
            *self.now.lock() += duration;
            self.slept.lock().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_clock::FakeClock;
    use super::*;

    #[test]
    fn budget_expires_without_real_time() {
        let clock = Arc::new(FakeClock::new());
        let policy = RetryPolicy::with_clock(Duration::from_millis(500), clock.clone());
        let budget = policy.begin();

        let mut attempts = 0usize;
        while budget.backoff() {
            attempts += 1;
            assert!(attempts < 1000, "budget never expired");
        }
        // At least 500ms of virtual sleep happened before giving up.
        let total: Duration = clock.slept.lock().iter().sum();
        assert!(total >= Duration::from_millis(500));
    }

    #[test]
    fn backoff_delays_stay_in_range() {
        let clock = Arc::new(FakeClock::new());
        let policy = RetryPolicy::with_clock(Duration::from_secs(60), clock.clone());
        let budget = policy.begin();
        for _ in 0..50 {
            assert!(budget.backoff());
        }
        for d in clock.slept.lock().iter() {
            assert!(*d >= Duration::from_millis(1));
            assert!(*d <= MAX_BACKOFF);
        }
    }

    #[test]
    fn zero_timeout_fails_immediately_after_first_check() {
        let clock = Arc::new(FakeClock::new());
        let policy = RetryPolicy::with_clock(Duration::ZERO, clock.clone());
        let budget = policy.begin();
        // First call may sleep once (elapsed is still zero), second must stop.
        let _ = budget.backoff();
        assert!(!budget.backoff());
    }
}
