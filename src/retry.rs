use std::time::{Duration, Instant};

/// Time source behind every wait in the crate, so tests never sleep for real.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fixed-interval attempt ceiling for operations that poll the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// The target is believed to exist; keep looking for a while.
    pub fn expected() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
        }
    }

    /// Single probe; absence is a perfectly normal answer.
    pub fn best_effort() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::from_secs(1),
        }
    }

    pub fn for_expectation(expected_to_be_running: bool) -> Self {
        if expected_to_be_running {
            Self::expected()
        } else {
            Self::best_effort()
        }
    }

    /// Runs `attempt` up to the ceiling, sleeping the interval between
    /// attempts, and returns the first hit. No sleep follows the final miss.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        mut attempt: impl FnMut(u32) -> Option<T>,
    ) -> Option<T> {
        let ceiling = self.max_attempts.max(1);
        for number in 1..=ceiling {
            if let Some(found) = attempt(number) {
                return Some(found);
            }
            if number < ceiling {
                clock.sleep(self.interval);
            }
        }
        None
    }
}
