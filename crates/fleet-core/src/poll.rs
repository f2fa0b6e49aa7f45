//! Deadline-bounded polling.
//!
//! Every wait in the coordinator is "check, then sleep one interval, until
//! the deadline". [`PollTimer`] owns the deadline so callers only decide
//! what a check is.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct PollTimer {
    deadline: Instant,
    interval: Duration,
}

impl PollTimer {
    pub fn start(max_wait: Duration, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + max_wait,
            interval,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Whole minutes left, rounded to nearest.
    pub fn minutes_left(&self) -> u64 {
        (self.remaining().as_secs() + 30) / 60
    }

    /// Sleep one interval, cut short at the deadline.
    ///
    /// Returns false without sleeping once the deadline has passed, and
    /// false after a sleep that reached it.
    pub async fn tick(&self) -> bool {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return false;
        }
        tokio::time::sleep(self.interval.min(remaining)).await;
        !self.expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_deadline() {
        let timer = PollTimer::start(Duration::from_secs(100), Duration::from_secs(30));
        let started = Instant::now();
        let mut ticks = 0;
        while timer.tick().await {
            ticks += 1;
        }
        assert_eq!(ticks, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_never_sleeps() {
        let timer = PollTimer::start(Duration::ZERO, Duration::from_secs(30));
        let started = Instant::now();
        assert!(!timer.tick().await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn minutes_left_rounds() {
        let timer = PollTimer::start(Duration::from_secs(20 * 60), Duration::from_secs(30));
        assert_eq!(timer.minutes_left(), 20);
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(timer.minutes_left(), 18);
    }
}
