use std::time::Duration;
use tokio::time::Instant;

use crate::config::MAX_DELAY;

/// Table-driven retry delay for data-call setup.
#[derive(Debug, Clone)]
pub struct Backoff {
    table: Vec<Duration>,
    failures: usize,
    allowed_at: Instant,
}

impl Backoff {
    pub fn new(table_secs: &[u64]) -> Self {
        let mut table: Vec<Duration> = table_secs
            .iter()
            .map(|s| Duration::from_secs(*s).min(MAX_DELAY))
            .collect();
        if table.is_empty() {
            table.push(Duration::from_secs(60));
        }
        Self {
            table,
            failures: 0,
            allowed_at: Instant::now(),
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn allowed_at(&self) -> Instant {
        self.allowed_at
    }

    /// Time left before the next attempt may run, if any.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        (self.allowed_at > now).then(|| self.allowed_at - now)
    }

    /// Count a failed attempt and return the delay before the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let index = self.failures.min(self.table.len() - 1);
        let delay = self.table[index];
        self.failures += 1;
        self.allowed_at = self.allowed_at.max(now + delay);
        delay
    }

    pub fn reset(&mut self, now: Instant) {
        self.failures = 0;
        self.allowed_at = now;
    }

    /// Hold off the next attempt for at least `delay` without counting a failure.
    pub fn settle(&mut self, now: Instant, delay: Duration) {
        self.allowed_at = self.allowed_at.max(now + delay.min(MAX_DELAY));
    }

    /// Drop any pending delay but keep the failure count.
    pub fn clear_delay(&mut self, now: Instant) {
        self.allowed_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delay_table_and_clamp() {
        let mut backoff = Backoff::new(&[5, 10, 20, 40, 60]);
        let now = Instant::now();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.record_failure(now).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
        assert_eq!(backoff.failures(), 7);
        assert_eq!(backoff.remaining(now), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delays_are_clamped() {
        let mut backoff = Backoff::new(&[u64::MAX]);
        let now = Instant::now();
        assert_eq!(backoff.record_failure(now), MAX_DELAY);
        assert_eq!(backoff.remaining(now), Some(MAX_DELAY));

        backoff.reset(now);
        backoff.settle(now, Duration::MAX);
        assert_eq!(backoff.remaining(now), Some(MAX_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets() {
        let mut backoff = Backoff::new(&[5, 10, 20, 40, 60]);
        let now = Instant::now();
        backoff.record_failure(now);
        backoff.record_failure(now);
        backoff.reset(now);
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.remaining(now), None);
        assert_eq!(backoff.record_failure(now), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_time_never_moves_back() {
        let mut backoff = Backoff::new(&[5, 10, 20, 40, 60]);
        let now = Instant::now();
        backoff.record_failure(now);
        let allowed = backoff.allowed_at();

        backoff.settle(now, Duration::from_secs(1));
        assert_eq!(backoff.allowed_at(), allowed);

        backoff.settle(now, Duration::from_secs(30));
        assert_eq!(backoff.allowed_at(), now + Duration::from_secs(30));

        backoff.clear_delay(now);
        assert_eq!(backoff.remaining(now), None);
        assert_eq!(backoff.failures(), 1);
    }
}
