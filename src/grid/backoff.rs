//! Capped exponential backoff used for stream reconnects and gateway retries

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with optional jitter.
///
/// delay(n) = min(max_delay, base * 2^n) +/- jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            attempt: 0,
        }
    }
}

impl ExponentialBackoff {
    /// # Arguments
    /// * `base` - Delay of the first attempt
    /// * `max_delay` - Cap applied before jitter
    /// * `jitter_factor` - Fraction of the delay to randomize, clamped to [0, 1]
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay for attempt `n` (0-based) without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Next delay; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let capped = self.delay_for(self.attempt);
        let jitter_range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    /// Call after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempt(), 7);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(30), 0.2);
        for _ in 0..50 {
            let d = backoff.next_delay().as_secs_f64();
            assert!(d >= 0.0 && d <= 36.0);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(5000), Duration::from_secs(30), 0.0);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }
}
