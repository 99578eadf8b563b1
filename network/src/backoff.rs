//! Exponential backoff bounded by a total-duration ceiling.

use std::time::Duration;

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Ceiling measured from the first attempt; no retry starts after it.
    pub max_elapsed: Duration,
    /// Each interval is spread by up to this fraction either way.
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            max_elapsed: Duration::from_secs(15 * 60),
            randomization_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current: self.initial_interval,
        }
    }
}

/// Retry state for one send. A fresh one starts at the initial interval.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once `elapsed` plus that
    /// delay would pass the ceiling.
    pub fn next_delay(&mut self, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.policy.max_elapsed {
            return None;
        }
        let delay = jitter(self.current, self.policy.randomization_factor);
        let grown = self.current.as_nanos() as f64 * self.policy.multiplier;
        self.current = Duration::from_nanos(grown as u64).min(self.policy.max_interval);
        if elapsed + delay > self.policy.max_elapsed {
            return None;
        }
        Some(delay)
    }
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let spread = base * factor;
    let secs = rand::thread_rng().gen_range((base - spread)..=(base + spread));
    Duration::from_secs_f64(secs.max(0.0))
}
