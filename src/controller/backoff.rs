//! Jittered exponential backoff for transient read failures

use std::time::Duration;

use rand::Rng;

/// Backoff parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the delay randomized away, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

/// Stateful backoff: each failure grows the delay until [`Backoff::reset`]
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of consecutive failures recorded
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, without jitter
    pub fn ceiling(&self) -> Duration {
        let exp = self.config.factor.powi(self.attempt.min(64) as i32);
        let millis = (self.config.base.as_millis() as f64 * exp)
            .min(self.config.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Record a failure and return how long to wait.
    ///
    /// The result lies in `[ceiling * (1 - jitter), ceiling]`.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=1.0);
        ceiling.mul_f64(scale)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
