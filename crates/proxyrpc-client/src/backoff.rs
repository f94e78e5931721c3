use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for exponential backoff between retries.
///
/// Each retry waits roughly `previous * multiplier`, capped at `max_interval`, with
/// `randomization_factor` jitter applied on both sides of the nominal delay.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    ///
    /// Default: 500ms
    pub initial_interval: Duration,
    /// Growth factor between consecutive delays
    ///
    /// Default: 1.5
    pub multiplier: f64,
    /// Upper bound of a single delay
    ///
    /// Default: 60s
    pub max_interval: Duration,
    /// Jitter, as a fraction of the nominal delay
    ///
    /// Default: 0.5 (delay is drawn from `[0.5 * d, 1.5 * d]`)
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            randomization_factor: 0.5,
        }
    }
}

/// Backoff state of one call. Persists across all attempts of the call.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    max_elapsed: Option<Duration>,
    start: Instant,
    current: Duration,
}

impl ExponentialBackoff {
    /// Starts the clock. `max_elapsed = None` leaves the budget unbounded.
    pub fn new(config: BackoffConfig, max_elapsed: Option<Duration>) -> Self {
        let current = config.initial_interval;
        Self {
            config,
            max_elapsed,
            start: Instant::now(),
            current,
        }
    }

    /// Time since the backoff was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
        self.current = self.config.initial_interval;
    }

    /// Delay before the next retry, or `None` when waiting it out would exceed the budget.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.randomize(self.current);

        if let Some(max_elapsed) = self.max_elapsed {
            if self.elapsed() + delay > max_elapsed {
                return None;
            }
        }

        let next = self.current.mul_f64(self.config.multiplier);
        self.current = next.min(self.config.max_interval);

        Some(delay)
    }

    fn randomize(&self, interval: Duration) -> Duration {
        let factor = self.config.randomization_factor;
        if factor <= 0.0 {
            return interval;
        }
        let scale = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
        interval.mul_f64(scale.max(0.0))
    }
}
