use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(60_000);
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the base delay used as +/- jitter.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: RANDOM_FACTOR,
        }
    }
}

impl BackoffConfig {
    /// Base delay that follows `current` in the exponential sequence, clamped
    /// to `[initial_delay, max_delay]`.
    pub fn next_base(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff_factor;
        let clamped = next
            .max(self.initial_delay.as_secs_f64())
            .min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(clamped)
    }
}

/// `base` with uniformly distributed jitter of up to `jitter * base` either way.
pub fn jittered_delay(base: Duration, config: &BackoffConfig) -> Duration {
    jittered_delay_with_rng(base, config, &mut rand::thread_rng())
}

pub(crate) fn jittered_delay_with_rng<R: Rng + ?Sized>(
    base: Duration,
    config: &BackoffConfig,
    rng: &mut R,
) -> Duration {
    let base_millis = base.as_millis() as f64;
    let jitter = config.jitter * base_millis * rng.gen_range(-1.0..=1.0);
    let value = (base_millis + jitter).round().max(0.0);
    Duration::from_millis(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = BackoffConfig::default();
        for _ in 0..100 {
            let value = jittered_delay_with_rng(Duration::from_millis(1_000), &config, &mut rng);
            assert!(value >= Duration::from_millis(500));
            assert!(value <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn base_grows_and_clamps() {
        let config = BackoffConfig::default();
        assert_eq!(config.next_base(Duration::ZERO), config.initial_delay);
        assert_eq!(
            config.next_base(Duration::from_millis(1_000)),
            Duration::from_millis(1_500)
        );
        assert_eq!(config.next_base(Duration::from_secs(50)), config.max_delay);
    }

    #[test]
    fn zero_base_has_no_delay() {
        let mut rng = StdRng::seed_from_u64(7);
        let value =
            jittered_delay_with_rng(Duration::ZERO, &BackoffConfig::default(), &mut rng);
        assert_eq!(value, Duration::ZERO);
    }
}
