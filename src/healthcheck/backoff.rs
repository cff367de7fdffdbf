use crate::config::HealthCheckConfig;
use std::time::Duration;

/// Capped exponential delays between readiness probes.
///
/// ```
/// use devstack::healthcheck::Backoff;
/// use std::time::Duration;
///
/// let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350), 2.0);
/// assert_eq!(b.next_delay(), Duration::from_millis(100));
/// assert_eq!(b.next_delay(), Duration::from_millis(200));
/// assert_eq!(b.next_delay(), Duration::from_millis(350));
/// assert_eq!(b.next_delay(), Duration::from_millis(350));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        Self {
            current: initial,
            initial,
            max: max.max(initial),
            multiplier,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.initial_interval, config.max_interval, config.multiplier)
    }

    /// The delay to sleep now; advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
