//! Restart delays for crash-looping processes.

use std::time::Duration;

use rand::Rng;

/// Smallest base delay, used after a reset.
pub const DELAY_MIN: Duration = Duration::from_secs(1);
/// Largest base delay.
pub const DELAY_MAX: Duration = Duration::from_secs(30);

/// Exponential backoff with ±25% jitter.
///
/// The base delay grows by 50% on every [`Backoff::delay`] call and is
/// clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    next_base: Duration,
}

impl Backoff {
    /// Creates a backoff with custom bounds.
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            next_base: min,
        }
    }

    /// Returns the jittered current delay and grows the base for the next call.
    pub fn delay(&mut self) -> Duration {
        let base = self.next_base();
        jitter(base, rand::thread_rng().gen_range(-0.25..=0.25))
    }

    /// Restores the minimal delay.
    pub fn reset(&mut self) {
        self.next_base = self.min;
    }

    fn next_base(&mut self) -> Duration {
        let base = self.next_base;
        self.next_base = base.mul_f64(1.5).clamp(self.min, self.max);
        base
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DELAY_MIN, DELAY_MAX)
    }
}

fn jitter(base: Duration, factor: f64) -> Duration {
    base.mul_f64(1.0 + factor)
}
