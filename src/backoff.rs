//! Exponential backoff with a cap and proportional jitter.

use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Pure attempt-index → delay function.
///
/// The unjittered delay for attempt `n` (1-indexed) is
/// `min(base · multiplier^(n−1), max)`; jitter then adds a uniform random
/// fraction of the capped delay, scaled by `jitter_factor`. Delays are
/// monotonically non-decreasing until the cap.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Backoff {
    /// Validated construction; invalid parameters fail, never clamp.
    pub fn new(
        base: Duration,
        max: Duration,
        multiplier: f64,
        jitter_factor: f64,
    ) -> Result<Self, ConfigError> {
        if max < base {
            return Err(ConfigError::DelayRange { base, max });
        }
        if !(multiplier > 1.0) {
            return Err(ConfigError::InvalidMultiplier { value: multiplier });
        }
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(ConfigError::InvalidJitter { value: jitter_factor });
        }
        Ok(Self { base, max, multiplier, jitter_factor })
    }

    /// Doubling backoff with no jitter.
    pub fn exponential(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        Self::new(base, max, 2.0, 0.0)
    }

    /// The capped, unjittered delay for a 1-indexed attempt.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        // f64 math saturates to infinity on overflow; the cap brings it back.
        let scaled = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Delay for an attempt with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Delay for an attempt using a caller-supplied RNG (for deterministic tests).
    pub fn delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let capped = self.raw_delay(attempt);
        if self.jitter_factor == 0.0 {
            return capped;
        }
        let unit: f64 = rng.random();
        capped + capped.mul_f64(unit * self.jitter_factor)
    }

    /// Upper bound on any delay this backoff can produce.
    pub fn max_possible_delay(&self) -> Duration {
        self.max + self.max.mul_f64(self.jitter_factor)
    }
}
