//! Backoff policies for failed jobs.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default upper bound for computed delays (1 hour).
pub const DEFAULT_MAX_DELAY_MS: u64 = 3_600_000;

/// Largest accepted `max_delay_ms` (365 days).
pub const MAX_BACKOFF_DELAY_MS: u64 = 31_536_000_000;

/// Backoff strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows as `base * multiplier^(attempt - 1)`.
    Exponential,
    /// Delay grows as `base * attempt`.
    Linear,
}

/// Backoff policy stored with every job.
///
/// Delays are a pure function of the attempt count unless jitter is
/// explicitly enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Backoff strategy.
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0); zero disables jitter.
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(5000))
    }
}

impl Backoff {
    /// Creates a fixed delay backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms: duration_ms(delay),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Creates an exponential backoff doubling from `base`.
    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: duration_ms(base),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Creates a linear backoff growing by `increment` per attempt.
    pub fn linear(increment: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base_delay_ms: duration_ms(increment),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter of up to `factor` of the computed delay.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = factor.clamp(0.0, 1.0);
        self
    }

    /// Checks that the policy can produce sensible delays.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay_ms > MAX_BACKOFF_DELAY_MS {
            return Err(format!(
                "backoff max delay {}ms exceeds {MAX_BACKOFF_DELAY_MS}ms",
                self.max_delay_ms
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "backoff max delay {}ms is below base delay {}ms",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        if self.kind == BackoffKind::Exponential && !(self.multiplier >= 1.0) {
            return Err(format!("backoff multiplier must be >= 1.0, got {}", self.multiplier));
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many attempts have failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms as f64;
        let raw = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exp = i32::try_from(attempts_made - 1).unwrap_or(i32::MAX);
                base * self.multiplier.powi(exp)
            }
            BackoffKind::Linear => base * f64::from(attempts_made),
        };

        // Cap at max delay; the float comparison also absorbs infinities.
        let max = self.max_delay_ms as f64;
        let capped = if raw.is_finite() { raw.min(max) } else { max };
        let capped_ms = capped as u64;

        let final_ms = if self.jitter > 0.0 {
            let range = (capped_ms as f64 * self.jitter) as u64;
            if range == 0 {
                capped_ms
            } else {
                let offset = rand::thread_rng().gen_range(0..=range);
                capped_ms.saturating_sub(range / 2).saturating_add(offset)
            }
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_exponential_five_seconds() {
        let backoff = Backoff::default();
        assert_eq!(backoff.kind, BackoffKind::Exponential);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(5000));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = Backoff::fixed(Duration::from_millis(750));

        assert_eq!(backoff.delay_for(1), Duration::from_millis(750));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(750));
    }

    #[test]
    fn test_exponential_backoff() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));

        // 1st retry: 1000ms
        // 2nd retry: 2000ms
        // 3rd retry: 4000ms
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = Backoff::linear(Duration::from_millis(1000));

        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_custom_multiplier() {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_multiplier(3.0);
        assert_eq!(backoff.delay_for(3), Duration::from_millis(900));
    }

    #[test]
    fn test_max_delay_cap() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1)).with_max_delay(Duration::from_secs(10));

        assert_eq!(backoff.delay_for(10), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_deterministic_without_jitter() {
        let backoff = Backoff::exponential(Duration::from_millis(250));
        assert_eq!(backoff.delay_for(4), backoff.delay_for(4));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = Backoff::fixed(Duration::from_millis(1000)).with_jitter(0.2);
        for _ in 0..50 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_millis(900));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_zero_attempts_has_no_delay() {
        assert_eq!(Backoff::default().delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let backoff = Backoff::fixed(Duration::from_secs(5)).with_max_delay(Duration::from_secs(1));
        assert!(backoff.validate().is_err());
        assert!(Backoff::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unbounded_delays() {
        let huge = Duration::from_secs(1 << 43);
        let backoff = Backoff::fixed(huge).with_max_delay(huge);
        assert!(backoff.validate().is_err());

        let year = Duration::from_millis(MAX_BACKOFF_DELAY_MS);
        let backoff = Backoff::exponential(Duration::from_secs(1)).with_max_delay(year);
        assert!(backoff.validate().is_ok());
        assert_eq!(backoff.delay_for(64), year);
    }
}
