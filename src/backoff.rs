//! Backoff curves for listener accept retries.
//!
//! Attempt semantics: attempt `0` is the initial accept and never waits; the wait after the
//! `n`-th failed attempt is `delay(n)`. Curves are non-decreasing in `n` and saturate at
//! [`MAX_BACKOFF`] instead of overflowing.
//!
//! ```rust
//! use std::time::Duration;
//! use conntrack::backoff::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(5))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(5));
//! assert_eq!(backoff.delay(2), Duration::from_millis(10));
//! assert_eq!(backoff.delay(20), Duration::from_secs(1));
//! ```

use crate::error::BackoffError;
use std::fmt;
use std::time::Duration;

/// Upper bound for any computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// A delay curve indexed by attempt number.
///
/// Implementations must be pure: the retry loop may call `delay` from many concurrent accept
/// calls.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: usize) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Constant,
    Linear,
    Exponential,
}

/// Constant, linear, or exponential backoff with an optional cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    curve: Curve,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Wait `delay` after every failed attempt.
    pub fn constant(delay: Duration) -> Self {
        Self { curve: Curve::Constant, base: delay, max: None }
    }

    /// Wait `base * n` after the `n`-th failed attempt.
    pub fn linear(base: Duration) -> Self {
        Self { curve: Curve::Linear, base, max: None }
    }

    /// Wait `base * 2^(n-1)` after the `n`-th failed attempt.
    pub fn exponential(base: Duration) -> Self {
        Self { curve: Curve::Exponential, base, max: None }
    }

    /// Cap linear or exponential delays at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if self.curve == Curve::Constant {
            return Err(BackoffError::ConstantDoesNotSupportMax);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Delay to wait after the `attempt`-th failure (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.curve {
            Curve::Constant => self.base,
            Curve::Linear => {
                let n = attempt.min(u32::MAX as usize) as u32;
                self.base.checked_mul(n).unwrap_or(MAX_BACKOFF)
            }
            Curve::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = self.base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        let capped = self.max.map_or(raw, |m| raw.min(m));
        capped.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// Exponential from 5ms capped at 1s, the usual curve for accept loops.
    fn default() -> Self {
        Self { curve: Curve::Exponential, base: Duration::from_millis(5), max: Some(Duration::from_secs(1)) }
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: usize) -> Duration {
        Backoff::delay(self, attempt)
    }
}
