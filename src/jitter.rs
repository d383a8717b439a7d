//! Jitter for accept retry delays.
//!
//! - `None`: exact backoff delay.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//! - `Decorrelated`: `min(max, uniform(base, previous * 3))`, following the previous sleep.
//!
//! `Jitter` itself is immutable configuration and is shared by every accept call. Decorrelated
//! jitter needs memory of the previous sleep; that memory lives in the [`JitterState`] returned
//! by [`Jitter::start`], one per accept call, so concurrent calls never share a curve.

use crate::error::BackoffError;
use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
    Decorrelated { base: Duration, max: Duration },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn decorrelated(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if base > max {
            return Err(BackoffError::JitterBaseExceedsMax { base, max });
        }
        Ok(Jitter::Decorrelated { base, max })
    }

    /// Fresh per-call state.
    pub fn start(&self) -> JitterState {
        let previous = match self {
            Jitter::Decorrelated { base, .. } => *base,
            _ => Duration::ZERO,
        };
        JitterState { jitter: *self, previous }
    }
}

// Nanosecond resolution keeps sub-millisecond delays from collapsing to zero.
fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Jitter progression for a single accept call.
#[derive(Debug, Clone)]
pub struct JitterState {
    jitter: Jitter,
    previous: Duration,
}

impl JitterState {
    /// Randomize `delay` using the thread-local RNG.
    pub fn apply(&mut self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Randomize `delay` with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&mut self, delay: Duration, rng: &mut R) -> Duration {
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => match nanos(delay) {
                0 => Duration::ZERO,
                ns => Duration::from_nanos(rng.random_range(0..=ns)),
            },
            Jitter::Equal => match nanos(delay) {
                0 => Duration::ZERO,
                ns => Duration::from_nanos(rng.random_range(ns / 2..=ns)),
            },
            Jitter::Decorrelated { base, max } => {
                let upper = nanos(self.previous).saturating_mul(3).min(nanos(max));
                let lower = nanos(base).min(upper);
                self.previous = Duration::from_nanos(rng.random_range(lower..=upper));
                self.previous
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_returns_exact_delay() {
        let mut state = Jitter::None.start();
        assert_eq!(state.apply(Duration::from_millis(40)), Duration::from_millis(40));
    }

    #[test]
    fn full_and_equal_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(100);
        let mut full = Jitter::full().start();
        let mut equal = Jitter::equal().start();
        for _ in 0..200 {
            assert!(full.apply_with_rng(delay, &mut rng) <= delay);
            let e = equal.apply_with_rng(delay, &mut rng);
            assert!(e >= Duration::from_millis(50) && e <= delay);
        }
        assert_eq!(full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn sub_millisecond_delays_keep_their_jitter_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let delay = Duration::from_micros(400);
        let mut equal = Jitter::equal().start();
        for _ in 0..100 {
            let e = equal.apply_with_rng(delay, &mut rng);
            assert!(e >= Duration::from_micros(200) && e <= delay, "{e:?}");
        }
        let mut full = Jitter::full().start();
        let total: Duration = (0..100).map(|_| full.apply_with_rng(delay, &mut rng)).sum();
        assert!(total > Duration::ZERO);
    }

    #[test]
    fn decorrelated_stays_within_base_and_max() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(200);
        let mut state = Jitter::decorrelated(base, max).unwrap().start();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let d = state.apply_with_rng(Duration::ZERO, &mut rng);
            assert!(d >= base && d <= max, "{d:?}");
        }
    }

    #[test]
    fn decorrelated_states_are_independent() {
        let jitter = Jitter::decorrelated(Duration::from_millis(10), Duration::from_secs(10)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut busy = jitter.start();
        for _ in 0..20 {
            busy.apply_with_rng(Duration::ZERO, &mut rng);
        }
        // A fresh call starts from base: its first sleep is bounded by base * 3.
        let mut fresh = jitter.start();
        let first = fresh.apply_with_rng(Duration::ZERO, &mut rng);
        assert!(first <= Duration::from_millis(30), "{first:?}");
    }

    #[test]
    fn decorrelated_rejects_base_above_max() {
        assert!(matches!(
            Jitter::decorrelated(Duration::from_secs(2), Duration::from_secs(1)),
            Err(BackoffError::JitterBaseExceedsMax { .. })
        ));
    }
}
