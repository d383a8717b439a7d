//! How the accept retry loop waits between attempts.
//!
//! Production code sleeps on the tokio timer; tests inject [`RecordingSleeper`] to observe the
//! requested delays without waiting for them.

use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping between accept attempts.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately and records every requested delay.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_sleeper_returns_immediately_and_records() {
        let sleeper = RecordingSleeper::new();
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(30)).await;
        sleeper.sleep(Duration::from_millis(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sleeper.calls(), vec![Duration::from_secs(30), Duration::from_millis(5)]);
        assert_eq!(sleeper.total(), Duration::from_millis(30_005));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_on_the_timer() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(250)).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
