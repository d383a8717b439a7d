//! Error types for connection tracking configuration and keep-alive setup.
use std::io;
use std::time::Duration;

/// Enabling TCP keep-alive on an accepted connection failed.
///
/// Returned to the `accept` caller wrapped in an `io::Error` of the same kind as the socket
/// error; the connection is not returned.
#[derive(Debug, thiserror::Error)]
#[error("failed to enable keep-alive (period {period:?}): {source}")]
pub struct KeepAliveError {
    pub period: Duration,
    #[source]
    pub source: io::Error,
}

impl KeepAliveError {
    pub fn into_io(self) -> io::Error {
        io::Error::new(self.source.kind(), self)
    }
}

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("decorrelated jitter: base ({base:?}) must not exceed max ({max:?})")]
    JitterBaseExceedsMax { base: Duration, max: Duration },
}

/// Errors produced while building wrappers and policies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0 when set.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    /// Names label metrics and logs and may not be empty.
    #[error("name must not be empty")]
    EmptyName,
}
