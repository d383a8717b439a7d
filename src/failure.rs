//! Failure classification for dial and accept errors.
//!
//! [`classify`] maps an error to a coarse [`FailureReason`]. Rules, first match wins, applied
//! across the whole error chain (including the payload of custom `io::Error`s):
//!
//! 1. a [`ResolveError`] → `Resolution`
//! 2. `io::ErrorKind::ConnectionRefused` → `ConnectionRefused`
//! 3. `io::ErrorKind::TimedOut`, a tokio deadline (`Elapsed`), a cancelled `JoinError`, or
//!    [`Cancelled`] → `Timeout`
//! 4. anything else → `Unknown`
//!
//! Classification is pure and total: the same error always maps to the same reason and no
//! error shape can make it fail.
//!
//! ```rust
//! use conntrack::failure::FailureReason;
//! use std::io;
//!
//! let err = io::Error::from(io::ErrorKind::ConnectionRefused);
//! assert_eq!(FailureReason::from_io(&err), FailureReason::ConnectionRefused);
//! assert_eq!(FailureReason::ConnectionRefused.to_string(), "refused");
//! ```

use std::error::Error;
use std::fmt;
use std::io;
use std::str::FromStr;

/// Reason a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FailureReason {
    /// The address could not be resolved.
    Resolution,
    /// The peer refused the connection.
    #[cfg_attr(feature = "serde", serde(rename = "refused"))]
    ConnectionRefused,
    /// The attempt timed out, hit a deadline, or was cancelled.
    Timeout,
    /// Anything else.
    #[default]
    Unknown,
}

impl FailureReason {
    /// Every reason, in the order metric label sets are pre-created.
    pub const ALL: [FailureReason; 4] = [
        FailureReason::Timeout,
        FailureReason::Resolution,
        FailureReason::ConnectionRefused,
        FailureReason::Unknown,
    ];

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Resolution => "resolution",
            FailureReason::ConnectionRefused => "refused",
            FailureReason::Timeout => "timeout",
            FailureReason::Unknown => "unknown",
        }
    }

    /// Classify an `io::Error` returned by a dial or accept.
    pub fn from_io(err: &io::Error) -> Self {
        classify(err)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = std::convert::Infallible;

    /// Unrecognized and empty labels parse as `Unknown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "resolution" => FailureReason::Resolution,
            "refused" => FailureReason::ConnectionRefused,
            "timeout" => FailureReason::Timeout,
            _ => FailureReason::Unknown,
        })
    }
}

/// Name resolution failed before any connection could be attempted.
///
/// [`TcpDialer`](crate::dialer::TcpDialer) wraps address lookup failures in this type; custom
/// [`Dial`](crate::dialer::Dial) implementations should do the same so the failure is reported
/// as `resolution`.
#[derive(Debug, thiserror::Error)]
#[error("failed to resolve {host}: {source}")]
pub struct ResolveError {
    host: String,
    #[source]
    source: io::Error,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, source: io::Error) -> Self {
        Self { host: host.into(), source }
    }

    /// The host that failed to resolve.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Convert into an `io::Error`, keeping the kind of the lookup error.
    pub fn into_io(self) -> io::Error {
        io::Error::new(self.source.kind(), self)
    }
}

/// Marks an accept error as transient, so a listener with a retry policy tries again.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TemporaryError(#[source] io::Error);

impl TemporaryError {
    /// Wrap `err` so [`is_temporary`] reports it as retryable.
    pub fn wrap(err: io::Error) -> io::Error {
        io::Error::new(err.kind(), TemporaryError(err))
    }
}

/// The operation was cancelled before it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection operation cancelled")]
pub struct Cancelled;

impl Cancelled {
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, self)
    }
}

/// Iterate over `err` and its causes. `io::Error::source` skips the custom payload itself, so
/// the payload is visited explicitly.
fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |&e: &&'a (dyn Error + 'static)| {
        match e.downcast_ref::<io::Error>() {
            Some(io_err) => io_err.get_ref().map(|inner| inner as &(dyn Error + 'static)),
            None => e.source(),
        }
    })
}

fn io_kind(err: &(dyn Error + 'static)) -> Option<io::ErrorKind> {
    err.downcast_ref::<io::Error>().map(io::Error::kind)
}

fn is_timeout(err: &(dyn Error + 'static)) -> bool {
    io_kind(err) == Some(io::ErrorKind::TimedOut)
        || err.is::<tokio::time::error::Elapsed>()
        || err.is::<Cancelled>()
        || err.downcast_ref::<tokio::task::JoinError>().is_some_and(|j| j.is_cancelled())
}

/// Classify an error into a [`FailureReason`].
pub fn classify(err: &(dyn Error + 'static)) -> FailureReason {
    if chain(err).any(|e| e.is::<ResolveError>()) {
        return FailureReason::Resolution;
    }
    if chain(err).any(|e| io_kind(e) == Some(io::ErrorKind::ConnectionRefused)) {
        return FailureReason::ConnectionRefused;
    }
    if chain(err).any(is_timeout) {
        return FailureReason::Timeout;
    }
    FailureReason::Unknown
}

/// Whether an accept error is transient and worth retrying.
///
/// True for errors wrapped with [`TemporaryError`], for the kinds the OS reports on transient
/// accept failures, and on Unix for descriptor/buffer exhaustion.
pub fn is_temporary(err: &io::Error) -> bool {
    if chain(err).any(|e| e.is::<TemporaryError>()) {
        return true;
    }
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(code, libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dns_failure() -> io::Error {
        ResolveError::new(
            "nonexistent.invalid",
            io::Error::new(io::ErrorKind::Other, "Name or service not known"),
        )
        .into_io()
    }

    #[test]
    fn resolution_wins_over_everything() {
        assert_eq!(FailureReason::from_io(&dns_failure()), FailureReason::Resolution);
    }

    #[test]
    fn refused_is_detected_by_kind() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(FailureReason::from_io(&err), FailureReason::ConnectionRefused);
    }

    #[test]
    fn refused_is_detected_when_nested() {
        #[derive(Debug, thiserror::Error)]
        #[error("dial failed")]
        struct Outer(#[source] io::Error);

        let nested = Outer(io::Error::from(io::ErrorKind::ConnectionRefused));
        let err = io::Error::new(io::ErrorKind::Other, nested);
        assert_eq!(FailureReason::from_io(&err), FailureReason::ConnectionRefused);
    }

    #[test]
    fn plain_timeout_classifies_as_timeout() {
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(FailureReason::from_io(&err), FailureReason::Timeout);
    }

    #[test]
    fn cancelled_marker_classifies_as_timeout() {
        assert_eq!(FailureReason::from_io(&Cancelled.into_io()), FailureReason::Timeout);
        assert_eq!(classify(&Cancelled), FailureReason::Timeout);
    }

    #[tokio::test]
    async fn deadline_exceeded_classifies_as_timeout() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(classify(&elapsed), FailureReason::Timeout);

        let wrapped = io::Error::new(io::ErrorKind::Other, elapsed);
        assert_eq!(FailureReason::from_io(&wrapped), FailureReason::Timeout);
    }

    #[tokio::test]
    async fn cancelled_task_classifies_as_timeout() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let join_err = handle.await.unwrap_err();
        assert!(join_err.is_cancelled());
        assert_eq!(classify(&join_err), FailureReason::Timeout);
    }

    #[test]
    fn unrecognized_errors_are_unknown() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert_eq!(FailureReason::from_io(&err), FailureReason::Unknown);
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(FailureReason::from_io(&err), FailureReason::Unknown);
    }

    #[test]
    fn classification_is_idempotent() {
        let err = dns_failure();
        let first = FailureReason::from_io(&err);
        let second = FailureReason::from_io(&err);
        assert_eq!(first, second);
    }

    #[test]
    fn labels_round_trip_and_empty_is_unknown() {
        for reason in FailureReason::ALL {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
        assert_eq!("".parse::<FailureReason>().unwrap(), FailureReason::Unknown);
        assert_eq!(FailureReason::default(), FailureReason::Unknown);
    }

    #[test]
    fn temporary_marker_and_kinds() {
        assert!(is_temporary(&TemporaryError::wrap(io::Error::new(io::ErrorKind::Other, "x"))));
        assert!(is_temporary(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_temporary(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_temporary(&io::Error::new(io::ErrorKind::Other, "fatal")));
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_temporary() {
        assert!(is_temporary(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_temporary(&io::Error::from_raw_os_error(libc::EACCES)));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_uses_metric_labels() {
        let json = serde_json::to_string(&FailureReason::ConnectionRefused).unwrap();
        assert_eq!(json, "\"refused\"");
        let back: FailureReason = serde_json::from_str("\"resolution\"").unwrap();
        assert_eq!(back, FailureReason::Resolution);
    }
}
