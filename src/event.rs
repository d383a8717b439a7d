//! Connection lifecycle events.
//!
//! Every instrumented dial or accept produces the same shape of event stream:
//!
//! - `Attempt` for each try,
//! - `AttemptFailed` for each try that ended in an error,
//! - exactly one terminal `Failed` or `Established`,
//! - and, once an `Established` connection is closed (or dropped), exactly one `Closed`.
//!
//! Events are handed to trackers by reference and are not retained by the emitter. They are
//! cheap to clone (errors are shared behind an `Arc`) so recording trackers can keep them.
//!
//! ```rust
//! use conntrack::event::{ConnectionAttempt, ConnectionEvent};
//! use std::time::Instant;
//!
//! let event = ConnectionEvent::Attempt(ConnectionAttempt {
//!     client: true,
//!     attempt: 1,
//!     begin: Instant::now(),
//! });
//! assert!(event.is_client());
//! assert_eq!(event.kind(), "attempt");
//! ```

use crate::failure::FailureReason;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single dial/accept attempt started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    /// True when a dialer (client) triggered the event.
    pub client: bool,
    /// Sequence number of this attempt (1-indexed).
    pub attempt: usize,
    /// When the attempt started.
    pub begin: Instant,
}

/// A single attempt ended in an error. Further attempts may follow.
#[derive(Debug, Clone)]
pub struct ConnectionAttemptFailed {
    /// True when a dialer (client) triggered the event.
    pub client: bool,
    /// Sequence number of the failed attempt (1-indexed).
    pub attempt: usize,
    /// Start of the attempt. Listener retries report the start of the whole accept call.
    pub begin: Instant,
    /// When the attempt failed.
    pub end: Instant,
    /// The error returned by the transport.
    pub error: Arc<io::Error>,
    /// Coarse classification of `error`.
    pub reason: FailureReason,
}

/// The operation gave up after one or more attempts.
#[derive(Debug, Clone)]
pub struct ConnectionFailed {
    /// True when a dialer (client) triggered the event.
    pub client: bool,
    /// Total number of attempts made.
    pub attempts: usize,
    /// When the first attempt started.
    pub begin: Instant,
    /// When the operation failed.
    pub end: Instant,
    /// The error returned to the caller.
    pub error: Arc<io::Error>,
    /// Coarse classification of `error`.
    pub reason: FailureReason,
}

/// A usable connection now exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEstablished {
    /// True when a dialer (client) triggered the event.
    pub client: bool,
    /// Total number of attempts made.
    pub attempts: usize,
    /// When the first attempt started.
    pub begin: Instant,
    /// When the connection was established.
    pub end: Instant,
    /// Local address of the connection, if the transport could report it.
    pub local_addr: Option<SocketAddr>,
    /// Remote address of the connection, if the transport could report it.
    pub remote_addr: Option<SocketAddr>,
}

/// The connection was closed.
#[derive(Debug, Clone)]
pub struct ConnectionClosed {
    /// True when a dialer (client) triggered the event.
    pub client: bool,
    /// When the connection was established (the `end` of its `Established` event).
    pub begin: Instant,
    /// When the connection was closed.
    pub end: Instant,
    /// Error returned by the underlying close, if any.
    pub error: Option<Arc<io::Error>>,
}

/// Lifecycle event delivered to every [`ConnectionTracker`](crate::tracker::ConnectionTracker).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Attempt(ConnectionAttempt),
    AttemptFailed(ConnectionAttemptFailed),
    Failed(ConnectionFailed),
    Established(ConnectionEstablished),
    Closed(ConnectionClosed),
}

impl ConnectionEvent {
    /// True when a dialer (client) triggered the event, false for a listener (server).
    pub fn is_client(&self) -> bool {
        match self {
            ConnectionEvent::Attempt(e) => e.client,
            ConnectionEvent::AttemptFailed(e) => e.client,
            ConnectionEvent::Failed(e) => e.client,
            ConnectionEvent::Established(e) => e.client,
            ConnectionEvent::Closed(e) => e.client,
        }
    }

    /// Stable, lowercase label for the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionEvent::Attempt(_) => "attempt",
            ConnectionEvent::AttemptFailed(_) => "attempt_failed",
            ConnectionEvent::Failed(_) => "failed",
            ConnectionEvent::Established(_) => "established",
            ConnectionEvent::Closed(_) => "closed",
        }
    }

    /// Classified failure reason, for `AttemptFailed` and `Failed` only.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            ConnectionEvent::AttemptFailed(e) => Some(e.reason),
            ConnectionEvent::Failed(e) => Some(e.reason),
            _ => None,
        }
    }

    /// Time between `begin` and `end`, zero for `Attempt`.
    pub fn elapsed(&self) -> Duration {
        match self {
            ConnectionEvent::Attempt(_) => Duration::ZERO,
            ConnectionEvent::AttemptFailed(e) => e.end.saturating_duration_since(e.begin),
            ConnectionEvent::Failed(e) => e.end.saturating_duration_since(e.begin),
            ConnectionEvent::Established(e) => e.end.saturating_duration_since(e.begin),
            ConnectionEvent::Closed(e) => e.end.saturating_duration_since(e.begin),
        }
    }
}

/// Copy of `err` for an event, keeping its kind, OS code and message.
///
/// The original error goes back to the caller untouched, so events carry a copy. The copy does
/// not keep custom payload types; classify the original and store the result in `reason`.
pub(crate) fn snapshot(err: &io::Error) -> Arc<io::Error> {
    let copy = match (err.raw_os_error(), err.get_ref()) {
        (Some(code), _) => io::Error::from_raw_os_error(code),
        (None, Some(inner)) => io::Error::new(err.kind(), inner.to_string()),
        (None, None) => io::Error::from(err.kind()),
    };
    Arc::new(copy)
}

fn side(client: bool) -> &'static str {
    if client {
        "client"
    } else {
        "server"
    }
}

fn addr_or_dash(addr: &Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Attempt(e) => write!(f, "{}::Attempt(#{})", side(e.client), e.attempt),
            ConnectionEvent::AttemptFailed(e) => write!(
                f,
                "{}::AttemptFailed(#{}, reason={}, error={})",
                side(e.client),
                e.attempt,
                e.reason,
                e.error
            ),
            ConnectionEvent::Failed(e) => write!(
                f,
                "{}::Failed(attempts={}, reason={}, error={})",
                side(e.client),
                e.attempts,
                e.reason,
                e.error
            ),
            ConnectionEvent::Established(e) => write!(
                f,
                "{}::Established(attempts={}, {} -> {})",
                side(e.client),
                e.attempts,
                addr_or_dash(&e.local_addr),
                addr_or_dash(&e.remote_addr)
            ),
            ConnectionEvent::Closed(e) => match &e.error {
                Some(err) => write!(f, "{}::Closed(error={})", side(e.client), err),
                None => write!(f, "{}::Closed", side(e.client)),
            },
        }
    }
}
