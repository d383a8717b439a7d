//! Structured logging of connection events through `tracing`.
//!
//! [`LogTracker`] tags each operation with [`LogAttributes`] and logs every event of a tagged
//! operation. Operations it did not tag (no `LogAttributes` in the context) are ignored.
//!
//! | event | level |
//! |---|---|
//! | attempt | configurable, `DEBUG` by default |
//! | attempt failed, failed | `ERROR` |
//! | established, closed | `INFO` |
//! | closed with an error | `ERROR` |
//!
//! The tracker never installs a subscriber.

use crate::context::TagContext;
use crate::event::ConnectionEvent;
use crate::tracker::{
    ConnectionTracker, DialerTagInfo, DialerTagger, ListenerTagInfo, ListenerTagger,
};
use std::net::SocketAddr;
use tracing::Level;

/// Component name for dialed connections.
pub const CLIENT_COMPONENT: &str = "net.ClientConn";
/// Component name for accepted connections.
pub const SERVER_COMPONENT: &str = "net.ServerConn";

/// Fields attached to every log line of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogAttributes {
    pub component: &'static str,
    /// Dialer or listener name.
    pub name: String,
    /// Dialed address; empty for accepted connections.
    pub addr: String,
}

/// `tracing::event!` needs a constant level.
macro_rules! event_at {
    ($level:expr, $($rest:tt)+) => {
        match $level {
            Level::TRACE => tracing::event!(Level::TRACE, $($rest)+),
            Level::DEBUG => tracing::event!(Level::DEBUG, $($rest)+),
            Level::INFO => tracing::event!(Level::INFO, $($rest)+),
            Level::WARN => tracing::event!(Level::WARN, $($rest)+),
            _ => tracing::event!(Level::ERROR, $($rest)+),
        }
    };
}

/// Logs dialer and listener connection events.
#[derive(Debug, Clone)]
pub struct LogTracker {
    attempt_level: Level,
}

impl LogTracker {
    pub fn new() -> Self {
        Self { attempt_level: Level::DEBUG }
    }

    pub fn builder() -> LogTrackerBuilder {
        LogTrackerBuilder { attempt_level: Level::DEBUG }
    }

    pub fn attempt_level(&self) -> Level {
        self.attempt_level
    }
}

impl Default for LogTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`LogTracker`].
#[derive(Debug, Clone)]
pub struct LogTrackerBuilder {
    attempt_level: Level,
}

impl LogTrackerBuilder {
    /// Level for `attempt` events.
    pub fn attempt_level(mut self, level: Level) -> Self {
        self.attempt_level = level;
        self
    }

    pub fn build(self) -> LogTracker {
        LogTracker { attempt_level: self.attempt_level }
    }
}

fn addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_string(), |a| a.to_string())
}

struct Messages {
    attempt: &'static str,
    attempt_failed: &'static str,
    failed: &'static str,
    established: &'static str,
}

const DIAL: Messages = Messages {
    attempt: "Dial attempt",
    attempt_failed: "Dial attempt failed",
    failed: "Dial failed",
    established: "Connection established",
};

const ACCEPT: Messages = Messages {
    attempt: "Accept attempt",
    attempt_failed: "Accept attempt failed",
    failed: "Accept failed",
    established: "Connection accepted",
};

impl ConnectionTracker for LogTracker {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        let Some(attrs) = ctx.get::<LogAttributes>() else {
            return;
        };
        let messages = if event.is_client() { &DIAL } else { &ACCEPT };
        let component = attrs.component;
        let name = attrs.name.as_str();
        let target_addr = attrs.addr.as_str();

        match event {
            ConnectionEvent::Attempt(e) => {
                event_at!(
                    self.attempt_level,
                    component,
                    name,
                    addr = target_addr,
                    attempt = e.attempt,
                    "{}",
                    messages.attempt
                );
            }
            ConnectionEvent::AttemptFailed(e) => {
                tracing::error!(
                    component,
                    name,
                    addr = target_addr,
                    attempt = e.attempt,
                    reason = %e.reason,
                    error = %e.error,
                    took = ?event.elapsed(),
                    "{}",
                    messages.attempt_failed
                );
            }
            ConnectionEvent::Failed(e) => {
                tracing::error!(
                    component,
                    name,
                    addr = target_addr,
                    attempts = e.attempts,
                    reason = %e.reason,
                    error = %e.error,
                    took = ?event.elapsed(),
                    "{}",
                    messages.failed
                );
            }
            ConnectionEvent::Established(e) => {
                tracing::info!(
                    component,
                    name,
                    addr = target_addr,
                    remote_addr = %addr(e.remote_addr),
                    local_addr = %addr(e.local_addr),
                    took = ?event.elapsed(),
                    "{}",
                    messages.established
                );
            }
            ConnectionEvent::Closed(e) => match &e.error {
                Some(error) => tracing::error!(
                    component,
                    name,
                    addr = target_addr,
                    connection_time = ?event.elapsed(),
                    error = %error,
                    "Failed to close connection"
                ),
                None => tracing::info!(
                    component,
                    name,
                    addr = target_addr,
                    connection_time = ?event.elapsed(),
                    "Connection closed"
                ),
            },
        }
    }

    fn as_dialer_tagger(&self) -> Option<&dyn DialerTagger> {
        Some(self)
    }

    fn as_listener_tagger(&self) -> Option<&dyn ListenerTagger> {
        Some(self)
    }
}

impl DialerTagger for LogTracker {
    fn tag_dialer_connection(&self, ctx: TagContext, info: &DialerTagInfo) -> TagContext {
        ctx.with(LogAttributes {
            component: CLIENT_COMPONENT,
            name: info.name.clone(),
            addr: info.addr.clone(),
        })
    }
}

impl ListenerTagger for LogTracker {
    fn tag_listener_connection(&self, ctx: TagContext, info: &ListenerTagInfo) -> TagContext {
        ctx.with(LogAttributes {
            component: SERVER_COMPONENT,
            name: info.name.clone(),
            addr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ConnectionAttempt, ConnectionClosed, ConnectionFailed};
    use crate::failure::FailureReason;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(max_level: Level, f: impl FnOnce()) -> String {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(max_level)
            .with_ansi(false)
            .without_time()
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn dial_ctx(tracker: &LogTracker) -> TagContext {
        tracker.tag_dialer_connection(
            TagContext::new(),
            &DialerTagInfo { name: "db".into(), network: "tcp".into(), addr: "10.0.0.1:5432".into() },
        )
    }

    #[test]
    fn untagged_operations_are_ignored() {
        let tracker = LogTracker::new();
        let logs = capture(Level::TRACE, || {
            tracker.track_connection(
                &TagContext::new(),
                &ConnectionEvent::Attempt(ConnectionAttempt { client: true, attempt: 1, begin: Instant::now() }),
            );
        });
        assert!(logs.is_empty(), "{logs}");
    }

    #[test]
    fn dial_failure_logs_reason_and_error_at_error_level() {
        let tracker = LogTracker::new();
        let ctx = dial_ctx(&tracker);
        let now = Instant::now();
        let logs = capture(Level::INFO, || {
            tracker.track_connection(
                &ctx,
                &ConnectionEvent::Failed(ConnectionFailed {
                    client: true,
                    attempts: 1,
                    begin: now,
                    end: now,
                    error: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
                    reason: FailureReason::ConnectionRefused,
                }),
            );
        });
        assert!(logs.contains("ERROR"), "{logs}");
        assert!(logs.contains("Dial failed"));
        assert!(logs.contains("component=\"net.ClientConn\""), "{logs}");
        assert!(logs.contains("reason=refused"));
        assert!(logs.contains("addr=\"10.0.0.1:5432\""), "{logs}");
    }

    #[test]
    fn attempts_log_at_configured_level() {
        let quiet = LogTracker::new();
        let loud = LogTracker::builder().attempt_level(Level::INFO).build();
        let attempt = ConnectionEvent::Attempt(ConnectionAttempt { client: true, attempt: 1, begin: Instant::now() });

        let logs = capture(Level::INFO, || quiet.track_connection(&dial_ctx(&quiet), &attempt));
        assert!(logs.is_empty(), "{logs}");

        let logs = capture(Level::INFO, || loud.track_connection(&dial_ctx(&loud), &attempt));
        assert!(logs.contains("Dial attempt"), "{logs}");
        assert!(logs.contains("attempt=1"));
    }

    #[test]
    fn listener_close_with_error_logs_at_error_level() {
        let tracker = LogTracker::new();
        let ctx = tracker.tag_listener_connection(TagContext::new(), &ListenerTagInfo { name: "http".into() });
        let now = Instant::now();
        let closed = |error: Option<io::Error>| {
            ConnectionEvent::Closed(ConnectionClosed { client: false, begin: now, end: now, error: error.map(Arc::new) })
        };

        let logs = capture(Level::INFO, || {
            tracker.track_connection(&ctx, &closed(None));
            tracker.track_connection(&ctx, &closed(Some(io::Error::from(io::ErrorKind::BrokenPipe))));
        });
        assert!(logs.contains("INFO"), "{logs}");
        assert!(logs.contains("Connection closed"));
        assert!(logs.contains("ERROR"));
        assert!(logs.contains("Failed to close connection"));
        assert!(logs.contains("component=\"net.ServerConn\""), "{logs}");
        assert!(logs.contains("name=\"http\""), "{logs}");
    }
}
