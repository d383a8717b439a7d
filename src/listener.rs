//! Inbound connection tracking.
//!
//! [`TrackedListener`] wraps an [`Accept`] implementation. Each call to
//! [`TrackedListener::accept`] is one tracked operation:
//!
//! ```text
//! Attempt(1) [AttemptFailed(1) Attempt(2) ...] Established(n) | Failed(n)
//! ```
//!
//! Retries happen only with an [`AcceptRetry`] policy and only for errors the listener reports
//! as temporary ([`Accept::is_temporary`]). Every call starts its own backoff progression, so
//! concurrent accepts that hit temporary errors back off independently.
//!
//! ```rust,no_run
//! use conntrack::listener::{AcceptRetry, TrackedListener};
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TrackedListener::builder(TcpListener::bind("127.0.0.1:0").await?)
//!     .name("http")
//!     .retry(AcceptRetry::builder().max_attempts(10).build()?)
//!     .tcp_keepalive(Duration::from_secs(180))
//!     .build()?;
//!
//! loop {
//!     let conn = listener.accept().await?;
//!     tokio::spawn(async move {
//!         // serve, then
//!         let _ = conn.close().await;
//!     });
//! }
//! # }
//! ```

use crate::backoff::{Backoff, BackoffStrategy};
use crate::conn::{Connection, TrackedConnection};
use crate::context::TagContext;
use crate::dialer::DEFAULT_NAME;
use crate::error::{BuildError, KeepAliveError};
use crate::event::{
    self, ConnectionAttempt, ConnectionAttemptFailed, ConnectionEstablished, ConnectionEvent,
    ConnectionFailed,
};
use crate::failure::{self, FailureReason};
use crate::jitter::{Jitter, JitterState};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::tracker::{self, ListenerTagInfo, SharedTracker};
use async_trait::async_trait;
use socket2::TcpKeepalive;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

/// Accepts inbound connections.
#[async_trait]
pub trait Accept: Send + Sync + 'static {
    type Conn: Connection;

    async fn accept(&self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Whether `err` is transient and the accept may be retried.
    fn is_temporary(&self, err: &io::Error) -> bool {
        failure::is_temporary(err)
    }
}

#[async_trait]
impl Accept for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Retry policy for temporary accept errors.
#[derive(Clone)]
pub struct AcceptRetry {
    backoff: Arc<dyn BackoffStrategy>,
    jitter: Jitter,
    max_attempts: Option<usize>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for AcceptRetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptRetry")
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("max_attempts", &self.max_attempts)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl AcceptRetry {
    pub fn builder() -> AcceptRetryBuilder {
        AcceptRetryBuilder::new()
    }

    /// Total attempts per accept call, if bounded.
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    fn exhausted(&self, attempt: usize) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }

    /// Wait after the `attempt`-th failure of one accept call.
    fn next_delay(&self, state: &mut JitterState, attempt: usize) -> Duration {
        state.apply(self.backoff.delay(attempt))
    }
}

impl Default for AcceptRetry {
    fn default() -> Self {
        Self {
            backoff: Arc::new(Backoff::default()),
            jitter: Jitter::None,
            max_attempts: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

/// Builder for [`AcceptRetry`].
pub struct AcceptRetryBuilder {
    backoff: Arc<dyn BackoffStrategy>,
    jitter: Jitter,
    max_attempts: Option<usize>,
    sleeper: Arc<dyn Sleeper>,
}

impl AcceptRetryBuilder {
    /// Capped exponential backoff, no jitter, unbounded attempts, tokio timer.
    pub fn new() -> Self {
        let defaults = AcceptRetry::default();
        Self {
            backoff: defaults.backoff,
            jitter: defaults.jitter,
            max_attempts: defaults.max_attempts,
            sleeper: defaults.sleeper,
        }
    }

    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Give up after `attempts` accepts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<AcceptRetry, BuildError> {
        if self.max_attempts == Some(0) {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(AcceptRetry {
            backoff: self.backoff,
            jitter: self.jitter,
            max_attempts: self.max_attempts,
            sleeper: self.sleeper,
        })
    }
}

impl Default for AcceptRetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A listener that reports accepted connections to a tracker.
pub struct TrackedListener<L> {
    inner: L,
    name: String,
    tracker: SharedTracker,
    retry: Option<AcceptRetry>,
    keepalive: Duration,
}

impl<L> std::fmt::Debug for TrackedListener<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedListener")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl<L: Accept> TrackedListener<L> {
    pub fn builder(inner: L) -> TrackedListenerBuilder<L> {
        TrackedListenerBuilder::new(inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one connection, retrying temporary errors when a retry policy is set.
    ///
    /// The final accept error is returned unchanged. If keep-alive cannot be enabled on the
    /// accepted connection, the connection is closed and an error carrying a
    /// [`KeepAliveError`] is returned instead.
    pub async fn accept(&self) -> io::Result<TrackedConnection<L::Conn>> {
        let ctx = TagContext::new().with_listener_name(self.name.clone());
        let ctx = tracker::tag_listener(
            self.tracker.as_ref(),
            ctx,
            &ListenerTagInfo { name: self.name.clone() },
        );

        let start = Instant::now();
        let mut jitter: Option<JitterState> = None;
        let mut attempt = 1;
        let accepted = loop {
            self.track(&ctx, ConnectionEvent::Attempt(ConnectionAttempt {
                client: false,
                attempt,
                begin: Instant::now(),
            }));
            let err = match self.inner.accept().await {
                Ok(conn) => break Ok(conn),
                Err(err) => err,
            };
            let Some(retry) = &self.retry else { break Err(err) };
            if !self.inner.is_temporary(&err) || retry.exhausted(attempt) {
                break Err(err);
            }

            self.track(&ctx, ConnectionEvent::AttemptFailed(ConnectionAttemptFailed {
                client: false,
                attempt,
                begin: start,
                end: Instant::now(),
                error: event::snapshot(&err),
                reason: FailureReason::from_io(&err),
            }));
            let state = jitter.get_or_insert_with(|| retry.jitter.start());
            let delay = retry.next_delay(state, attempt);
            tracing::debug!(listener = %self.name, attempt, ?delay, error = %err, "temporary accept error, retrying");
            retry.sleeper.sleep(delay).await;
            attempt += 1;
        };

        let conn = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                self.track(&ctx, ConnectionEvent::Failed(ConnectionFailed {
                    client: false,
                    attempts: attempt,
                    begin: start,
                    end: Instant::now(),
                    error: event::snapshot(&err),
                    reason: FailureReason::from_io(&err),
                }));
                return Err(err);
            }
        };

        let established = Instant::now();
        self.track(&ctx, ConnectionEvent::Established(ConnectionEstablished {
            client: false,
            attempts: attempt,
            begin: start,
            end: established,
            local_addr: conn.local_addr().ok(),
            remote_addr: conn.peer_addr().ok(),
        }));
        let conn = TrackedConnection::new(conn, ctx, self.tracker.clone(), false, established);

        if !self.keepalive.is_zero() {
            if let Err(source) = enable_keepalive(conn.get_ref(), self.keepalive) {
                // Dropping reports the connection closed.
                drop(conn);
                return Err(KeepAliveError { period: self.keepalive, source }.into_io());
            }
        }
        Ok(conn)
    }

    fn track(&self, ctx: &TagContext, event: ConnectionEvent) {
        tracker::emit(self.tracker.as_ref(), ctx, &event);
    }
}

/// Idle time and probe interval both follow `period`, where the platform lets us set them.
fn enable_keepalive<C: Connection>(conn: &C, period: Duration) -> io::Result<()> {
    let Some(socket) = conn.socket() else { return Ok(()) };
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "fuchsia",
        target_os = "illumos",
        target_os = "ios",
        target_os = "linux",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "windows",
    ))]
    let keepalive = keepalive.with_interval(period);
    socket.set_tcp_keepalive(&keepalive)
}

/// Builder for [`TrackedListener`].
pub struct TrackedListenerBuilder<L> {
    inner: L,
    name: String,
    trackers: Vec<SharedTracker>,
    retry: Option<AcceptRetry>,
    keepalive: Duration,
}

impl<L: Accept> TrackedListenerBuilder<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            name: DEFAULT_NAME.to_string(),
            trackers: Vec::new(),
            retry: None,
            keepalive: Duration::ZERO,
        }
    }

    /// Name reported to trackers (default `"default"`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a tracker. Several trackers are combined with [`tracker::chain`].
    pub fn tracker(mut self, tracker: SharedTracker) -> Self {
        self.trackers.push(tracker);
        self
    }

    /// Replace the configured trackers.
    pub fn trackers<I>(mut self, trackers: I) -> Self
    where
        I: IntoIterator<Item = SharedTracker>,
    {
        self.trackers = trackers.into_iter().collect();
        self
    }

    /// Retry temporary accept errors with `retry`. Without it, every error is final.
    pub fn retry(mut self, retry: AcceptRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Enable TCP keep-alive with `period` on accepted connections. Zero disables it.
    pub fn tcp_keepalive(mut self, period: Duration) -> Self {
        self.keepalive = period;
        self
    }

    pub fn build(self) -> Result<TrackedListener<L>, BuildError> {
        if self.name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        Ok(TrackedListener {
            inner: self.inner,
            name: self.name,
            tracker: tracker::chain(self.trackers),
            retry: self.retry,
            keepalive: self.keepalive,
        })
    }
}
