//! Outbound connection tracking.
//!
//! [`TrackedDialer`] wraps a [`Dial`] implementation and reports every dial as
//! `Attempt(1)` followed by either `AttemptFailed(1)` + `Failed(1)` or `Established(1)`. There is
//! no retry on the dial side. Established connections come back as
//! [`TrackedConnection`]s, which report `Closed` later.
//!
//! The tracked part of a dial runs on its own tokio task. Dropping the future returned by
//! [`TrackedDialer::dial`] does not abort the dial or its events: the event stream still ends in
//! a terminal event, and a connection established after the caller went away is dropped (and
//! reported closed).
//!
//! ```rust,no_run
//! use conntrack::context::TagContext;
//! use conntrack::dialer::TrackedDialer;
//! use conntrack::tracker::MemoryTracker;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let memory = MemoryTracker::new();
//! let dialer = TrackedDialer::builder()
//!     .name("upstream")
//!     .tracker(Arc::new(memory.clone()))
//!     .build()?;
//!
//! let conn = dialer.dial(&TagContext::new(), "tcp", "127.0.0.1:8080").await?;
//! conn.close().await?;
//! assert_eq!(memory.kinds(), vec!["attempt", "established", "closed"]);
//! # Ok(())
//! # }
//! ```

use crate::conn::{Connection, TrackedConnection};
use crate::context::TagContext;
use crate::error::BuildError;
use crate::event::{
    self, ConnectionAttempt, ConnectionAttemptFailed, ConnectionEstablished, ConnectionEvent,
    ConnectionFailed,
};
use crate::failure::{Cancelled, FailureReason, ResolveError};
use crate::tracker::{self, DialerTagInfo, SharedTracker};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Name used when none is configured.
pub const DEFAULT_NAME: &str = "default";

/// Establishes outbound connections.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Conn: Connection;

    /// Connect to `addr` over `network`. `ctx` is the tagged context of this dial.
    async fn dial(&self, ctx: &TagContext, network: &str, addr: &str) -> io::Result<Self::Conn>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn from_network(network: &str) -> io::Result<Self> {
        match network {
            "tcp" => Ok(Family::Any),
            "tcp4" => Ok(Family::V4),
            "tcp6" => Ok(Family::V6),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {other:?}"),
            )),
        }
    }

    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Plain TCP dialer for the `tcp`, `tcp4` and `tcp6` networks.
///
/// Host names are resolved with the system resolver; a lookup failure is reported as a
/// [`ResolveError`]. Resolved addresses are tried in order until one connects.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each connect attempt. An expired attempt fails with `TimedOut`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set `TCP_NODELAY` on connected streams.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    async fn resolve(addr: &str, family: Family) -> io::Result<Vec<SocketAddr>> {
        if let Ok(literal) = addr.parse::<SocketAddr>() {
            if !family.accepts(&literal) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("address {literal} does not match the requested network"),
                ));
            }
            return Ok(vec![literal]);
        }
        let Some((host, _port)) = addr.rsplit_once(':') else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("missing port in address {addr:?}"),
            ));
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(|err| ResolveError::new(host, err).into_io())?;
        let candidates: Vec<SocketAddr> = resolved.filter(|a| family.accepts(a)).collect();
        if candidates.is_empty() {
            return Err(ResolveError::new(
                host,
                io::Error::new(io::ErrorKind::NotFound, "no suitable address found"),
            )
            .into_io());
        }
        Ok(candidates)
    }

    async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|elapsed| io::Error::new(io::ErrorKind::TimedOut, elapsed))??,
            None => TcpStream::connect(addr).await?,
        };
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dial for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, _ctx: &TagContext, network: &str, addr: &str) -> io::Result<TcpStream> {
        let family = Family::from_network(network)?;
        let candidates = Self::resolve(addr, family).await?;
        let mut last_err = None;
        for candidate in candidates {
            match self.connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }
}

/// Adapts an async closure into a [`Dial`].
///
/// ```rust
/// use conntrack::dialer::DialFn;
/// use std::io;
/// use tokio::net::TcpStream;
///
/// let dial = DialFn::new(|_ctx, _network, addr: String| async move {
///     TcpStream::connect(addr).await
/// });
/// # let _ = dial;
/// ```
pub struct DialFn<F> {
    f: F,
}

impl<F> DialFn<F> {
    pub fn new<Fut, C>(f: F) -> Self
    where
        F: Fn(TagContext, String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = io::Result<C>> + Send + 'static,
        C: Connection,
    {
        Self { f }
    }
}

impl<F> std::fmt::Debug for DialFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, C> Dial for DialFn<F>
where
    F: Fn(TagContext, String, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
    C: Connection,
{
    type Conn = C;

    async fn dial(&self, ctx: &TagContext, network: &str, addr: &str) -> io::Result<C> {
        (self.f)(ctx.clone(), network.to_owned(), addr.to_owned()).await
    }
}

/// A dialer that reports its connections to a tracker.
pub struct TrackedDialer<D = TcpDialer> {
    name: String,
    tracker: SharedTracker,
    dialer: Arc<D>,
}

impl<D> Clone for TrackedDialer<D> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), tracker: self.tracker.clone(), dialer: self.dialer.clone() }
    }
}

impl<D> std::fmt::Debug for TrackedDialer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedDialer")
            .field("name", &self.name)
            .field("dialer", &std::any::type_name::<D>())
            .finish()
    }
}

impl TrackedDialer<TcpDialer> {
    /// Builder with the default name, no trackers and a [`TcpDialer`].
    pub fn builder() -> TrackedDialerBuilder<TcpDialer> {
        TrackedDialerBuilder::new()
    }
}

impl<D: Dial> TrackedDialer<D> {
    /// Configured name, used unless the caller's context carries a dialer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> &SharedTracker {
        &self.tracker
    }

    pub fn get_ref(&self) -> &D {
        &self.dialer
    }

    /// Dial `addr` over `network`, tracking the attempt.
    ///
    /// A non-empty dialer name in `ctx` overrides the configured name for this dial. The
    /// underlying error is returned unchanged.
    pub async fn dial(
        &self,
        ctx: &TagContext,
        network: &str,
        addr: &str,
    ) -> io::Result<TrackedConnection<D::Conn>> {
        let (name, ctx) = match ctx.dialer_name() {
            Some(name) if !name.is_empty() => (name.to_owned(), ctx.clone()),
            _ => (self.name.clone(), ctx.with_dialer_name(self.name.clone())),
        };
        let info = DialerTagInfo { name, network: network.to_owned(), addr: addr.to_owned() };
        let task = tokio::spawn(track_dial(self.dialer.clone(), self.tracker.clone(), ctx, info));
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Cancelled.into_io()),
        }
    }
}

async fn track_dial<D: Dial>(
    dialer: Arc<D>,
    tracker: SharedTracker,
    ctx: TagContext,
    info: DialerTagInfo,
) -> io::Result<TrackedConnection<D::Conn>> {
    let ctx = tracker::tag_dialer(tracker.as_ref(), ctx, &info);

    let begin = Instant::now();
    tracker::emit(
        tracker.as_ref(),
        &ctx,
        &ConnectionEvent::Attempt(ConnectionAttempt { client: true, attempt: 1, begin }),
    );

    match dialer.dial(&ctx, &info.network, &info.addr).await {
        Err(err) => {
            let end = Instant::now();
            let reason = FailureReason::from_io(&err);
            let error = event::snapshot(&err);
            tracker::emit(
                tracker.as_ref(),
                &ctx,
                &ConnectionEvent::AttemptFailed(ConnectionAttemptFailed {
                    client: true,
                    attempt: 1,
                    begin,
                    end,
                    error: error.clone(),
                    reason,
                }),
            );
            tracker::emit(
                tracker.as_ref(),
                &ctx,
                &ConnectionEvent::Failed(ConnectionFailed {
                    client: true,
                    attempts: 1,
                    begin,
                    end,
                    error,
                    reason,
                }),
            );
            Err(err)
        }
        Ok(conn) => {
            let established = Instant::now();
            tracker::emit(
                tracker.as_ref(),
                &ctx,
                &ConnectionEvent::Established(ConnectionEstablished {
                    client: true,
                    attempts: 1,
                    begin,
                    end: established,
                    local_addr: conn.local_addr().ok(),
                    remote_addr: conn.peer_addr().ok(),
                }),
            );
            Ok(TrackedConnection::new(conn, ctx, tracker, true, established))
        }
    }
}

/// Builder for [`TrackedDialer`].
pub struct TrackedDialerBuilder<D> {
    name: String,
    trackers: Vec<SharedTracker>,
    dialer: D,
}

impl TrackedDialerBuilder<TcpDialer> {
    pub fn new() -> Self {
        Self { name: DEFAULT_NAME.to_string(), trackers: Vec::new(), dialer: TcpDialer::new() }
    }
}

impl Default for TrackedDialerBuilder<TcpDialer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dial> TrackedDialerBuilder<D> {
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

    /// Use `dialer` for the actual connects.
    pub fn dialer<D2: Dial>(self, dialer: D2) -> TrackedDialerBuilder<D2> {
        TrackedDialerBuilder { name: self.name, trackers: self.trackers, dialer }
    }

    pub fn build(self) -> Result<TrackedDialer<D>, BuildError> {
        if self.name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        Ok(TrackedDialer {
            name: self.name,
            tracker: tracker::chain(self.trackers),
            dialer: Arc::new(self.dialer),
        })
    }
}

/// Request type for the `tower` service form of [`TrackedDialer`].
#[derive(Debug, Clone)]
pub struct DialRequest {
    pub ctx: TagContext,
    pub network: String,
    pub addr: String,
}

impl DialRequest {
    pub fn new(network: impl Into<String>, addr: impl Into<String>) -> Self {
        Self { ctx: TagContext::new(), network: network.into(), addr: addr.into() }
    }

    /// A `tcp` dial to `addr`.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::new("tcp", addr)
    }

    pub fn with_context(mut self, ctx: TagContext) -> Self {
        self.ctx = ctx;
        self
    }
}

impl<D: Dial> tower_service::Service<DialRequest> for TrackedDialer<D> {
    type Response = TrackedConnection<D::Conn>;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<Self::Response>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DialRequest) -> Self::Future {
        let dialer = self.clone();
        Box::pin(async move { dialer.dial(&req.ctx, &req.network, &req.addr).await })
    }
}

/// `tower` layer that wraps any [`Dial`] into a [`TrackedDialer`].
#[derive(Clone)]
pub struct DialTrackingLayer {
    name: String,
    tracker: SharedTracker,
}

impl DialTrackingLayer {
    /// A layer naming its dialers `name`. Empty names are rejected, as in
    /// [`TrackedDialerBuilder::build`].
    pub fn new(name: impl Into<String>) -> Result<Self, BuildError> {
        let name = name.into();
        if name.is_empty() {
            return Err(BuildError::EmptyName);
        }
        Ok(Self { name, tracker: tracker::chain(Vec::new()) })
    }

    pub fn with_trackers<I>(mut self, trackers: I) -> Self
    where
        I: IntoIterator<Item = SharedTracker>,
    {
        self.tracker = tracker::chain(trackers);
        self
    }
}

impl std::fmt::Debug for DialTrackingLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialTrackingLayer").field("name", &self.name).finish()
    }
}

impl<D: Dial> tower_layer::Layer<D> for DialTrackingLayer {
    type Service = TrackedDialer<D>;

    fn layer(&self, inner: D) -> Self::Service {
        TrackedDialer { name: self.name.clone(), tracker: self.tracker.clone(), dialer: Arc::new(inner) }
    }
}
