//! Connections handed out by the tracked dialer and listener.
//!
//! [`TrackedConnection`] delegates I/O to the underlying connection and emits exactly one
//! `Closed` event for it: from [`TrackedConnection::close`], or from `Drop` when the
//! connection is dropped without an explicit close. `close` consumes the connection, so a
//! second close cannot happen.

use crate::context::TagContext;
use crate::event::{self, ConnectionClosed, ConnectionEvent};
use crate::tracker::{self, SharedTracker};
use pin_project::{pin_project, pinned_drop};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// A byte stream with addresses, as produced by dialers and listeners.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// The underlying TCP socket, for connections that have one. Used to configure
    /// keep-alive on accepted connections.
    fn socket(&self) -> Option<SockRef<'_>> {
        None
    }
}

impl Connection for tokio::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self)
    }

    fn socket(&self) -> Option<SockRef<'_>> {
        Some(SockRef::from(self))
    }
}

/// A connection whose close is reported to the tracker.
#[pin_project(PinnedDrop)]
pub struct TrackedConnection<C> {
    #[pin]
    inner: C,
    ctx: TagContext,
    tracker: SharedTracker,
    client: bool,
    established: Instant,
    closed: bool,
}

impl<C> TrackedConnection<C> {
    pub(crate) fn new(
        inner: C,
        ctx: TagContext,
        tracker: SharedTracker,
        client: bool,
        established: Instant,
    ) -> Self {
        Self { inner, ctx, tracker, client, established, closed: false }
    }

    /// The context the connection's events are tracked under.
    pub fn context(&self) -> &TagContext {
        &self.ctx
    }

    /// When the connection was established; the `begin` of its `Closed` event.
    pub fn established_at(&self) -> Instant {
        self.established
    }

    /// True for dialed connections, false for accepted ones.
    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C
    where
        C: Unpin,
    {
        &mut self.inner
    }
}

fn emit_closed(
    tracker: &SharedTracker,
    ctx: &TagContext,
    client: bool,
    established: Instant,
    error: Option<&io::Error>,
) {
    tracker::emit(
        tracker.as_ref(),
        ctx,
        &ConnectionEvent::Closed(ConnectionClosed {
            client,
            begin: established,
            end: Instant::now(),
            error: error.map(event::snapshot),
        }),
    );
}

impl<C: Connection> TrackedConnection<C> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Shut down the connection and emit its `Closed` event.
    ///
    /// The event is emitted whether or not the shutdown fails; a failure is reported in the
    /// event and returned to the caller.
    pub async fn close(mut self) -> io::Result<()> {
        let result = self.inner.shutdown().await;
        self.closed = true;
        emit_closed(&self.tracker, &self.ctx, self.client, self.established, result.as_ref().err());
        result
    }
}

#[pinned_drop]
impl<C> PinnedDrop for TrackedConnection<C> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if !*this.closed {
            *this.closed = true;
            emit_closed(this.tracker, this.ctx, *this.client, *this.established, None);
        }
    }
}

impl<C> std::fmt::Debug for TrackedConnection<C>
where
    C: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("inner", &self.inner)
            .field("client", &self.client)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<C: AsyncRead> AsyncRead for TrackedConnection<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<C: AsyncWrite> AsyncWrite for TrackedConnection<C> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

impl<C: Connection> Connection for TrackedConnection<C> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn socket(&self) -> Option<SockRef<'_>> {
        self.inner.socket()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::MemoryTracker;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// In-memory connection with fixed addresses and an optional shutdown failure.
    struct Pipe {
        io: DuplexStream,
        fail_shutdown: bool,
    }

    impl AsyncRead for Pipe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Pipe {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.io).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if self.fail_shutdown {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::NotConnected)));
            }
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    impl Connection for Pipe {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:1000".parse().unwrap())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:2000".parse().unwrap())
        }
    }

    fn tracked(fail_shutdown: bool) -> (TrackedConnection<Pipe>, DuplexStream, MemoryTracker) {
        let (a, b) = tokio::io::duplex(64);
        let memory = MemoryTracker::new();
        let conn = TrackedConnection::new(
            Pipe { io: a, fail_shutdown },
            TagContext::new(),
            Arc::new(memory.clone()),
            true,
            Instant::now(),
        );
        (conn, b, memory)
    }

    #[tokio::test]
    async fn close_emits_exactly_one_closed_event() {
        let (conn, _peer, memory) = tracked(false);
        let established = conn.established_at();
        tokio::time::sleep(Duration::from_millis(2)).await;
        conn.close().await.unwrap();

        let events = memory.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ConnectionEvent::Closed(closed) => {
                assert!(closed.client);
                assert_eq!(closed.begin, established);
                assert!(closed.end > closed.begin);
                assert!(closed.error.is_none());
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn close_error_is_reported_and_returned() {
        let (conn, _peer, memory) = tracked(true);
        let err = conn.close().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let events = memory.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ConnectionEvent::Closed(closed) => {
                assert_eq!(closed.error.as_ref().map(|e| e.kind()), Some(io::ErrorKind::NotConnected));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn drop_without_close_emits_closed() {
        let (conn, _peer, memory) = tracked(false);
        drop(conn);
        assert_eq!(memory.kinds(), vec!["closed"]);
    }

    #[tokio::test]
    async fn io_is_delegated() {
        use tokio::io::AsyncWriteExt;

        let (mut conn, mut peer, memory) = tracked(false);
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(conn.peer_addr().unwrap().port(), 2000);
        assert!(memory.is_empty());
    }
}
