use super::{ConnectionTracker, DialerTagInfo, DialerTagger, ListenerTagInfo, ListenerTagger};
use crate::context::TagContext;
use crate::event::ConnectionEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A tracker that discards all events. Used when tracking is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullTracker;

impl ConnectionTracker for NullTracker {
    fn track_connection(&self, _ctx: &TagContext, _event: &ConnectionEvent) {}
}

/// Adapts a closure into a [`ConnectionTracker`].
///
/// ```rust
/// use conntrack::context::TagContext;
/// use conntrack::event::ConnectionEvent;
/// use conntrack::tracker::FnTracker;
///
/// let tracker = FnTracker::new(|_ctx: &TagContext, event: &ConnectionEvent| {
///     println!("{event}");
/// });
/// # let _ = tracker;
/// ```
#[derive(Clone)]
pub struct FnTracker<F> {
    f: F,
}

impl<F> FnTracker<F>
where
    F: Fn(&TagContext, &ConnectionEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnTracker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTracker").finish_non_exhaustive()
    }
}

impl<F> ConnectionTracker for FnTracker<F>
where
    F: Fn(&TagContext, &ConnectionEvent) + Send + Sync,
{
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        (self.f)(ctx, event)
    }
}

/// An event together with the context it was tracked under.
#[derive(Clone, Debug)]
pub struct TrackedRecord {
    pub context: TagContext,
    pub event: ConnectionEvent,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: VecDeque<TrackedRecord>,
    dialer_tags: VecDeque<DialerTagInfo>,
    listener_tags: VecDeque<ListenerTagInfo>,
}

/// Append `item`, dropping the oldest entry once `capacity` is reached. Returns whether an
/// entry was dropped.
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) -> bool {
    let full = queue.len() >= capacity;
    if full {
        queue.pop_front();
    }
    queue.push_back(item);
    full
}

/// A tracker that stores events in memory.
///
/// Useful for testing and debugging. It also implements both tagging capabilities, recording
/// the tag info it was handed and returning the context unchanged. Records and tag calls are
/// each capped at `capacity`, oldest first out.
///
/// ```rust
/// use conntrack::context::TagContext;
/// use conntrack::event::{ConnectionAttempt, ConnectionEvent};
/// use conntrack::tracker::{ConnectionTracker, MemoryTracker};
/// use std::time::Instant;
///
/// let tracker = MemoryTracker::new();
/// let event = ConnectionEvent::Attempt(ConnectionAttempt {
///     client: true,
///     attempt: 1,
///     begin: Instant::now(),
/// });
/// tracker.track_connection(&TagContext::new(), &event);
/// assert_eq!(tracker.kinds(), vec!["attempt"]);
/// ```
#[derive(Clone, Debug)]
pub struct MemoryTracker {
    state: Arc<Mutex<MemoryState>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryTracker {
    /// Creates a bounded memory tracker (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Creates a bounded memory tracker with explicit capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of all events received so far.
    pub fn events(&self) -> Vec<ConnectionEvent> {
        lock(&self.state).records.iter().map(|r| r.event.clone()).collect()
    }

    /// Snapshot of all events with the context each was tracked under.
    pub fn records(&self) -> Vec<TrackedRecord> {
        lock(&self.state).records.iter().cloned().collect()
    }

    /// Variant labels of the recorded events, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.state).records.iter().map(|r| r.event.kind()).collect()
    }

    /// The most recent dialer tag calls, up to `capacity`.
    pub fn dialer_tags(&self) -> Vec<DialerTagInfo> {
        lock(&self.state).dialer_tags.iter().cloned().collect()
    }

    /// The most recent listener tag calls, up to `capacity`.
    pub fn listener_tags(&self) -> Vec<ListenerTagInfo> {
        lock(&self.state).listener_tags.iter().cloned().collect()
    }

    /// Clears recorded events and tag calls.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.records.clear();
        state.dialer_tags.clear();
        state.listener_tags.clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of records evicted because the tracker was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Wait until at least `count` events were recorded or `timeout` elapses.
    /// Returns whether the count was reached.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker for MemoryTracker {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        let record = TrackedRecord { context: ctx.clone(), event: event.clone() };
        if push_bounded(&mut lock(&self.state).records, record, self.capacity) {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn as_dialer_tagger(&self) -> Option<&dyn DialerTagger> {
        Some(self)
    }

    fn as_listener_tagger(&self) -> Option<&dyn ListenerTagger> {
        Some(self)
    }
}

impl DialerTagger for MemoryTracker {
    fn tag_dialer_connection(&self, ctx: TagContext, info: &DialerTagInfo) -> TagContext {
        push_bounded(&mut lock(&self.state).dialer_tags, info.clone(), self.capacity);
        ctx
    }
}

impl ListenerTagger for MemoryTracker {
    fn tag_listener_connection(&self, ctx: TagContext, info: &ListenerTagInfo) -> TagContext {
        push_bounded(&mut lock(&self.state).listener_tags, info.clone(), self.capacity);
        ctx
    }
}

/// A tracker that broadcasts records to any number of subscribers.
///
/// Uses `tokio::sync::broadcast`; receivers that fall behind miss records. Sends never block
/// the connection path.
///
/// ```rust
/// use conntrack::context::TagContext;
/// use conntrack::event::{ConnectionAttempt, ConnectionEvent};
/// use conntrack::tracker::{ConnectionTracker, StreamingTracker};
/// use std::time::Instant;
///
/// # #[tokio::main]
/// # async fn main() {
/// let tracker = StreamingTracker::new(16);
/// let mut rx = tracker.subscribe();
/// let event = ConnectionEvent::Attempt(ConnectionAttempt {
///     client: false,
///     attempt: 1,
///     begin: Instant::now(),
/// });
/// tracker.track_connection(&TagContext::new().with_listener_name("http"), &event);
/// let record = rx.recv().await.unwrap();
/// assert_eq!(record.context.listener_name(), Some("http"));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct StreamingTracker {
    sender: tokio::sync::broadcast::Sender<TrackedRecord>,
    dropped: Arc<AtomicU64>,
    last_drop_ns: Arc<AtomicU64>,
}

impl StreamingTracker {
    /// Creates a streaming tracker buffering up to `capacity` records per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receive every record tracked after this call.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TrackedRecord> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Records dropped because nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Timestamp of the last drop, if any.
    pub fn last_drop(&self) -> Option<SystemTime> {
        match self.last_drop_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => UNIX_EPOCH.checked_add(Duration::from_nanos(ns)),
        }
    }
}

impl ConnectionTracker for StreamingTracker {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        let record = TrackedRecord { context: ctx.clone(), event: event.clone() };
        if self.sender.send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            self.last_drop_ns.store(u64::try_from(now.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
    }
}
