//! Tracker contract and composition.
//!
//! A [`ConnectionTracker`] observes lifecycle events. Trackers may additionally expose tagging
//! capabilities ([`DialerTagger`], [`ListenerTagger`]) through explicit capability queries;
//! the wrappers call them once per operation, before the first event, so a tracker can stash
//! per-operation data in the [`TagContext`] and read it back for every later event.
//!
//! # Composition
//!
//! [`chain`] combines any number of trackers:
//!
//! - no trackers: a [`NullTracker`],
//! - one tracker: that tracker, unchanged,
//! - more: a [`TrackerChain`] that broadcasts events in order and folds tagging left to right.
//!
//! A tracker that panics is isolated: the panic is logged and the remaining trackers still
//! run.
//!
//! ```rust
//! use conntrack::tracker::{chain, MemoryTracker, NullTracker, SharedTracker};
//! use std::sync::Arc;
//!
//! let memory = MemoryTracker::new();
//! let tracker: SharedTracker = chain(vec![
//!     Arc::new(NullTracker) as SharedTracker,
//!     Arc::new(memory.clone()),
//! ]);
//! # let _ = tracker;
//! ```

pub mod builtin;

pub use builtin::{FnTracker, MemoryTracker, NullTracker, StreamingTracker, TrackedRecord};

use crate::context::TagContext;
use crate::event::ConnectionEvent;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Observer of connection lifecycle events.
///
/// `track_connection` is called synchronously on the connection's hot path and must not
/// block. There is no acknowledgement and no backpressure.
pub trait ConnectionTracker: Send + Sync {
    /// Consume one event for the operation identified by `ctx`.
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent);

    /// Dialer tagging capability, if implemented.
    fn as_dialer_tagger(&self) -> Option<&dyn DialerTagger> {
        None
    }

    /// Listener tagging capability, if implemented.
    fn as_listener_tagger(&self) -> Option<&dyn ListenerTagger> {
        None
    }
}

/// Shared handle to a tracker.
pub type SharedTracker = Arc<dyn ConnectionTracker>;

/// Data handed to [`DialerTagger::tag_dialer_connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialerTagInfo {
    /// Dialer name (configured, or overridden through the caller's context).
    pub name: String,
    /// Network passed to the dial, e.g. `tcp`.
    pub network: String,
    /// Address passed to the dial.
    pub addr: String,
}

/// Data handed to [`ListenerTagger::tag_listener_connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerTagInfo {
    /// Listener name.
    pub name: String,
}

/// Tags the context of an outbound connection before its first event.
pub trait DialerTagger: Send + Sync {
    fn tag_dialer_connection(&self, ctx: TagContext, info: &DialerTagInfo) -> TagContext;
}

/// Tags the context of an inbound connection before its first event.
pub trait ListenerTagger: Send + Sync {
    fn tag_listener_connection(&self, ctx: TagContext, info: &ListenerTagInfo) -> TagContext;
}

/// Apply the dialer tagging capability of `tracker`, if any. A panicking tagger leaves `ctx`
/// unchanged.
pub fn tag_dialer(tracker: &dyn ConnectionTracker, ctx: TagContext, info: &DialerTagInfo) -> TagContext {
    match tracker.as_dialer_tagger() {
        Some(tagger) => {
            let input = ctx.clone();
            isolate("tag_dialer_connection", 0, || tagger.tag_dialer_connection(input, info))
                .unwrap_or(ctx)
        }
        None => ctx,
    }
}

/// Apply the listener tagging capability of `tracker`, if any. A panicking tagger leaves `ctx`
/// unchanged.
pub fn tag_listener(
    tracker: &dyn ConnectionTracker,
    ctx: TagContext,
    info: &ListenerTagInfo,
) -> TagContext {
    match tracker.as_listener_tagger() {
        Some(tagger) => {
            let input = ctx.clone();
            isolate("tag_listener_connection", 0, || tagger.tag_listener_connection(input, info))
                .unwrap_or(ctx)
        }
        None => ctx,
    }
}

/// Deliver `event` to `tracker`, containing a panic to the tracker.
pub(crate) fn emit(tracker: &dyn ConnectionTracker, ctx: &TagContext, event: &ConnectionEvent) {
    isolate("track_connection", 0, || tracker.track_connection(ctx, event));
}

/// Combine trackers into one.
///
/// Zero trackers yield a [`NullTracker`]; a single tracker is returned as-is.
pub fn chain<I>(trackers: I) -> SharedTracker
where
    I: IntoIterator<Item = SharedTracker>,
{
    let mut trackers: Vec<SharedTracker> = trackers.into_iter().collect();
    match trackers.len() {
        0 => Arc::new(NullTracker),
        1 => trackers.swap_remove(0),
        _ => Arc::new(TrackerChain::new(trackers)),
    }
}

/// Broadcasts events to several trackers in order.
pub struct TrackerChain {
    trackers: Vec<SharedTracker>,
}

impl TrackerChain {
    pub fn new(trackers: Vec<SharedTracker>) -> Self {
        Self { trackers }
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl std::fmt::Debug for TrackerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerChain").field("trackers", &self.trackers.len()).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Run one tracker hook, containing a panic to that tracker.
fn isolate<R>(hook: &'static str, index: usize, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            tracing::warn!(
                tracker = index,
                hook,
                panic = panic_message(payload.as_ref()),
                "connection tracker panicked"
            );
            None
        }
    }
}

impl ConnectionTracker for TrackerChain {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        for (index, tracker) in self.trackers.iter().enumerate() {
            isolate("track_connection", index, || tracker.track_connection(ctx, event));
        }
    }

    fn as_dialer_tagger(&self) -> Option<&dyn DialerTagger> {
        Some(self)
    }

    fn as_listener_tagger(&self) -> Option<&dyn ListenerTagger> {
        Some(self)
    }
}

impl DialerTagger for TrackerChain {
    fn tag_dialer_connection(&self, mut ctx: TagContext, info: &DialerTagInfo) -> TagContext {
        for (index, tracker) in self.trackers.iter().enumerate() {
            if let Some(tagger) = tracker.as_dialer_tagger() {
                let input = ctx.clone();
                if let Some(tagged) =
                    isolate("tag_dialer_connection", index, || tagger.tag_dialer_connection(input, info))
                {
                    ctx = tagged;
                }
            }
        }
        ctx
    }
}

impl ListenerTagger for TrackerChain {
    fn tag_listener_connection(&self, mut ctx: TagContext, info: &ListenerTagInfo) -> TagContext {
        for (index, tracker) in self.trackers.iter().enumerate() {
            if let Some(tagger) = tracker.as_listener_tagger() {
                let input = ctx.clone();
                if let Some(tagged) = isolate("tag_listener_connection", index, || {
                    tagger.tag_listener_connection(input, info)
                }) {
                    ctx = tagged;
                }
            }
        }
        ctx
    }
}
