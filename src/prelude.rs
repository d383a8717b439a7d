//! Convenient re-exports for common conntrack types.
pub use crate::{
    backoff::{Backoff, BackoffStrategy, MAX_BACKOFF},
    conn::{Connection, TrackedConnection},
    context::TagContext,
    dialer::{Dial, DialFn, DialRequest, DialTrackingLayer, TcpDialer, TrackedDialer},
    error::{BackoffError, BuildError, KeepAliveError},
    event::ConnectionEvent,
    failure::{FailureReason, ResolveError, TemporaryError},
    jitter::Jitter,
    listener::{Accept, AcceptRetry, TrackedListener},
    logging::LogTracker,
    sleeper::{Sleeper, TokioSleeper},
    tracker::{
        chain, ConnectionTracker, DialerTagInfo, DialerTagger, ListenerTagInfo, ListenerTagger,
        MemoryTracker, SharedTracker, StreamingTracker,
    },
};
