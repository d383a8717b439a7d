#![forbid(unsafe_code)]

//! # conntrack
//!
//! Connection lifecycle tracking for tokio dialers and listeners.
//!
//! Wrap a dialer or a listener and every connection it produces reports the same stream of
//! events to one or more [`ConnectionTracker`]s:
//!
//! - `Attempt` for each dial or accept try,
//! - `AttemptFailed` for each try that failed, with a classified [`FailureReason`],
//! - one terminal `Failed` or `Established`,
//! - `Closed` once an established connection is closed or dropped.
//!
//! The wrappers never change what the caller sees: connections behave like the wrapped ones
//! and errors come back unchanged.
//!
//! ## Features
//!
//! - **Tracked dialer** with per-call name override, also usable as a `tower` service
//! - **Tracked listener** with retry/backoff for temporary accept errors and TCP keep-alive
//! - **Tracker composition** with panic isolation and per-operation context tagging
//! - **Built-in trackers**: memory, streaming, closure, and `tracing` logs
//! - **Prometheus metrics** in the `conntrack-prometheus` crate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conntrack::prelude::*;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TrackedListener::builder(TcpListener::bind("127.0.0.1:0").await?)
//!         .name("echo")
//!         .tracker(Arc::new(LogTracker::new()))
//!         .retry(AcceptRetry::builder().build()?)
//!         .build()?;
//!
//!     let dialer = TrackedDialer::builder()
//!         .name("echo-client")
//!         .tracker(Arc::new(LogTracker::new()))
//!         .build()?;
//!
//!     let addr = listener.local_addr()?.to_string();
//!     let ctx = TagContext::new();
//!     let (client, server) = tokio::join!(
//!         dialer.dial(&ctx, "tcp", &addr),
//!         listener.accept(),
//!     );
//!     client?.close().await?;
//!     server?.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod conn;
pub mod context;
pub mod dialer;
pub mod error;
pub mod event;
pub mod failure;
pub mod jitter;
pub mod listener;
pub mod logging;
pub mod prelude;
pub mod sleeper;
pub mod tracker;

// Re-exports
pub use backoff::{Backoff, BackoffStrategy};
pub use conn::{Connection, TrackedConnection};
pub use context::{DialerName, ListenerName, TagContext};
pub use dialer::{Dial, DialFn, DialRequest, DialTrackingLayer, TcpDialer, TrackedDialer};
pub use error::{BackoffError, BuildError, KeepAliveError};
pub use event::{
    ConnectionAttempt, ConnectionAttemptFailed, ConnectionClosed, ConnectionEstablished,
    ConnectionEvent, ConnectionFailed,
};
pub use failure::{classify, Cancelled, FailureReason, ResolveError, TemporaryError};
pub use jitter::Jitter;
pub use listener::{Accept, AcceptRetry, TrackedListener};
pub use logging::LogTracker;
pub use sleeper::{RecordingSleeper, Sleeper, TokioSleeper};
pub use tracker::{chain, ConnectionTracker, SharedTracker};
