//! Per-operation tagging context.
//!
//! A [`TagContext`] is an immutable, append-only chain of typed values. Every dial or accept
//! derives its own context before its first event; trackers tag it (see
//! [`DialerTagger`](crate::tracker::DialerTagger)) and read their values back while handling
//! that operation's events. Appending never mutates an existing context, so values can't leak
//! into unrelated operations.
//!
//! ```rust
//! use conntrack::context::TagContext;
//!
//! #[derive(Debug, PartialEq)]
//! struct RequestId(u64);
//!
//! let base = TagContext::new();
//! let tagged = base.with(RequestId(7));
//! assert_eq!(tagged.get::<RequestId>(), Some(&RequestId(7)));
//! assert!(base.get::<RequestId>().is_none());
//! ```

use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

struct Node {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    parent: Option<Arc<Node>>,
}

/// Immutable, append-only key/value chain keyed by type.
#[derive(Clone, Default)]
pub struct TagContext {
    head: Option<Arc<Node>>,
    len: usize,
}

impl TagContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with `value` appended. `self` is left unchanged.
    pub fn with<T: Any + Send + Sync>(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Node {
                value: Arc::new(value),
                type_name: type_name::<T>(),
                parent: self.head.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// The most recently appended value of type `T`, if any.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.nodes().find_map(|node| node.value.as_ref().downcast_ref::<T>())
    }

    /// Whether a value of type `T` has been appended.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Number of appended values, including shadowed ones.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a dialer name. A non-empty name in the context passed to
    /// [`TrackedDialer::dial`](crate::dialer::TrackedDialer::dial) overrides the configured one.
    pub fn with_dialer_name(&self, name: impl Into<String>) -> Self {
        self.with(DialerName(name.into()))
    }

    /// The dialer name, if one was set.
    pub fn dialer_name(&self) -> Option<&str> {
        self.get::<DialerName>().map(|n| n.0.as_str())
    }

    /// Append a listener name.
    pub fn with_listener_name(&self, name: impl Into<String>) -> Self {
        self.with(ListenerName(name.into()))
    }

    /// The listener name, if one was set.
    pub fn listener_name(&self) -> Option<&str> {
        self.get::<ListenerName>().map(|n| n.0.as_str())
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(self.head.as_deref(), |node| node.parent.as_deref())
    }
}

impl fmt::Debug for TagContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.nodes().map(|n| n.type_name).collect();
        names.reverse();
        f.debug_struct("TagContext").field("values", &names).finish()
    }
}

/// Name of the dialer that started the operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialerName(pub String);

/// Name of the listener that accepted the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerName(pub String);
