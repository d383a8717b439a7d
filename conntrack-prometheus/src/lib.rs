//! Prometheus metrics for `conntrack` dialers and listeners.
//! Bring your own `prometheus::Registry`; collectors are registered into it at build time.
//!
//! ```rust
//! use conntrack::TrackedDialer;
//! use conntrack_prometheus::DialerMetrics;
//! use prometheus::Registry;
//!
//! let registry = Registry::new();
//! let metrics = DialerMetrics::new(&registry).unwrap();
//! metrics.initialize(&["upstream"]);
//!
//! let dialer = TrackedDialer::builder()
//!     .name("upstream")
//!     .tracker(metrics.tracker())
//!     .build()
//!     .unwrap();
//! # let _ = dialer;
//! ```

use conntrack::context::TagContext;
use conntrack::event::ConnectionEvent;
use conntrack::failure::FailureReason;
use conntrack::tracker::{ConnectionTracker, SharedTracker};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Default metric namespace.
pub const DEFAULT_NAMESPACE: &str = "net";
/// Default metric subsystem.
pub const DEFAULT_SUBSYSTEM: &str = "conntrack";

/// Naming options shared by every metric of one collector.
#[derive(Debug, Clone)]
struct MetricOptions {
    namespace: String,
    subsystem: String,
    const_labels: HashMap<String, String>,
    lifetime_buckets: Option<Vec<f64>>,
}

impl Default for MetricOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            subsystem: DEFAULT_SUBSYSTEM.to_string(),
            const_labels: HashMap::new(),
            lifetime_buckets: None,
        }
    }
}

impl MetricOptions {
    fn counter(&self, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
        IntCounterVec::new(self.opts(name, help), labels)
    }

    fn gauge(&self, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntGaugeVec> {
        IntGaugeVec::new(self.opts(name, help), labels)
    }

    fn opts(&self, name: &str, help: &str) -> Opts {
        Opts::new(name, help)
            .namespace(self.namespace.clone())
            .subsystem(self.subsystem.clone())
            .const_labels(self.const_labels.clone())
    }

    fn lifetime(&self, name: &str, labels: &[&str]) -> prometheus::Result<Option<HistogramVec>> {
        let Some(buckets) = &self.lifetime_buckets else {
            return Ok(None);
        };
        let opts = HistogramOpts::new(
            name,
            "Histogram of lifetime (seconds) of a connection from established to closed.",
        )
        .namespace(self.namespace.clone())
        .subsystem(self.subsystem.clone())
        .const_labels(self.const_labels.clone())
        .buckets(buckets.clone());
        HistogramVec::new(opts, labels).map(Some)
    }
}

/// Metric names and help texts for one side of the connection.
struct Side {
    label: &'static str,
    attempted: (&'static str, &'static str),
    established: (&'static str, &'static str),
    failed: (&'static str, &'static str),
    closed: (&'static str, &'static str),
    open: (&'static str, &'static str),
    lifetime: &'static str,
}

const DIALER: Side = Side {
    label: "dialer_name",
    attempted: (
        "dialer_conn_attempted_total",
        "Total number of connections attempted by the given dialer of a given name.",
    ),
    established: (
        "dialer_conn_established_total",
        "Total number of connections successfully established by the given dialer of a given name.",
    ),
    failed: (
        "dialer_conn_failed_total",
        "Total number of connections failed to dial by the dialer of a given name.",
    ),
    closed: (
        "dialer_conn_closed_total",
        "Total number of connections closed which originated from the dialer of a given name.",
    ),
    open: (
        "dialer_conn_open",
        "Number of open connections which originated from the dialer of a given name.",
    ),
    lifetime: "dialer_conn_lifetime_seconds",
};

const LISTENER: Side = Side {
    label: "listener_name",
    attempted: (
        "listener_conn_attempted_total",
        "Total number of connections attempted to the given listener of a given name.",
    ),
    established: (
        "listener_conn_accepted_total",
        "Total number of connections opened to the listener of a given name.",
    ),
    failed: (
        "listener_conn_failed_total",
        "Total number of connections failed to accept to the listener of a given name.",
    ),
    closed: (
        "listener_conn_closed_total",
        "Total number of connections closed that were made to the listener of a given name.",
    ),
    open: ("listener_conn_open", "Number of open connections to the listener of a given name."),
    lifetime: "listener_conn_lifetime_seconds",
};

/// Counters, gauge and optional histogram for one side.
#[derive(Clone)]
struct ConnMetrics {
    client: bool,
    attempted: IntCounterVec,
    established: IntCounterVec,
    failed: IntCounterVec,
    closed: IntCounterVec,
    open: IntGaugeVec,
    lifetime: Option<HistogramVec>,
}

impl ConnMetrics {
    fn new(side: &Side, client: bool, options: &MetricOptions) -> prometheus::Result<Self> {
        let name = [side.label];
        Ok(Self {
            client,
            attempted: options.counter(side.attempted.0, side.attempted.1, &name)?,
            established: options.counter(side.established.0, side.established.1, &name)?,
            failed: options.counter(side.failed.0, side.failed.1, &[side.label, "reason"])?,
            closed: options.counter(side.closed.0, side.closed.1, &name)?,
            open: options.gauge(side.open.0, side.open.1, &name)?,
            lifetime: options.lifetime(side.lifetime, &name)?,
        })
    }

    fn initialize(&self, name: &str, reasons: &[FailureReason]) {
        // Looking a child up creates it with a zero value.
        let _ = self.attempted.with_label_values(&[name]);
        let _ = self.established.with_label_values(&[name]);
        for reason in reasons {
            let _ = self.failed.with_label_values(&[name, reason.as_str()]);
        }
        let _ = self.closed.with_label_values(&[name]);
        let _ = self.open.with_label_values(&[name]);
        if let Some(lifetime) = &self.lifetime {
            let _ = lifetime.with_label_values(&[name]);
        }
    }

    fn report(&self, name: &str, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Attempt(_) => self.attempted.with_label_values(&[name]).inc(),
            ConnectionEvent::Failed(e) => {
                self.failed.with_label_values(&[name, e.reason.as_str()]).inc()
            }
            ConnectionEvent::Established(_) => {
                self.established.with_label_values(&[name]).inc();
                self.open.with_label_values(&[name]).inc();
            }
            ConnectionEvent::Closed(e) => {
                self.closed.with_label_values(&[name]).inc();
                self.open.with_label_values(&[name]).dec();
                if let Some(lifetime) = &self.lifetime {
                    let seconds = e.end.saturating_duration_since(e.begin).as_secs_f64();
                    lifetime.with_label_values(&[name]).observe(seconds);
                }
            }
            ConnectionEvent::AttemptFailed(_) => {}
        }
    }

    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.attempted.desc());
        descs.extend(self.established.desc());
        descs.extend(self.failed.desc());
        descs.extend(self.closed.desc());
        descs.extend(self.open.desc());
        if let Some(lifetime) = &self.lifetime {
            descs.extend(lifetime.desc());
        }
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = Vec::new();
        families.extend(self.attempted.collect());
        families.extend(self.established.collect());
        families.extend(self.failed.collect());
        families.extend(self.closed.collect());
        families.extend(self.open.collect());
        if let Some(lifetime) = &self.lifetime {
            families.extend(lifetime.collect());
        }
        families
    }
}

/// Builder for [`DialerMetrics`] and [`ListenerMetrics`].
pub struct MetricsBuilder<M> {
    options: MetricOptions,
    _kind: PhantomData<fn() -> M>,
}

impl<M> MetricsBuilder<M> {
    fn new() -> Self {
        Self { options: MetricOptions::default(), _kind: PhantomData }
    }

    /// Metric namespace (default `net`).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.options.namespace = namespace.into();
        self
    }

    /// Metric subsystem (default `conntrack`).
    pub fn subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.options.subsystem = subsystem.into();
        self
    }

    /// Fixed labels added to every metric.
    pub fn const_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.options.const_labels = labels;
        self
    }

    /// Record connection lifetimes in a histogram with the default buckets.
    /// Histograms are expensive for Prometheus to retain and query.
    pub fn lifetime_histogram(self) -> Self {
        self.lifetime_buckets(prometheus::DEFAULT_BUCKETS.to_vec())
    }

    /// Record connection lifetimes in a histogram with `buckets` (seconds).
    pub fn lifetime_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.options.lifetime_buckets = Some(buckets);
        self
    }
}

macro_rules! metrics_type {
    ($(#[$meta:meta])* $name:ident, $side:expr, $client:expr, $reasons:expr, $noun:literal) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            inner: Arc<ConnMetrics>,
        }

        impl $name {
            /// Build with default options and register into `registry`.
            ///
            /// # Errors
            /// Returns an error if the metrics cannot be registered (e.g. name conflict).
            pub fn new(registry: &Registry) -> prometheus::Result<Self> {
                Self::builder().build(registry)
            }

            pub fn builder() -> MetricsBuilder<Self> {
                MetricsBuilder::new()
            }

            #[doc = concat!("Pre-create every label set for the given ", $noun, " names, so the series exist before the first event.")]
            pub fn initialize(&self, names: &[&str]) {
                for name in names {
                    self.inner.initialize(name, $reasons);
                }
                tracing::debug!(?names, "initialized {} metrics", $noun);
            }

            /// Tracker that reports into these metrics.
            pub fn tracker(&self) -> SharedTracker {
                Arc::new(self.clone())
            }

            /// Whether the lifetime histogram is enabled.
            pub fn has_lifetime_histogram(&self) -> bool {
                self.inner.lifetime.is_some()
            }
        }

        impl MetricsBuilder<$name> {
            /// Create the metrics and register them into `registry`.
            ///
            /// # Errors
            /// Returns an error if a metric is invalid or cannot be registered.
            pub fn build(self, registry: &Registry) -> prometheus::Result<$name> {
                let metrics = $name { inner: Arc::new(ConnMetrics::new(&$side, $client, &self.options)?) };
                registry.register(Box::new(metrics.clone()))?;
                Ok(metrics)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("lifetime_histogram", &self.has_lifetime_histogram())
                    .finish()
            }
        }

        impl Collector for $name {
            fn desc(&self) -> Vec<&Desc> {
                self.inner.desc()
            }

            fn collect(&self) -> Vec<MetricFamily> {
                self.inner.collect()
            }
        }
    };
}

metrics_type!(
    /// Dialer metrics: `net_conntrack_dialer_conn_*`, labelled by `dialer_name`.
    ///
    /// The tracker reads the dialer name from the operation context and ignores listener
    /// events.
    DialerMetrics,
    DIALER,
    true,
    &FailureReason::ALL,
    "dialer"
);

metrics_type!(
    /// Listener metrics: `net_conntrack_listener_conn_*`, labelled by `listener_name`.
    ///
    /// The tracker reads the listener name from the operation context and ignores dialer
    /// events.
    ListenerMetrics,
    LISTENER,
    false,
    &[FailureReason::Unknown],
    "listener"
);

impl ConnectionTracker for DialerMetrics {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        if event.is_client() == self.inner.client {
            self.inner.report(ctx.dialer_name().unwrap_or_default(), event);
        }
    }
}

impl ConnectionTracker for ListenerMetrics {
    fn track_connection(&self, ctx: &TagContext, event: &ConnectionEvent) {
        if event.is_client() == self.inner.client {
            self.inner.report(ctx.listener_name().unwrap_or_default(), event);
        }
    }
}
