use conntrack::context::TagContext;
use conntrack::dialer::{DialFn, TrackedDialer};
use conntrack::listener::TrackedListener;
use conntrack_prometheus::{DialerMetrics, ListenerMetrics};
use prometheus::Registry;
use std::collections::HashMap;
use std::io;
use tokio::net::{TcpListener, TcpStream};

fn sample(registry: &Registry, family: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let families = registry.gather();
    let mf = families.iter().find(|mf| mf.get_name() == family)?;
    let metric = mf.get_metric().iter().find(|m| {
        labels.iter().all(|(name, value)| {
            m.get_label().iter().any(|l| l.get_name() == *name && l.get_value() == *value)
        })
    })?;
    if let Some(c) = metric.get_counter().as_ref() {
        return Some(c.value());
    }
    metric.get_gauge().as_ref().map(|g| g.value())
}

fn has_family(registry: &Registry, family: &str) -> bool {
    registry.gather().iter().any(|mf| mf.get_name() == family)
}

#[tokio::test]
async fn dialer_metrics_follow_connection_lifecycle() {
    let registry = Registry::new();
    let metrics = DialerMetrics::new(&registry).expect("register dialer metrics");
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let dialer = TrackedDialer::builder()
        .name("upstream")
        .tracker(metrics.tracker())
        .build()
        .unwrap();

    let ctx = TagContext::new();
    let (conn, accepted) = tokio::join!(dialer.dial(&ctx, "tcp", &addr), server.accept());
    let conn = conn.unwrap();
    let _accepted = accepted.unwrap();

    let name = [("dialer_name", "upstream")];
    assert_eq!(sample(&registry, "net_conntrack_dialer_conn_attempted_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_dialer_conn_established_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_dialer_conn_open", &name), Some(1.0));

    conn.close().await.unwrap();
    assert_eq!(sample(&registry, "net_conntrack_dialer_conn_closed_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_dialer_conn_open", &name), Some(0.0));
}

#[tokio::test]
async fn dialer_failures_are_labelled_by_reason() {
    let registry = Registry::new();
    let metrics = DialerMetrics::new(&registry).unwrap();
    metrics.initialize(&["db"]);

    let dialer = TrackedDialer::builder()
        .name("db")
        .tracker(metrics.tracker())
        .dialer(DialFn::new(|_ctx, _network, _addr| async {
            Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        }))
        .build()
        .unwrap();

    for _ in 0..2 {
        assert!(dialer.dial(&TagContext::new(), "tcp", "10.0.0.1:5432").await.is_err());
    }

    let failed = "net_conntrack_dialer_conn_failed_total";
    assert_eq!(sample(&registry, failed, &[("dialer_name", "db"), ("reason", "refused")]), Some(2.0));
    assert_eq!(sample(&registry, failed, &[("dialer_name", "db"), ("reason", "timeout")]), Some(0.0));
    assert_eq!(
        sample(&registry, "net_conntrack_dialer_conn_established_total", &[("dialer_name", "db")]),
        Some(0.0)
    );
}

#[tokio::test]
async fn dial_name_override_labels_the_series() {
    let registry = Registry::new();
    let metrics = DialerMetrics::new(&registry).unwrap();
    let dialer = TrackedDialer::builder()
        .name("configured")
        .tracker(metrics.tracker())
        .dialer(DialFn::new(|_ctx, _network, _addr| async {
            Err::<TcpStream, _>(io::Error::from(io::ErrorKind::TimedOut))
        }))
        .build()
        .unwrap();

    let ctx = TagContext::new().with_dialer_name("per-call");
    let _ = dialer.dial(&ctx, "tcp", "10.0.0.1:1").await;

    let attempted = "net_conntrack_dialer_conn_attempted_total";
    assert_eq!(sample(&registry, attempted, &[("dialer_name", "per-call")]), Some(1.0));
    assert_eq!(sample(&registry, attempted, &[("dialer_name", "configured")]), None);
}

#[tokio::test]
async fn listener_metrics_count_accepts_and_closes() {
    let registry = Registry::new();
    let metrics = ListenerMetrics::builder()
        .lifetime_histogram()
        .build(&registry)
        .unwrap();
    metrics.initialize(&["http"]);

    let listener = TrackedListener::builder(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .name("http")
        .tracker(metrics.tracker())
        .build()
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (accepted, client) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let conn = accepted.unwrap();
    let _client = client.unwrap();

    let name = [("listener_name", "http")];
    assert_eq!(sample(&registry, "net_conntrack_listener_conn_attempted_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_listener_conn_accepted_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_listener_conn_open", &name), Some(1.0));
    assert_eq!(
        sample(
            &registry,
            "net_conntrack_listener_conn_failed_total",
            &[("listener_name", "http"), ("reason", "unknown")]
        ),
        Some(0.0)
    );

    drop(conn);
    assert_eq!(sample(&registry, "net_conntrack_listener_conn_closed_total", &name), Some(1.0));
    assert_eq!(sample(&registry, "net_conntrack_listener_conn_open", &name), Some(0.0));
    assert!(has_family(&registry, "net_conntrack_listener_conn_lifetime_seconds"));
}

#[tokio::test]
async fn listener_metrics_ignore_dialer_events() {
    let registry = Registry::new();
    let metrics = ListenerMetrics::new(&registry).unwrap();
    let dialer = TrackedDialer::builder()
        .tracker(metrics.tracker())
        .dialer(DialFn::new(|_ctx, _network, _addr| async {
            Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        }))
        .build()
        .unwrap();

    let _ = dialer.dial(&TagContext::new(), "tcp", "10.0.0.1:1").await;
    for name in ["", "default"] {
        let labels = [("listener_name", name)];
        assert_eq!(sample(&registry, "net_conntrack_listener_conn_attempted_total", &labels), None);
    }
}

#[test]
fn namespace_subsystem_and_const_labels_apply() {
    let registry = Registry::new();
    let labels = HashMap::from([("cluster".to_string(), "eu-1".to_string())]);
    let metrics = DialerMetrics::builder()
        .namespace("app")
        .subsystem("net")
        .const_labels(labels)
        .build(&registry)
        .unwrap();
    metrics.initialize(&["x"]);

    assert_eq!(
        sample(
            &registry,
            "app_net_dialer_conn_attempted_total",
            &[("dialer_name", "x"), ("cluster", "eu-1")]
        ),
        Some(0.0)
    );
}
