use conntrack::prelude::*;
use conntrack::event::ConnectionAttempt;
use conntrack::tracker::NullTracker;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;

// Counts events; stands in for a cheap metrics tracker.
#[derive(Default)]
struct CountingTracker {
    events: AtomicUsize,
}

impl ConnectionTracker for CountingTracker {
    fn track_connection(&self, _ctx: &TagContext, _event: &ConnectionEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }
}

fn attempt() -> ConnectionEvent {
    ConnectionEvent::Attempt(ConnectionAttempt { client: true, attempt: 1, begin: Instant::now() })
}

fn chain_dispatch(c: &mut Criterion) {
    let event = attempt();
    let ctx = TagContext::new().with_dialer_name("bench");

    for width in [1usize, 4, 16] {
        let tracker = chain((0..width).map(|_| Arc::new(CountingTracker::default()) as SharedTracker));
        c.bench_function(&format!("chain_dispatch_{width}"), |b| {
            b.iter(|| tracker.track_connection(black_box(&ctx), black_box(&event)));
        });
    }
}

fn chain_tagging(c: &mut Criterion) {
    let memory = MemoryTracker::with_capacity(16);
    let tracker = chain([
        Arc::new(LogTracker::new()) as SharedTracker,
        Arc::new(memory) as SharedTracker,
        Arc::new(NullTracker) as SharedTracker,
    ]);
    let info = DialerTagInfo { name: "bench".into(), network: "tcp".into(), addr: "10.0.0.1:80".into() };

    c.bench_function("chain_tag_dialer", |b| {
        b.iter(|| conntrack::tracker::tag_dialer(tracker.as_ref(), TagContext::new(), black_box(&info)));
    });
}

fn tracked_failed_dial(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dialer = TrackedDialer::builder()
        .tracker(Arc::new(CountingTracker::default()))
        .dialer(DialFn::new(|_ctx, _network, _addr| async {
            Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        }))
        .build()
        .unwrap();

    c.bench_function("tracked_failed_dial", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(dialer.dial(&TagContext::new(), "tcp", "10.0.0.1:1").await);
        });
    });
}

criterion_group!(benches, chain_dispatch, chain_tagging, tracked_failed_dial);
criterion_main!(benches);
