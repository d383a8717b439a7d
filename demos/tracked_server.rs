//! Echo server and client, both tracked and logged through `tracing`.
//!
//! Run with `RUST_LOG=debug cargo run --example tracked_server`.
use conntrack::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let memory = MemoryTracker::new();
    let trackers: Vec<SharedTracker> = vec![Arc::new(LogTracker::new()), Arc::new(memory.clone())];

    let listener = TrackedListener::builder(TcpListener::bind("127.0.0.1:0").await?)
        .name("echo")
        .trackers(trackers.clone())
        .retry(
            AcceptRetry::builder()
                .backoff(Backoff::exponential(Duration::from_millis(5)).with_max(Duration::from_secs(1))?)
                .jitter(Jitter::full())
                .build()?,
        )
        .tcp_keepalive(Duration::from_secs(180))
        .build()?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let mut conn = listener.accept().await?;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = conn.close().await;
            });
        }
        Ok::<_, std::io::Error>(())
    });

    let dialer = TrackedDialer::builder()
        .name("echo-client")
        .trackers(trackers)
        .dialer(TcpDialer::new().connect_timeout(Duration::from_secs(2)).nodelay(true))
        .build()?;

    for i in 0..3 {
        let ctx = TagContext::new().with_dialer_name(format!("echo-client-{i}"));
        let mut conn = dialer.dial(&ctx, "tcp", &addr.to_string()).await?;
        conn.write_all(b"hello").await?;
        let mut reply = [0u8; 5];
        conn.read_exact(&mut reply).await?;
        conn.close().await?;
    }
    server.await??;

    // A dial nobody answers.
    if let Err(err) = dialer.dial(&TagContext::new(), "tcp", "127.0.0.1:1").await {
        println!("expected failure: {err}");
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    for event in memory.events() {
        println!("{event}");
    }
    Ok(())
}
