//! End-to-end fanout benchmark for Parley.
//!
//! Connects N WebSocket clients to one channel of a running server; every
//! client sends as fast as it can and counts what the others deliver to it.

use futures_util::{SinkExt, StreamExt};
use parley_protocol::Envelope;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const CHANNEL: &str = "bench";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("Parley fanout benchmark against {}", SERVER_URL);
    println!("(start the server first: cargo run --release -p parley-server)");
    println!();

    run_fanout_benchmark(num_clients).await;
}

async fn run_fanout_benchmark(num_clients: usize) {
    println!("{} clients in #{}", num_clients, CHANNEL);
    println!("warmup {}s, measurement {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let sent_count = Arc::new(AtomicU64::new(0));
    let received_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let sent = Arc::clone(&sent_count);
        let received = Arc::clone(&received_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(client_id, sent, received, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to join
    barrier.wait().await;
    println!("all {} clients joined", num_clients);

    println!("warming up...");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    sent_count.store(0, Ordering::SeqCst);
    received_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("measuring...");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_sent = sent_count.load(Ordering::SeqCst);
    let total_received = received_count.load(Ordering::SeqCst);

    let delivered_per_sec = total_received as f64 / elapsed.as_secs_f64();
    // Each message should reach every other client.
    let expected = total_sent * (num_clients as u64).saturating_sub(1);

    let report = [
        ("clients", num_clients.to_string()),
        ("duration", format!("{:.2}s", elapsed.as_secs_f64())),
        ("sent", total_sent.to_string()),
        ("delivered", total_received.to_string()),
        ("expected", expected.to_string()),
        ("delivery rate", format!("{:.0} msg/s", delivered_per_sec)),
    ];

    println!();
    println!("Results");
    for (label, value) in report {
        println!("  {:<14} {:>16}", label, value);
    }
    println!();

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let user = format!("bench-{}", client_id);
    let url = format!("{}?user={}&channel={}", SERVER_URL, user, CHANNEL);

    let (ws, _) = connect_async(url.as_str()).await?;
    let (mut sender, mut receiver) = ws.split();

    // The welcome arrives once the join completed
    match receiver.next().await {
        Some(Ok(Message::Text(_welcome))) => {}
        other => return Err(format!("no welcome for {}: {:?}", user, other).into()),
    }

    barrier.wait().await;

    let body = Envelope {
        content: "x".repeat(64),
        ..Envelope::default()
    };
    let outgoing = Message::Text(parley_protocol::encode(&body)?);

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            if let Ok(Message::Text(_)) = result {
                received.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    loop {
        if sender.send(outgoing.clone()).await.is_err() {
            break;
        }
        sent.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
