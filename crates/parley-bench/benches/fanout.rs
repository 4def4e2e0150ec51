//! Fanout benchmarks for Parley.
//!
//! These benchmarks drive the relay over the in-process store and in-memory
//! peers, so they measure the engine without network or redis round trips.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_core::{
    ChannelSubscriber, ChatSession, MemoryStore, PeerKey, PresenceStore, Relay, RelayStats,
    SessionRegistry,
};
use parley_protocol::{codec, Envelope};
use parley_transport::memory::{self, MemoryClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Register `size` members of `channel` and return a subscriber for it.
fn populated_subscriber(
    rt: &Runtime,
    channel: &str,
    size: usize,
) -> (ChannelSubscriber, Vec<MemoryClient>) {
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(SessionRegistry::new());
    let mut clients = Vec::with_capacity(size);

    rt.block_on(async {
        for i in 0..size {
            let user = format!("user-{}", i);
            store.create_user(&user).await.unwrap();
            store.join_channel(channel, &user).await.unwrap();

            let (sink, _stream, client) = memory::pair();
            sessions.register(PeerKey::new(channel, user), sink);
            clients.push(client);
        }
    });

    let subscriber = ChannelSubscriber::new(
        channel,
        store,
        sessions,
        Arc::new(RelayStats::new()),
        Duration::from_secs(5),
    );
    (subscriber, clients)
}

/// Benchmark one published envelope reaching every member.
fn bench_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatch");

    let envelope = Envelope::text("bench", "publisher", "x".repeat(64), 0);
    let payload = codec::encode(&envelope).unwrap();

    for size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (subscriber, mut clients) = populated_subscriber(&rt, "bench", size);

            b.iter_custom(|iters| {
                let start = Instant::now();
                rt.block_on(async {
                    for _ in 0..iters {
                        subscriber.dispatch(black_box(&payload)).await;
                    }
                });
                let elapsed = start.elapsed();

                for client in &mut clients {
                    client.drain();
                }
                elapsed
            });
        });
    }

    group.finish();
}

/// Benchmark a full join and leave against a warm channel.
fn bench_session(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("session");

    let relay = Arc::new(Relay::new(Arc::new(MemoryStore::new())));

    group.bench_function("join_leave", |b| {
        b.to_async(&rt).iter(|| {
            let relay = Arc::clone(&relay);
            async move {
                let (sink, _stream, _client) = memory::pair();
                let mut session = ChatSession::new(relay, "bench-user", "bench", sink);
                session.start().await.unwrap();
                session.disconnect().await;
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch, bench_session);
criterion_main!(benches);
