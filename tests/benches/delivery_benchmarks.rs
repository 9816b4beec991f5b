//! # Transacted Delivery Benchmarks
//!
//! | Path | What is measured |
//! |------|------------------|
//! | Pool checkout | acquire + release of an idle connection |
//! | Producer send | one send committed in its own session |
//! | Batch commit | N sends committed in one session |
//! | Round trip | send + consumer poll (receive, decide, commit, sink) |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shared_bus::{InMemoryBroker, Message};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tx_delivery::{
    ConnectionResource, DeliveryConfig, HeaderFaultHandler, RecordingSink, TransactedConsumer,
    TransactedProducer,
};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn config() -> DeliveryConfig {
    DeliveryConfig {
        max_connections: 2,
        receive_timeout_ms: 5,
        ..DeliveryConfig::default()
    }
}

fn bench_pool_checkout(c: &mut Criterion) {
    let rt = runtime();
    let broker = Arc::new(InMemoryBroker::new());
    let resource = ConnectionResource::new(broker, &config()).expect("pool");

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let connection = resource.acquire().await.expect("acquire");
                black_box(connection.id());
            })
        })
    });
}

fn bench_producer(c: &mut Criterion) {
    let rt = runtime();
    let broker = Arc::new(InMemoryBroker::new());
    let resource = ConnectionResource::new(broker, &config()).expect("pool");
    let producer = TransactedProducer::new(resource, &config());

    let mut group = c.benchmark_group("producer");
    group.bench_function("send_single", |b| {
        b.iter(|| rt.block_on(producer.send(Message::new("bench"))).expect("send"))
    });

    for size in [10, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("batch_commit", size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let mut session = producer.begin().await.expect("begin");
                    for i in 0..size {
                        session
                            .send(producer.topic(), Message::new(format!("m{i}")))
                            .expect("send");
                    }
                    session.commit().await.expect("commit");
                })
            })
        });
    }
    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let broker = Arc::new(InMemoryBroker::new());
    let resource = ConnectionResource::new(broker, &config()).expect("pool");
    let sink = Arc::new(RecordingSink::new());
    let consumer = rt
        .block_on(TransactedConsumer::subscribe(
            resource.clone(),
            &config(),
            Arc::new(HeaderFaultHandler::new("isfailed")),
            sink.clone(),
        ))
        .expect("subscribe");
    let producer = TransactedProducer::new(resource, &config());

    c.bench_function("send_then_consume", |b| {
        b.iter(|| {
            rt.block_on(async {
                producer.send(Message::new("bench")).await.expect("send");
                black_box(consumer.poll_once().await.expect("poll"));
            });
            sink.reset();
        })
    });
}

criterion_group!(benches, bench_pool_checkout, bench_producer, bench_round_trip);
criterion_main!(benches);
