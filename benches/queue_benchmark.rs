//! Performance benchmarks for taskbus
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::time::Duration;
use taskbus::{
    Broker, BusConfig, HandlerRegistry, InMemoryBroker, PriorityClass, PriorityScheduler,
    PriorityWeights, QueueConfig, RouteRule, SubmitOptions, TaskBus, TaskContext, TaskEnvelope,
};
use tokio::runtime::Runtime;

fn bench_config(slots: usize) -> BusConfig {
    let mut config = BusConfig::empty()
        .with_queue("bench", QueueConfig::new(PriorityClass::Default))
        .with_route(RouteRule::new("bench", "bench"));
    config.worker.slots = slots;
    config.worker.poll_interval = Duration::from_millis(1);
    config
}

async fn wait_until_idle(bus: &TaskBus) {
    loop {
        let stats = bus.stats().await.unwrap();
        if stats.total_pending == 0 && stats.total_leased == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn bench_submit_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("submit_throughput");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                let bus = TaskBus::connect(bench_config(1)).await.unwrap();
                for i in 0..size {
                    bus.submit("bench", json!({"id": i}), SubmitOptions::default())
                        .await
                        .unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_lease_ack_cycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("lease_ack_cycle");
    group.throughput(Throughput::Elements(100));
    group.bench_function("100_tasks", |b| {
        b.to_async(&rt).iter(|| async {
            let broker = InMemoryBroker::new();
            broker
                .declare_queue("bench", PriorityClass::Default, None)
                .await
                .unwrap();
            for i in 0..100 {
                let envelope =
                    TaskEnvelope::new("bench", json!({"id": i}), "bench", PriorityClass::Default);
                broker.enqueue(envelope).await.unwrap();
            }
            while let Some(lease) = broker
                .lease("bench", "bench-worker", Duration::from_secs(30))
                .await
                .unwrap()
            {
                broker.acknowledge(lease.id()).await.unwrap();
            }
        });
    });

    group.finish();
}

fn bench_worker_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("worker_dispatch");

    for slots in [1, 5, 10, 20].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(slots), slots, |b, &slots| {
            b.to_async(&rt).iter(|| async move {
                let bus = TaskBus::connect(bench_config(slots)).await.unwrap();
                let mut registry = HandlerRegistry::new();
                registry
                    .register_fn("bench", |ctx: TaskContext| async move {
                        // 100 microseconds of work
                        tokio::time::sleep(Duration::from_micros(100)).await;
                        Ok(json!({"id": ctx.payload()["id"].clone()}))
                    })
                    .unwrap();
                let pool = bus.worker_pool(registry).build().unwrap();

                for i in 0..100 {
                    bus.submit("bench", json!({"id": i}), SubmitOptions::default())
                        .await
                        .unwrap();
                }
                pool.start().await;
                wait_until_idle(&bus).await;
                pool.drain(Duration::from_secs(5)).await.unwrap();
            });
        });
    }

    group.finish();
}

fn bench_priority_scheduling(c: &mut Criterion) {
    let queues = vec![
        ("critical".to_string(), PriorityClass::High),
        ("mail".to_string(), PriorityClass::Default),
        ("webhooks".to_string(), PriorityClass::Default),
        ("reports".to_string(), PriorityClass::Low),
    ];

    c.bench_function("priority_scheduling", |b| {
        let mut scheduler = PriorityScheduler::new(PriorityWeights::default(), queues.clone());
        b.iter(|| scheduler.next_cycle());
    });
}

criterion_group!(
    benches,
    bench_submit_throughput,
    bench_lease_ack_cycle,
    bench_worker_dispatch,
    bench_priority_scheduling
);
criterion_main!(benches);
