//! Performance benchmarks for nimbus-event
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use nimbus_event::transport::memory::MemoryBroker;
use nimbus_event::{BusConfig, EntityOperation, EventBus, EventRecord, EventScope};

fn bench_record_creation(c: &mut Criterion) {
    c.bench_function("EventRecord::new", |b| {
        b.iter(|| {
            EventRecord::new("ctx-bench", 1, "account", "account", 42, EntityOperation::Update)
                .with_user(7)
                .with_inputs(serde_json::json!({"displayName": "gateway-01"}))
        });
    });

    c.bench_function("EventScope begin/end", |b| {
        b.iter(|| {
            let mut scope = EventScope::new();
            let frame = scope.begin();
            frame.service = "account".to_string();
            frame.entity_id = 42;
            scope.end();
        });
    });
}

fn bench_record_serialization(c: &mut Criterion) {
    let record = EventRecord::new("ctx-bench", 1, "device", "device", 33, EntityOperation::Create)
        .with_inputs(serde_json::json!({"displayName": "gateway-01", "clientId": "client-7"}));

    c.bench_function("EventRecord serialize", |b| {
        b.iter(|| serde_json::to_vec(&record).unwrap());
    });

    let bytes = serde_json::to_vec(&record).unwrap();
    c.bench_function("EventRecord deserialize", |b| {
        b.iter(|| serde_json::from_slice::<EventRecord>(&bytes).unwrap());
    });
}

fn bench_memory_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let bus = rt.block_on(async {
        let bus = EventBus::new(MemoryBroker::new(), BusConfig::default());
        bus.start().await.unwrap();
        bus
    });
    let record = EventRecord::new("ctx-bench", 1, "account", "account", 1, EntityOperation::Update);

    c.bench_function("EventBus publish (memory)", |b| {
        b.to_async(&rt)
            .iter(|| async { bus.publish("account", &record).await.unwrap() });
    });
}

fn bench_memory_publish_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let bus = rt.block_on(async {
        let bus = EventBus::new(MemoryBroker::new(), BusConfig::default());
        bus.start().await.unwrap();
        bus
    });

    let mut group = c.benchmark_group("publish_throughput");
    for count in [10, 100, 1000] {
        let record =
            EventRecord::new("ctx-bench", 1, "account", "account", 1, EntityOperation::Update);
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| {
                let record = record.clone();
                async {
                    for _ in 0..count {
                        bus.publish("account", &record).await.unwrap();
                    }
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_record_creation,
    bench_record_serialization,
    bench_memory_publish,
    bench_memory_publish_throughput,
);
criterion_main!(benches);
