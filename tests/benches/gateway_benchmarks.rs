//! # Stream Gateway Benchmarks
//!
//! | Path | Operation |
//! |------|-----------|
//! | Codec | encode / decode one prediction envelope |
//! | Subjects | pattern match against a concrete subject |
//! | Registry | resolve a subject across the platform catalog |
//! | In-memory bus | publish with and without a dedup key |

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use gw_tests::integration::fixtures;
use shared_bus::{InMemoryBus, StreamBus};
use shared_types::{ModelType, Subject, SubjectPattern};
use stream_gateway::{catalog, codec, StreamRegistry};

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let event = fixtures::prediction("AAPL", ModelType::Earnings);
    let bytes = codec::encode(&event).unwrap();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("encode_prediction", |b| {
        b.iter(|| codec::encode(black_box(&event)).unwrap())
    });
    group.bench_function("decode_prediction", |b| {
        b.iter(|| codec::decode(black_box(&bytes)).unwrap())
    });
    group.finish();
}

fn bench_subject_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("subjects");
    let subject = Subject::new("explanations.result.AAPL").unwrap();
    for raw in ["explanations.result.AAPL", "explanations.*.AAPL", "explanations.>"] {
        let pattern = SubjectPattern::new(raw).unwrap();
        group.bench_function(format!("match {raw}"), |b| {
            b.iter(|| black_box(&pattern).matches(black_box(&subject)))
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = StreamRegistry::new(Arc::new(InMemoryBus::new()));
    runtime
        .block_on(registry.declare_all(catalog::platform_streams("dlq").unwrap()))
        .unwrap();
    let subject = Subject::new("predictions.earnings.NVDA").unwrap();

    c.bench_function("registry/resolve", |b| {
        b.iter(|| registry.resolve(black_box(&subject)).unwrap())
    });
}

fn bench_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let bus = InMemoryBus::new();
    let routing = catalog::platform_streams("dlq")
        .unwrap()
        .into_iter()
        .find(|s| s.name == catalog::ROUTING)
        .unwrap();
    runtime.block_on(bus.declare_stream(&routing)).unwrap();
    let event = fixtures::routing("AAPL");
    let payload = codec::encode(&event).unwrap();

    let mut group = c.benchmark_group("in_memory_bus");
    group.bench_function("publish", |b| {
        b.iter(|| {
            runtime
                .block_on(bus.publish(&event.subject, payload.clone(), None))
                .unwrap()
        })
    });
    group.bench_function("publish_duplicate", |b| {
        b.iter(|| {
            runtime
                .block_on(bus.publish(&event.subject, payload.clone(), Some("same-key")))
                .unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_subject_matching,
    bench_resolve,
    bench_publish
);
criterion_main!(benches);
