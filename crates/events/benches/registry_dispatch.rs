use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::collections::BTreeMap;

use chrono::Utc;
use streamhost_core::{EventPosition, PartitionId};
use streamhost_events::{
    handler_fn, matches, InboundMessage, SubscriptionHandle, SubscriptionRegistry, TopicFilter,
};

/// Registry with `count` device-scoped subscriptions plus a few wide ones.
fn populated_registry(count: usize) -> (SubscriptionRegistry, Vec<SubscriptionHandle>) {
    let registry = SubscriptionRegistry::new();
    let mut handles = Vec::with_capacity(count + 2);
    for i in 0..count {
        handles.push(
            registry
                .subscribe(
                    &format!("devices/dev-{i}/+/+"),
                    handler_fn(|_msg| async { Ok(()) }),
                )
                .unwrap(),
        );
    }
    handles.push(registry.subscribe("devices/#", handler_fn(|_msg| async { Ok(()) })).unwrap());
    handles.push(registry.subscribe("site/+/temp", handler_fn(|_msg| async { Ok(()) })).unwrap());
    (registry, handles)
}

fn bench_filter_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_matching");
    group.throughput(Throughput::Elements(1));

    let cases = [
        ("exact", "devices/dev-1/messages/events"),
        ("single_level", "devices/+/messages/+"),
        ("multi_level", "devices/#"),
        ("miss", "site/+/humidity"),
    ];
    let topic = "devices/dev-1/messages/events";

    for (name, pattern) in cases {
        let filter = TopicFilter::parse(pattern).unwrap();
        group.bench_with_input(BenchmarkId::new("parsed", name), &filter, |b, filter| {
            b.iter(|| filter.matches(black_box(topic)));
        });
        group.bench_with_input(BenchmarkId::new("unparsed", name), &pattern, |b, pattern| {
            b.iter(|| matches(black_box(pattern), black_box(topic)));
        });
    }

    group.finish();
}

fn bench_dispatch_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_lookup");

    for count in [10usize, 100, 500] {
        let (registry, _handles) = populated_registry(count);
        group.throughput(Throughput::Elements(count as u64 + 2));
        group.bench_with_input(BenchmarkId::from_parameter(count), &registry, |b, registry| {
            b.iter(|| registry.dispatch(black_box("devices/dev-7/messages/events")));
        });
    }

    group.finish();
}

fn bench_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("deliver");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let message = InboundMessage::new(
        "devices/dev-7/messages/events",
        br#"{"temperature":21.5}"#.to_vec(),
        "application/json",
        "utf-8",
        BTreeMap::new(),
        PartitionId::from_index(0),
        EventPosition::new("0", 0, Utc::now()),
    );

    for count in [10usize, 100] {
        let (registry, _handles) = populated_registry(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &registry, |b, registry| {
            b.iter(|| runtime.block_on(registry.deliver(black_box(&message))).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_filter_matching, bench_dispatch_lookup, bench_deliver);
criterion_main!(benches);
