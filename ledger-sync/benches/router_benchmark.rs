use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ledger_sync::protocol::Envelope;
use ledger_sync::router::EventRouter;
use serde_json::json;

fn counting_router(kinds: usize, per_kind: usize, wildcards: usize) -> (EventRouter, Arc<AtomicU64>) {
    let router = EventRouter::new();
    let hits = Arc::new(AtomicU64::new(0));
    for k in 0..kinds {
        for _ in 0..per_kind {
            let hits = hits.clone();
            router.subscribe(format!("kind_{k}"), move |_| {
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
    }
    for _ in 0..wildcards {
        let hits = hits.clone();
        router.subscribe_all(move |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
    }
    (router, hits)
}

fn bench_envelope_decode(c: &mut Criterion) {
    let frame = json!({
        "type": "customer_updated",
        "data": {"id": 42, "name": "Acme Ltd", "balance": "1200.50", "tags": ["wholesale"]}
    })
    .to_string();

    c.bench_function("envelope_decode", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&frame)).unwrap());
        })
    });
}

fn bench_dispatch_fanout(c: &mut Criterion) {
    let envelope = Envelope::with_data("kind_0", json!({"id": 1}));
    let mut group = c.benchmark_group("dispatch_fanout");

    for listeners in [1usize, 10, 100] {
        let (router, _hits) = counting_router(1, listeners, 0);
        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, _| {
            b.iter(|| black_box(router.dispatch(black_box(&envelope))));
        });
    }
    group.finish();
}

fn bench_dispatch_with_wildcards(c: &mut Criterion) {
    let (router, _hits) = counting_router(50, 2, 5);
    let envelope = Envelope::with_data("kind_25", json!({"id": 1}));

    c.bench_function("dispatch_50_kinds_5_wildcards", |b| {
        b.iter(|| black_box(router.dispatch(black_box(&envelope))));
    });
}

fn bench_dispatch_unmatched(c: &mut Criterion) {
    let (router, _hits) = counting_router(50, 2, 0);
    let envelope = Envelope::with_data("nobody_listens", json!({"id": 1}));

    c.bench_function("dispatch_unmatched", |b| {
        b.iter(|| black_box(router.dispatch(black_box(&envelope))));
    });
}

criterion_group!(
    benches,
    bench_envelope_decode,
    bench_dispatch_fanout,
    bench_dispatch_with_wildcards,
    bench_dispatch_unmatched,
);
criterion_main!(benches);
