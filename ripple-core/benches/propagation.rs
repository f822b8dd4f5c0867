//! Benchmarks for change propagation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_core::{Raw, Runtime, Value};

fn bench_signal_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("signal_fanout");
    for width in [1usize, 16, 256] {
        let rt = Runtime::new();
        let source = rt.signal(0u64);
        let effects: Vec<_> = (0..width)
            .map(|_| {
                let source = source.clone();
                rt.watch_effect(move || {
                    black_box(source.get());
                })
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                source.set(n);
            })
        });
        for effect in effects {
            effect.stop();
        }
    }
    group.finish();
}

fn bench_computed_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("computed_chain");
    for depth in [4usize, 64] {
        let rt = Runtime::new();
        let source = rt.signal(0u64);
        let mut tail = {
            let source = source.clone();
            rt.computed(move |_| source.get())
        };
        for _ in 1..depth {
            let prev = tail.clone();
            tail = rt.computed(move |_| prev.get() + 1);
        }
        let _effect = {
            let tail = tail.clone();
            rt.watch_effect(move || {
                black_box(tail.get());
            })
        };

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                source.set(n);
            })
        });
    }
    group.finish();
}

fn bench_container_writes(c: &mut Criterion) {
    let rt = Runtime::new();
    let state = rt.reactive(Raw::object([("count", 0)]));
    let _effect = {
        let state = state.clone();
        rt.watch_effect(move || {
            black_box(state.get("count").ok());
        })
    };

    c.bench_function("container_set_tracked", |b| {
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            state.set("count", black_box(n)).ok();
        })
    });

    c.bench_function("container_batch_of_16", |b| {
        let mut n = 0i64;
        b.iter(|| {
            rt.batch(|| {
                for _ in 0..16 {
                    n += 1;
                    state.set("count", n).ok();
                }
            })
        })
    });
}

fn bench_diff(c: &mut Criterion) {
    let rt = Runtime::new();
    let items: Vec<Value> = (0..512).map(|i| Value::object([("id", i)])).collect();
    let old = Value::list(items.clone());
    let mut shuffled = items;
    shuffled.remove(100);
    shuffled.insert(400, Value::object([("id", -1)]));
    let new = Value::list(shuffled);

    c.bench_function("diff_512_items", |b| {
        b.iter(|| black_box(rt.diff(black_box(&old), black_box(&new))))
    });
}

criterion_group!(
    benches,
    bench_signal_fanout,
    bench_computed_chain,
    bench_container_writes,
    bench_diff
);
criterion_main!(benches);
