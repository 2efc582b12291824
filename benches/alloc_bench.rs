//! Benchmarks for the allocation and lookup hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use accel_mem::config::Config;
use accel_mem::{MemoryKind, Precision, Runtime, ShapeKey};

fn bench_alloc_free(c: &mut Criterion) {
    let (rt, _sim) = Runtime::simulated(Config::default(), 1, 1 << 30).unwrap();

    c.bench_function("alloc_free_4kb", |b| {
        b.iter(|| {
            let block = rt
                .allocate(0, black_box(4096), MemoryKind::DeviceLocal, false)
                .unwrap();
            black_box(block.free().unwrap());
        })
    });
}

fn bench_add_free_ref(c: &mut Criterion) {
    let (rt, _sim) = Runtime::simulated(Config::default(), 1, 1 << 20).unwrap();
    let block = rt.allocate(0, 64, MemoryKind::DeviceLocal, false).unwrap();

    c.bench_function("add_ref_free_ref", |b| {
        b.iter(|| {
            let owner = block.add_ref().unwrap();
            black_box(owner.free().unwrap());
        })
    });
    block.free().unwrap();
}

fn bench_cache_hit(c: &mut Criterion) {
    let (rt, _sim) = Runtime::simulated(Config::default(), 1, 1 << 30).unwrap();
    let key = ShapeKey::conv2d(
        0,
        Precision::Half,
        [32, 64, 56, 56],
        [64, 64, 3, 3],
        [1, 1],
        [1, 1],
    );
    drop(rt.lookup(&key).unwrap());

    c.bench_function("descriptor_cache_hit", |b| {
        b.iter(|| black_box(rt.lookup(black_box(&key)).unwrap()))
    });
}

fn bench_write_read_half(c: &mut Criterion) {
    let (rt, _sim) = Runtime::simulated(Config::default(), 1, 1 << 30).unwrap();
    let block = rt.allocate(0, 128 * 1024, MemoryKind::DeviceLocal, false).unwrap();
    let data: Vec<f32> = (0..64 * 1024).map(|i| i as f32 * 0.01).collect();
    let mut out = vec![0f32; data.len()];

    c.bench_function("write_read_64k_f32_as_half", |b| {
        b.iter(|| {
            block.write(Precision::Half, black_box(&data), 0).unwrap();
            block.read(Precision::Half, &mut out, 0).unwrap();
            black_box(out[0]);
        })
    });
    block.free().unwrap();
}

criterion_group!(
    benches,
    bench_alloc_free,
    bench_add_free_ref,
    bench_cache_hit,
    bench_write_read_half,
);
criterion_main!(benches);
