// benches/cache_bench.rs
//! Hot-path benchmarks: cache hits, pool recycling and block I/O.

use blockcache::prelude::*;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

fn bench_cache_hit(c: &mut Criterion) {
    let cache = BlockCache::new(
        CacheConfig {
            block_size: 64 * 1024,
            max_blocks: 32,
            block_type: BlockType::Memory,
        },
        Arc::new(MemoryBudget::new(64)),
    )
    .unwrap();

    let key = CacheKey::from_object("bench/obj", 1, 0, 65536);
    let warm = cache.get(&key).unwrap();
    cache.release(&warm);

    c.bench_function("cache_hit_get_release", |b| {
        b.iter(|| {
            let entry = cache.get(black_box(&key)).unwrap();
            cache.release(&entry);
        })
    });
}

fn bench_pool_recycle(c: &mut Criterion) {
    let pool = BlockPool::new(
        PoolConfig {
            block_size: 64 * 1024,
            max_blocks: 8,
            block_type: BlockType::Memory,
        },
        Arc::new(MemoryBudget::new(16)),
    )
    .unwrap();
    let ctx = CancelContext::new();

    c.bench_function("pool_get_release", |b| {
        b.iter(|| {
            let block = pool.get(&ctx).unwrap();
            pool.release(black_box(block)).unwrap();
        })
    });
}

fn bench_block_write_read(c: &mut Criterion) {
    let block = MemoryBlock::new(1024 * 1024).unwrap();
    let payload = vec![0x5Au8; 64 * 1024];
    let mut out = vec![0u8; 64 * 1024];

    c.bench_function("block_write_read_64k", |b| {
        b.iter(|| {
            block.reuse().unwrap();
            block.write(black_box(&payload)).unwrap();
            block.read_at(&mut out, 0).unwrap();
            black_box(&out);
        })
    });
}

fn bench_prefetch_slice(c: &mut Criterion) {
    let block = PrefetchBlock::new(1024 * 1024).unwrap();
    block.write(&vec![0xA5u8; 1024 * 1024]).unwrap();

    c.bench_function("prefetch_slice_64k", |b| {
        b.iter(|| {
            let view = block.read_at_slice(black_box(0), 64 * 1024).unwrap();
            black_box(view.bytes);
        })
    });
}

criterion_group!(
    benches,
    bench_cache_hit,
    bench_pool_recycle,
    bench_block_write_read,
    bench_prefetch_slice
);
criterion_main!(benches);
