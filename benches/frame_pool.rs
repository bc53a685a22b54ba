use criterion::{criterion_group, criterion_main, Criterion};

use xskfwd::frame_pool::FramePool;
use xskfwd::{FRAME_SIZE, NUM_FRAMES};

fn churn(pool: &mut FramePool, held: &mut Vec<u64>) {
    while let Some(addr) = pool.alloc() {
        held.push(addr);
    }
    while let Some(addr) = held.pop() {
        pool.free(addr).unwrap();
    }
}

fn test(c: &mut Criterion) {
    let mut pool = FramePool::new(NUM_FRAMES, FRAME_SIZE);
    let mut held = Vec::with_capacity(NUM_FRAMES as usize);

    c.bench_function("alloc_free_churn", |b| b.iter(|| churn(&mut pool, &mut held)));
}

criterion_group!(benches, test);
criterion_main!(benches);
